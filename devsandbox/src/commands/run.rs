//! The main session: bring up the proxy stack, plan the mounts, launch
//! the payload under the chosen isolation backend, and guarantee teardown
//! on every exit path.

use crate::observability;
use anyhow::{Context, Result};
use devsandbox_core::config::schema::{Config, IsolationKind, ShellKind};
use devsandbox_core::paths::{SandboxMetadata, SandboxPaths};
use devsandbox_proxy::ask::AskChannel;
use devsandbox_proxy::ca::CertAuthority;
use devsandbox_proxy::filter::FilterEngine;
use devsandbox_proxy::inject::InjectorSet;
use devsandbox_proxy::redact::Redactor;
use devsandbox_proxy::reqlog::{LogSink, RequestLogWriter};
use devsandbox_proxy::server::{ProxyServer, ProxyState};
use devsandbox_sandbox::backend::bwrap::{proxy_only_prelude, BwrapBackend};
use devsandbox_sandbox::backend::docker::DockerBackend;
use devsandbox_sandbox::backend::IsolationBackend;
use devsandbox_sandbox::network::{self, NetworkProvider};
use devsandbox_sandbox::planner::{self, PlannerInput, ProxyEndpoint};
use devsandbox_sandbox::shell;
use devsandbox_sandbox::supervisor::{Supervisor, TeardownGuard};
use devsandbox_sandbox::tools::{ToolContext, ToolRegistry};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub struct RunArgs {
    pub project_dir: PathBuf,
    pub no_proxy: bool,
    pub shell: Option<String>,
    pub backend: Option<String>,
    pub command: Vec<String>,
}

pub fn run(args: RunArgs) -> Result<i32> {
    let (mut config, _store) = super::compose_config(&args.project_dir)?;
    apply_overrides(&mut config, &args)?;

    let shell = config.shell();
    let isolation = config.isolation();
    let proxied = config.proxy_enabled() && !args.no_proxy;

    let paths = SandboxPaths::for_project(&args.project_dir);
    paths.ensure_layout()?;
    observability::set_internal_log_dir(&paths.internal_log_dir());
    SandboxMetadata::load_or_create(&paths, shell.as_str(), isolation.as_str())?;

    let home_dir = dirs::home_dir().context("cannot determine home directory")?;
    let registry = ToolRegistry::builtin(&config);

    let supervisor = Supervisor::new();
    supervisor.install_signal_handlers()?;
    let _guard = TeardownGuard::new(Arc::clone(&supervisor));

    // Networking helper slot: filled after the payload is spawned, torn
    // down by the supervisor either way.
    let provider: Arc<Mutex<Option<Box<dyn NetworkProvider>>>> = Arc::new(Mutex::new(None));
    {
        let provider = Arc::clone(&provider);
        supervisor.on_teardown("network helper", move || {
            if let Some(mut p) = provider.lock().unwrap_or_else(|e| e.into_inner()).take() {
                p.stop();
            }
        });
    }

    let proxy_endpoint = if proxied {
        Some(start_proxy_stack(
            &config,
            &paths,
            &supervisor,
            isolation,
        )?)
    } else {
        None
    };

    // Active tools run for the whole session.
    let mut active_env = Vec::new();
    {
        let ctx = ToolContext {
            home_dir: &home_dir,
            sandbox_root: paths.root(),
        };
        for tool in registry.available_tools(&home_dir) {
            let Some(mut active) = tool.active() else {
                continue;
            };
            let name = tool.name();
            let env = active
                .start(&ctx)
                .with_context(|| format!("start active tool {name}"))?;
            active_env.extend(env.into_iter().map(|e| (name.to_string(), e)));
            supervisor.on_teardown(format!("active tool {name}"), move || {
                active.stop();
            });
        }
    }

    let mut planned = planner::build_plan(&PlannerInput {
        paths: &paths,
        config: &config,
        registry: &registry,
        home_dir: home_dir.clone(),
        proxy: proxy_endpoint.clone(),
    })?;
    for (tool, env) in &active_env {
        planned
            .plan
            .set_env(&env.name, &env.value, &format!("active:{tool}"))?;
    }

    let payload = shell::compose(shell, paths.name(), &planned.shell_inits, &args.command);

    let status = match isolation {
        IsolationKind::Namespace => {
            let mut backend = BwrapBackend::detect()?;
            backend.unshare_net = proxied;
            if let Some(endpoint) = &proxy_endpoint {
                backend.network_prelude = Some(proxy_only_prelude(&endpoint.gateway_ip));
            }
            let mut cmd = backend.command(&planned.plan, &payload)?;
            let mut child = cmd.spawn().context("spawn sandbox")?;

            if proxied {
                let mut helper = network::select_provider()?;
                if !helper.maps_host_loopback() {
                    let _ = child.kill();
                    anyhow::bail!(
                        "network helper {} cannot map the gateway to the host loopback; \
                         the proxy would be unreachable",
                        helper.name()
                    );
                }
                if let Err(err) = helper.start(child.id()) {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(err.context("attach user-mode networking"));
                }
                *provider.lock().unwrap_or_else(|e| e.into_inner()) = Some(helper);
            }

            child.wait().context("wait for sandbox")?
        }
        IsolationKind::Container => {
            let mut backend = DockerBackend::detect(paths.name())?;
            if let Some(image) = &config.sandbox.docker.image {
                backend.image = image.clone();
            }
            backend.dockerfile = config
                .sandbox
                .docker
                .dockerfile
                .as_ref()
                .map(|f| devsandbox_core::pathglob::expand_tilde(f));
            backend.extra_args = config.sandbox.docker.extra_args.clone();
            if proxy_endpoint.is_some() {
                // The proxy listens on the host; give the container a name
                // for the host gateway.
                backend
                    .extra_args
                    .push("--add-host=host.docker.internal:host-gateway".to_string());
            }
            for tool in registry.available_tools(&home_dir) {
                backend.cache_mounts.extend(tool.cache_mounts());
            }
            let mut cmd = backend.command(&planned.plan, &payload)?;
            let mut child = cmd.spawn().context("spawn container exec")?;
            child.wait().context("wait for container exec")?
        }
    };

    supervisor.teardown();
    Ok(status.code().unwrap_or(1))
}

fn apply_overrides(config: &mut Config, args: &RunArgs) -> Result<()> {
    if let Some(shell) = &args.shell {
        config.sandbox.shell = Some(match shell.as_str() {
            "bash" => ShellKind::Bash,
            "zsh" => ShellKind::Zsh,
            "fish" => ShellKind::Fish,
            other => anyhow::bail!("unknown shell {other:?} (bash, zsh, fish)"),
        });
    }
    if let Some(backend) = &args.backend {
        config.sandbox.isolation = Some(match backend.as_str() {
            "namespace" => IsolationKind::Namespace,
            "container" => IsolationKind::Container,
            other => anyhow::bail!("unknown backend {other:?} (namespace, container)"),
        });
    }
    Ok(())
}

/// CA, ask channel, request log, and the proxy server itself, with their
/// teardown hooks registered in dependency order.
fn start_proxy_stack(
    config: &Config,
    paths: &SandboxPaths,
    supervisor: &Arc<Supervisor>,
    isolation: IsolationKind,
) -> Result<ProxyEndpoint> {
    let ca = Arc::new(CertAuthority::load_or_create(
        &paths.ca_cert(),
        &paths.ca_key(),
    )?);

    let ask = AskChannel::open(&paths.ask_socket())?;
    {
        let ask = Arc::clone(&ask);
        supervisor.on_teardown("ask channel", move || ask.shutdown());
    }

    let sink = if config.log_requests() {
        let writer = RequestLogWriter::start(paths.proxy_log_dir())?;
        let sink = writer.sink();
        supervisor.on_teardown("request log", move || {
            let stats = writer.shutdown();
            if stats.dropped > 0 || stats.write_failures > 0 {
                observability::internal_error(
                    "request-log",
                    &format!(
                        "dropped {} record(s), {} write failure(s)",
                        stats.dropped, stats.write_failures
                    ),
                );
            }
        });
        sink
    } else {
        LogSink::disabled()
    };

    let filter = FilterEngine::from_config(&config.proxy.filter)?;
    let injectors = InjectorSet::from_config(&config.proxy.credentials);
    let redactor = Redactor::from_config(&config.proxy.redaction)?;

    let state = ProxyState::new(
        ca,
        filter,
        injectors,
        redactor,
        sink,
        ask,
        Duration::from_secs(config.ask_timeout_secs()),
        config.log_bodies(),
    );
    let mut server = ProxyServer::bind(state, config.proxy_port())?;
    let port = server.port();
    let handle = server.start()?;
    supervisor.on_teardown("proxy server", move || {
        server.stop();
        let _ = handle.join();
    });
    tracing::info!("MITM proxy listening on 0.0.0.0:{port}");

    let gateway_ip = match isolation {
        IsolationKind::Namespace => network::GATEWAY_IP.to_string(),
        IsolationKind::Container => "host.docker.internal".to_string(),
    };

    Ok(ProxyEndpoint {
        gateway_ip,
        port,
        ca_cert: paths.ca_cert(),
    })
}
