//! Builds the command line that runs inside the sandbox: tool activation,
//! a prompt that names the sandbox, then the user's shell or command.

use devsandbox_core::config::schema::ShellKind;

/// A program plus argv, ready for the isolation backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCommand {
    pub program: String,
    pub args: Vec<String>,
}

/// POSIX single-quote escaping: close, escaped quote, reopen.
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./=:".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Join argv into a single `sh -c`-safe string.
pub fn quote_command(args: &[String]) -> String {
    args.iter()
        .map(|a| shell_quote(a))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Compose the in-sandbox command.
///
/// `user_command` empty means an interactive shell: the prelude sets the
/// prompt and execs the shell so no wrapper process lingers.
pub fn compose(
    shell: ShellKind,
    project_name: &str,
    shell_inits: &[String],
    user_command: &[String],
) -> ShellCommand {
    match shell {
        ShellKind::Bash | ShellKind::Zsh => {
            compose_posix(shell, project_name, shell_inits, user_command)
        }
        ShellKind::Fish => compose_fish(project_name, shell_inits, user_command),
    }
}

fn compose_posix(
    shell: ShellKind,
    project_name: &str,
    shell_inits: &[String],
    user_command: &[String],
) -> ShellCommand {
    let mut script = String::new();
    for init in shell_inits {
        script.push_str(init);
        script.push('\n');
    }
    let name = shell_quote(project_name);
    match shell {
        ShellKind::Bash => {
            script.push_str(&format!("export PS1=\"(sandbox:\"{name}\") \\w \\$ \"\n"));
        }
        ShellKind::Zsh => {
            script.push_str(&format!("export PROMPT=\"(sandbox:\"{name}\") %~ %# \"\n"));
        }
        ShellKind::Fish => unreachable!("fish handled separately"),
    }
    if user_command.is_empty() {
        script.push_str(&format!("exec {} -i\n", shell.as_str()));
    } else {
        script.push_str(&format!("exec {}\n", quote_command(user_command)));
    }
    ShellCommand {
        program: shell.as_str().to_string(),
        args: vec!["-c".to_string(), script],
    }
}

fn compose_fish(
    project_name: &str,
    shell_inits: &[String],
    user_command: &[String],
) -> ShellCommand {
    let mut prelude = String::new();
    for init in shell_inits {
        prelude.push_str(init);
        prelude.push('\n');
    }
    let name = shell_quote(project_name);
    prelude.push_str(&format!(
        "function fish_prompt; echo -n \"(sandbox:\"{name}\") \"(prompt_pwd)\" > \"; end\n"
    ));
    if user_command.is_empty() {
        // -C runs the prelude and leaves the shell interactive.
        ShellCommand {
            program: "fish".to_string(),
            args: vec!["-C".to_string(), prelude],
        }
    } else {
        let mut script = prelude;
        script.push_str(&quote_command(user_command));
        script.push('\n');
        ShellCommand {
            program: "fish".to_string(),
            args: vec!["-c".to_string(), script],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quote_passthrough() {
        assert_eq!(shell_quote("cargo"), "cargo");
        assert_eq!(shell_quote("a-b_c.d/e:f=g"), "a-b_c.d/e:f=g");
    }

    #[test]
    fn test_shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn test_quote_command() {
        let args = vec!["echo".to_string(), "hello world".to_string()];
        assert_eq!(quote_command(&args), "echo 'hello world'");
    }

    #[test]
    fn test_interactive_bash_sets_prompt_and_execs() {
        let cmd = compose(ShellKind::Bash, "my-app", &[], &[]);
        assert_eq!(cmd.program, "bash");
        let script = &cmd.args[1];
        assert!(script.contains("sandbox:"), "{script}");
        assert!(script.contains("my-app"), "{script}");
        assert!(script.contains("exec bash -i"), "{script}");
    }

    #[test]
    fn test_user_command_is_quoted() {
        let cmd = compose(
            ShellKind::Bash,
            "p",
            &[],
            &["npm".to_string(), "install left pad".to_string()],
        );
        let script = &cmd.args[1];
        assert!(script.contains("exec npm 'install left pad'"), "{script}");
    }

    #[test]
    fn test_inits_precede_prompt() {
        let init = "eval \"$(mise activate bash)\"".to_string();
        let cmd = compose(ShellKind::Bash, "p", &[init.clone()], &[]);
        let script = &cmd.args[1];
        let init_pos = script.find("mise activate").expect("init present");
        let prompt_pos = script.find("PS1").expect("prompt present");
        assert!(init_pos < prompt_pos);
    }

    #[test]
    fn test_fish_prompt_function() {
        let cmd = compose(ShellKind::Fish, "p", &[], &[]);
        assert_eq!(cmd.program, "fish");
        assert_eq!(cmd.args[0], "-C");
        assert!(cmd.args[1].contains("function fish_prompt"));
    }
}
