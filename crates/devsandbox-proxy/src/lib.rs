pub mod ask;
pub mod ca;
pub mod filter;
pub mod inject;
pub mod record;
pub mod redact;
pub mod reqlog;
pub mod server;
