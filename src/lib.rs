pub mod config;
pub mod db;
pub mod dkim;
pub mod logs;
pub mod model;
pub mod publish;
pub mod queue;
pub mod receiver;
pub mod resolver;
pub mod scanner;
pub mod server;
pub mod smtp;
pub mod store;
pub mod tls;

// NOTE: not marked as #[cfg(test)] because it is used by the integration tests
pub mod test_helpers;

/// software tag used in the greeting banner and the Received header
pub const SOFTWARE: &str = "oxmail";

/// crate version, advertised unless `server.hide_server_signature` is set
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod log_channels {
    pub const SERVER: &str = "server";
    pub const RECEIVER: &str = "receiver";
    pub const QUEUE: &str = "queue";
    pub const DKIM: &str = "dkim";
}
