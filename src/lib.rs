pub mod config;
pub mod logger;
pub mod proxy;
pub mod rules;

pub use config::Config;
pub use proxy::{RelayServer, RelaySession, RelaySettings};
