pub mod cache;
pub mod config;
pub mod config_validation;
pub mod dialer;
pub mod error;
pub mod handler;
pub mod logging;
pub mod relay;
pub mod request;
pub mod response;
pub mod server;
pub mod stats;

pub use config::Config;
pub use error::ProxyError;
pub use server::ProxyServer;
