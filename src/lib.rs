pub mod config;
pub mod error;
pub mod models;
pub mod obfuscate;
pub mod protocol;
pub mod services;
pub mod tools;
pub mod transport;

pub use config::Config;
pub use services::ConnectionManager;
pub use tools::ToolRegistry;
