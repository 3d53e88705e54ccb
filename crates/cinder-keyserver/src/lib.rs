pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod http;
pub mod service;
pub mod session;
pub mod store;

pub use config::{Args, KeyServerConfig, StorageBackend};
pub use error::ServerError;
pub use service::KeyServer;
