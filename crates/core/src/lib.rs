pub mod config;
pub mod error;

pub use config::{check_identifier, Config, FaultPolicy, PostgresConfig, QueueSettings, ServerConfig, MAX_DURATION_SECS};
pub use error::*;
