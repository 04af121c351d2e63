use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("missing config value: {0}")]
    Missing(String),
}
