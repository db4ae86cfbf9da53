use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Duplicate path prefix {prefix:?} for services {first} and {second}")]
    DuplicatePrefix {
        prefix: String,
        first: String,
        second: String,
    },

    #[error("Invalid service configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),
}
