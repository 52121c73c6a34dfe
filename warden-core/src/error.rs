use thiserror::Error;

pub type Result<T> = std::result::Result<T, WardenError>;

#[derive(Error, Debug)]
pub enum WardenError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid server info: {0}")]
    InvalidServerInfo(String),

    #[error("Node id allocation failed after {attempts} attempts")]
    NodeIdExhausted { attempts: usize },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<etcd_client::Error> for WardenError {
    fn from(err: etcd_client::Error) -> Self {
        WardenError::Backend(format!("etcd: {}", err))
    }
}

impl From<redis::RedisError> for WardenError {
    fn from(err: redis::RedisError) -> Self {
        WardenError::Backend(format!("redis: {}", err))
    }
}
