use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetjailError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CNI plugin error: {0}")]
    Plugin(String),

    #[error("Network namespace error: {0}")]
    Netns(String),

    #[error("iptables error: {0}")]
    Iptables(String),

    #[error("State store error: {0}")]
    State(String),

    #[error("Container already attached: {0}")]
    AlreadyAttached(String),

    #[error("Port allocation error: {0}")]
    PortAllocation(String),

    #[error("IPC error: {0}")]
    Ipc(String),

    #[error("Teardown completed with errors: {0}")]
    Teardown(String),
}

pub type Result<T> = std::result::Result<T, NetjailError>;
