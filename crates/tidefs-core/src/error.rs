use thiserror::Error;

pub type TidefsResult<T> = Result<T, TidefsError>;

#[derive(Debug, Error)]
pub enum TidefsError {
    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("keyring error: {0}")]
    Keyring(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
