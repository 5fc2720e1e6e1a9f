use std::error::Error;

#[derive(thiserror::Error, Debug)]
pub enum UptermdError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("session directory error: {0}")]
    Directory(String),

    #[error("session not found: {0}")]
    NotFound(String),

    #[error("session already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid ssh user string")]
    InvalidSshUser,

    #[error(transparent)]
    Ssh(#[from] russh::Error),

    #[error(transparent)]
    SshKeys(#[from] russh::keys::Error),

    #[error("public key not allowed")]
    PublicKeyNotAllowed,

    #[error("routing loop detected for session {0}")]
    RoutingLoop(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Other(Box<dyn Error + Send + Sync>),
}

impl UptermdError {
    pub fn other<E: Error + Send + Sync + 'static>(err: E) -> Self {
        Self::Other(Box::new(err))
    }

    /// True for errors that are just the ordinary shape of a connection going
    /// away (EOF, reset, closed) and so shouldn't be logged as failures.
    pub fn is_expected_shutdown(&self) -> bool {
        match self {
            UptermdError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
            ),
            UptermdError::Ssh(russh::Error::Disconnect) => true,
            _ => false,
        }
    }
}
