use std::io;

use thiserror::Error;

/// Crate-wide error type.
///
/// OS-level failures surface as [`Error::Io`]; everything that can be
/// retried or ignored is reported through return values instead.
#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to parse config: {0}")]
    Config(#[from] serde_yaml::Error),
}

impl From<Error> for io::Error {
    fn from(error: Error) -> io::Error {
        match error {
            Error::Io(e) => e,
            other => io::Error::new(io::ErrorKind::Other, other.to_string()),
        }
    }
}
