use derive_more::{Display, From};
use std::io;

/// Common errors of the relayd processes.
#[derive(Debug, Display, From)]
pub enum Error {
    #[display(fmt = "I/O error: {}", "_0")]
    IoError(io::Error),
    #[display(fmt = "Invalid arguments: {}", "_0")]
    Options(getopts::Fail),
    #[display(fmt = "Privilge separation error: {}", "_0")]
    PrivsepError(privsep::Error),
    #[display(fmt = "Parser error: {}", "_0")]
    #[from(ignore)]
    ParserError(String),
    #[display(fmt = "Configuration error: {}", "_0")]
    #[from(ignore)]
    ConfigError(String),
    #[display(fmt = "Channel to {} terminated", "_0")]
    #[from(ignore)]
    Terminated(String),
    #[display(fmt = "Invalid or unexpected message")]
    InvalidMessage,
    #[display(fmt = "Message exceeds the size limit for its type")]
    MessageTooLarge,
    #[display(fmt = "HTTP error: {}", "_0")]
    #[from(ignore)]
    HttpError(String),
    #[display(fmt = "TLS error: {}", "_0")]
    Tls(rustls::Error),
    #[display(fmt = "Private key operation failed")]
    KeyOpFailed,
    #[display(fmt = "Serialization error: {}", "_0")]
    Json(serde_json::Error),
}

impl From<Error> for privsep::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::PrivsepError(err) => err,
            Error::IoError(err) => privsep::Error::from(err),
            err => privsep::Error::GeneralError(Box::new(err)),
        }
    }
}

impl std::error::Error for Error {}
