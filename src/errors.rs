//! Representations of the errors raised while talking to the docker daemon
//! and preparing the NarratoAI container

use hyper::{self, http, StatusCode};
use serde_json::Error as SerdeError;
use std::{error::Error as StdError, fmt, io::Error as IoError, string::FromUtf8Error};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    SerdeJsonError(SerdeError),
    Hyper(hyper::Error),
    Http(http::Error),
    IO(IoError),
    Encoding(FromUtf8Error),
    Config(toml::de::Error),
    #[cfg(feature = "tls")]
    Tls(openssl::error::ErrorStack),
    InvalidResponse(String),
    Fault { code: StatusCode, message: String },
    /// An error reported inside a streamed daemon response, e.g. a failed build step
    Stream(String),
    InvalidArgument(String),
    UnsupportedScheme(String),
    MissingAuthority,
}

impl Error {
    /// The daemon answered `404 Not Found`, e.g. "no such container"
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Fault { code, .. } if *code == StatusCode::NOT_FOUND)
    }

    /// The daemon answered `304 Not Modified`, e.g. stopping a stopped container
    pub fn is_not_modified(&self) -> bool {
        matches!(self, Error::Fault { code, .. } if *code == StatusCode::NOT_MODIFIED)
    }
}

impl From<SerdeError> for Error {
    fn from(error: SerdeError) -> Error {
        Error::SerdeJsonError(error)
    }
}

impl From<hyper::Error> for Error {
    fn from(error: hyper::Error) -> Error {
        Error::Hyper(error)
    }
}

impl From<http::Error> for Error {
    fn from(error: http::Error) -> Error {
        Error::Http(error)
    }
}

impl From<IoError> for Error {
    fn from(error: IoError) -> Error {
        Error::IO(error)
    }
}

impl From<FromUtf8Error> for Error {
    fn from(error: FromUtf8Error) -> Error {
        Error::Encoding(error)
    }
}

impl From<toml::de::Error> for Error {
    fn from(error: toml::de::Error) -> Error {
        Error::Config(error)
    }
}

#[cfg(feature = "tls")]
impl From<openssl::error::ErrorStack> for Error {
    fn from(error: openssl::error::ErrorStack) -> Error {
        Error::Tls(error)
    }
}

impl fmt::Display for Error {
    fn fmt(
        &self,
        f: &mut fmt::Formatter,
    ) -> fmt::Result {
        match self {
            Error::SerdeJsonError(ref err) => err.fmt(f),
            Error::Http(ref err) => err.fmt(f),
            Error::Hyper(ref err) => err.fmt(f),
            Error::IO(ref err) => err.fmt(f),
            Error::Encoding(ref err) => err.fmt(f),
            Error::Config(ref err) => write!(f, "invalid configuration: {}", err),
            #[cfg(feature = "tls")]
            Error::Tls(ref err) => write!(f, "tls setup failed: {}", err),
            Error::InvalidResponse(ref cause) => {
                write!(f, "Response doesn't have the expected format: {}", cause)
            }
            Error::Fault { code, message } => write!(f, "{}: {}", code, message),
            Error::Stream(ref message) => write!(f, "daemon reported: {}", message),
            Error::InvalidArgument(ref message) => write!(f, "{}", message),
            Error::UnsupportedScheme(ref scheme) => write!(f, "Unsupported scheme: {}", scheme),
            Error::MissingAuthority => write!(f, "Docker host is missing an authority part"),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::SerdeJsonError(ref err) => Some(err),
            Error::Http(ref err) => Some(err),
            Error::Hyper(ref err) => Some(err),
            Error::IO(ref err) => Some(err),
            Error::Encoding(ref err) => Some(err),
            Error::Config(ref err) => Some(err),
            #[cfg(feature = "tls")]
            Error::Tls(ref err) => Some(err),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_daemon_faults() {
        let missing = Error::Fault {
            code: StatusCode::NOT_FOUND,
            message: "No such container: narratoai".into(),
        };
        assert!(missing.is_not_found());
        assert!(!missing.is_not_modified());

        let stopped = Error::Fault {
            code: StatusCode::NOT_MODIFIED,
            message: "container already stopped".into(),
        };
        assert!(stopped.is_not_modified());
        assert!(!Error::MissingAuthority.is_not_found());
    }

    #[test]
    fn displays_fault_message() {
        let err = Error::Fault {
            code: StatusCode::CONFLICT,
            message: "name already in use".into(),
        };
        assert_eq!(
            err.to_string(),
            "409 Conflict: name already in use"
        );
    }
}
