//! A dedicated error type for everything that can go wrong resolving a name:
//! I/O, TLS/pinning, DoH framing, wire parsing, and configuration.
use std::fmt;
use std::io;

#[derive(Debug)]
pub enum HardDnsError {
    Io(io::Error),
    Tls(String),
    Protocol(String),
    Parse(String),
    Config(String),
    Internal(String),
}

impl HardDnsError {
    pub fn tls(s: impl Into<String>) -> Self {
        HardDnsError::Tls(s.into())
    }

    pub fn protocol(s: impl Into<String>) -> Self {
        HardDnsError::Protocol(s.into())
    }

    pub fn parse(s: impl Into<String>) -> Self {
        HardDnsError::Parse(s.into())
    }

    pub fn config(s: impl Into<String>) -> Self {
        HardDnsError::Config(s.into())
    }

    pub fn internal(s: impl Into<String>) -> Self {
        HardDnsError::Internal(s.into())
    }
}

impl fmt::Display for HardDnsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HardDnsError::Io(e) => write!(f, "I/O error: {}", e),
            HardDnsError::Tls(s) => write!(f, "TLS error: {}", s),
            HardDnsError::Protocol(s) => write!(f, "protocol error: {}", s),
            HardDnsError::Parse(s) => write!(f, "parse error: {}", s),
            HardDnsError::Config(s) => write!(f, "config error: {}", s),
            HardDnsError::Internal(s) => write!(f, "internal error: {}", s),
        }
    }
}

impl std::error::Error for HardDnsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HardDnsError::Io(e) => Some(e),
            _ => None,
        }
    }
}

/// A specific custom `Result` for all fallible operations.
pub type HardDnsResult<T> = Result<T, HardDnsError>;

impl From<io::Error> for HardDnsError {
    fn from(err: io::Error) -> Self {
        HardDnsError::Io(err)
    }
}

impl From<String> for HardDnsError {
    fn from(err: String) -> Self {
        HardDnsError::Internal(err)
    }
}

impl From<log::SetLoggerError> for HardDnsError {
    fn from(err: log::SetLoggerError) -> Self {
        HardDnsError::Internal(err.to_string())
    }
}

impl From<std::string::FromUtf8Error> for HardDnsError {
    fn from(err: std::string::FromUtf8Error) -> Self {
        HardDnsError::Parse(err.to_string())
    }
}

impl From<std::net::AddrParseError> for HardDnsError {
    fn from(err: std::net::AddrParseError) -> Self {
        HardDnsError::Config(err.to_string())
    }
}
