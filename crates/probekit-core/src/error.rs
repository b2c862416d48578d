use std::fmt::{Display, Formatter};
use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// A probe engine error result.
pub type Result<T> = std::result::Result<T, Error>;

/// A probe engine error.
#[derive(Error, Debug)]
pub enum Error {
    #[error("no such interface: {0}")]
    NoSuchInterface(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("privilege error: {0}")]
    PrivilegeError(#[from] trippy_privilege::Error),
    #[error("packet error: {0}")]
    PacketError(#[from] trippy_packet::error::Error),
    #[error("invalid packet: {0}")]
    InvalidPacket(String),
    #[error("invalid config: {0}")]
    BadConfig(String),
    #[error("listener is already registered")]
    AlreadyRegistered,
    #[error("channel is closed")]
    ChannelClosed,
    #[error("IO error: {0}")]
    IoError(#[from] IoError),
}

/// Custom IO error result.
pub type IoResult<T> = std::result::Result<T, IoError>;

/// Custom IO error.
#[derive(Error, Debug)]
pub enum IoError {
    #[error("Bind error for {1}: {0}")]
    Bind(io::Error, String),
    #[error("Sendto error for {1}: {0}")]
    SendTo(io::Error, SocketAddr),
    #[error("Failed to {1}: {0}")]
    Other(io::Error, IoOperation),
}

impl IoError {
    /// Get the underlying [`io::ErrorKind`].
    pub fn kind(&self) -> io::ErrorKind {
        match self {
            Self::Bind(e, _) | Self::SendTo(e, _) | Self::Other(e, _) => e.kind(),
        }
    }
}

/// Io operation.
#[derive(Debug)]
pub enum IoOperation {
    NewSocket,
    SetNonBlocking,
    SetHeaderIncluded,
    BindDevice,
    Select,
    Read,
}

impl Display for IoOperation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NewSocket => write!(f, "create new socket"),
            Self::SetNonBlocking => write!(f, "set non-blocking"),
            Self::SetHeaderIncluded => write!(f, "set header included"),
            Self::BindDevice => write!(f, "bind to device"),
            Self::Select => write!(f, "select"),
            Self::Read => write!(f, "read"),
        }
    }
}

impl Error {
    /// Map a socket creation failure, surfacing missing raw-socket capability.
    pub(crate) fn from_socket_setup(err: IoError) -> Self {
        match err.kind() {
            io::ErrorKind::PermissionDenied => Self::PermissionDenied(err.to_string()),
            _ => Self::IoError(err),
        }
    }
}
