use crate::{dispatch::MarshalError, protocol::ProtocolError};

/// An error reported by the native library
#[derive(Debug)]
pub enum NativeError {
    /// The wayland system library could not be loaded
    NoWaylandLib,
    /// The native library could not allocate the object
    NoMemory,
    /// The operation failed due to an underlying I/O error
    Io(std::io::Error),
    /// The connection was terminated by a protocol error
    Protocol(ProtocolError),
    /// The native object does not exist (anymore)
    InvalidObject,
    /// The native library does not support this operation
    Unsupported(&'static str),
}

impl std::error::Error for NativeError {
    #[cfg_attr(unstable_coverage, coverage(off))]
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Protocol(err) => Some(err),
            _ => None,
        }
    }
}

impl std::fmt::Display for NativeError {
    #[cfg_attr(unstable_coverage, coverage(off))]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoWaylandLib => f.write_str("could not load the wayland system library"),
            Self::NoMemory => f.write_str("the native library ran out of memory"),
            Self::Io(err) => write!(f, "Io error: {err}"),
            Self::Protocol(err) => std::fmt::Display::fmt(err, f),
            Self::InvalidObject => f.write_str("invalid native object"),
            Self::Unsupported(what) => write!(f, "unsupported by the native library: {what}"),
        }
    }
}

impl From<std::io::Error> for NativeError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<rustix::io::Errno> for NativeError {
    fn from(err: rustix::io::Errno) -> Self {
        Self::Io(err.into())
    }
}

/// An error generated when acting on a peer whose native object was destroyed
#[derive(Clone, Debug)]
pub struct InvalidId;

impl std::error::Error for InvalidId {}

#[cfg_attr(unstable_coverage, coverage(off))]
impl std::fmt::Display for InvalidId {
    fn fmt(&self, f: &mut ::std::fmt::Formatter) -> Result<(), ::std::fmt::Error> {
        write!(f, "Invalid Id")
    }
}

/// Errors raised by the bridge bookkeeping to its immediate caller
#[derive(Debug)]
pub enum BridgeError {
    /// Memory for the bookkeeping could not be obtained
    NoMemory,
    /// The wrapper already has native data assigned
    AlreadyAssigned,
    /// The lifetime protocol was used in a way its current state does not allow
    IllegalState(&'static str),
    /// A message name does not exist in the interface
    UnknownMessage {
        /// Name of the interface
        interface: &'static str,
        /// The requested message name
        name: String,
    },
    /// The native object of this peer is gone
    InvalidId,
    /// An outgoing call could not be translated to wire arguments
    Marshal(MarshalError),
    /// The native library reported an error
    Native(NativeError),
}

impl std::error::Error for BridgeError {
    #[cfg_attr(unstable_coverage, coverage(off))]
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Marshal(err) => Some(err),
            Self::Native(err) => Some(err),
            _ => None,
        }
    }
}

impl std::fmt::Display for BridgeError {
    #[cfg_attr(unstable_coverage, coverage(off))]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoMemory => f.write_str("out of memory"),
            Self::AlreadyAssigned => f.write_str("NativeObjectWrapper: data already assigned"),
            Self::IllegalState(what) => write!(f, "illegal state: {what}"),
            Self::UnknownMessage { interface, name } => {
                write!(f, "interface {interface} has no message named {name}")
            }
            Self::InvalidId => f.write_str("Invalid Id"),
            Self::Marshal(err) => std::fmt::Display::fmt(err, f),
            Self::Native(err) => std::fmt::Display::fmt(err, f),
        }
    }
}

impl From<NativeError> for BridgeError {
    fn from(err: NativeError) -> Self {
        match err {
            NativeError::NoMemory => Self::NoMemory,
            err => Self::Native(err),
        }
    }
}

impl From<MarshalError> for BridgeError {
    fn from(err: MarshalError) -> Self {
        Self::Marshal(err)
    }
}

impl From<InvalidId> for BridgeError {
    fn from(_: InvalidId) -> Self {
        Self::InvalidId
    }
}
