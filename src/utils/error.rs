//! Customized unified error type.

use std::error;
use std::fmt;
use std::io;
use std::net;
use std::num;
use std::string;

/// Customized error type for splitfs.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum SplitfsError {
    /// Connection or I/O failure talking to a storage node or peer.
    NodeUnreachable(String),

    /// File or partition absent.
    NotFound(String),

    /// Upload attempted while no storage node has registered.
    NoActiveNodes,

    /// Some partition index could not be fetched from any placement.
    PartialReassembly(usize),

    /// Unparseable protocol frame or illegal argument in one.
    MalformedCommand(String),

    /// Any other run-time error.
    Msg(String),
}

impl SplitfsError {
    pub fn msg(msg: impl ToString) -> Self {
        SplitfsError::Msg(msg.to_string())
    }
}

impl fmt::Display for SplitfsError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // do not display literal quotes
        match self {
            SplitfsError::NodeUnreachable(addr) => {
                write!(f, "node unreachable: {}", addr)
            }
            SplitfsError::NotFound(what) => write!(f, "{} not found", what),
            SplitfsError::NoActiveNodes => write!(f, "no active nodes"),
            SplitfsError::PartialReassembly(index) => write!(
                f,
                "unreachable node, cannot reassemble (partition {})",
                index
            ),
            SplitfsError::MalformedCommand(what) => {
                write!(f, "malformed command: {}", what)
            }
            SplitfsError::Msg(msg) => write!(f, "{}", msg),
        }
    }
}

impl error::Error for SplitfsError {}

// Helper macro for saving boiler-plate `impl From<X>`s for transparent
// conversion from various common error types to `SplitfsError`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for SplitfsError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                SplitfsError::Msg(e.to_string())
            }
        }
    };
}

// Helper macro for saving boiler-plate `impl From<X<T>>`s for transparent
// conversion from various common generic error types to `SplitfsError`.
macro_rules! impl_from_error_generic {
    ($error:ty) => {
        impl<T> From<$error> for SplitfsError {
            fn from(e: $error) -> SplitfsError {
                SplitfsError::msg(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(string::FromUtf8Error);
impl_from_error!(num::ParseIntError);
impl_from_error!(net::AddrParseError);
impl_from_error!(rmp_serde::encode::Error);
impl_from_error!(rmp_serde::decode::Error);
impl_from_error!(toml::ser::Error);
impl_from_error!(toml::de::Error);
impl_from_error!(ctrlc::Error);
impl_from_error!(tokio::time::error::Elapsed);
impl_from_error!(tokio::sync::oneshot::error::RecvError);

impl_from_error_generic!(tokio::sync::watch::error::SendError<T>);
impl_from_error_generic!(tokio::sync::mpsc::error::SendError<T>);
