use std::ffi::{NulError, OsString};
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::host::HostState;

/// Everything that can go wrong while bootstrapping or tearing down a hosted runtime.
///
/// Only [`HostError::Shutdown`] is treated as non-fatal by the bootstrap; every other
/// variant ends the run with a non-zero exit code.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("failed to load runtime library {path}: {source}")]
    Load {
        path: PathBuf,
        #[source]
        source: libloading::Error,
    },

    #[error("runtime library {path} does not export `{symbol}`: {source}")]
    SymbolResolution {
        path: PathBuf,
        symbol: &'static str,
        #[source]
        source: libloading::Error,
    },

    #[error("coreclr_initialize failed with status {}", hresult(.status))]
    Initialization { status: i32 },

    #[error(
        "could not create delegate for {assembly}!{type_name}.{method}: status {}",
        hresult(.status)
    )]
    DelegateResolution {
        assembly: String,
        type_name: String,
        method: String,
        status: i32,
    },

    #[error("coreclr_shutdown failed with status {}", hresult(.status))]
    Shutdown { status: i32 },

    #[error("cannot read assembly directory {path}: {source}")]
    DirectoryAccess {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("`{operation}` is not valid while the host is {state:?}")]
    InvalidState {
        operation: &'static str,
        state: HostState,
    },

    #[error("another runtime host already owns the callback bridge")]
    BridgeBusy,

    #[error("`{type_name}` cannot hold a native function pointer")]
    DelegateType { type_name: &'static str },

    #[error("`{operation}` did not return within {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("could not start a worker thread for `{operation}`: {source}")]
    Spawn {
        operation: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("string passed to the runtime contains an interior NUL byte")]
    InvalidString(#[from] NulError),

    #[error("{value:?} is not valid Unicode")]
    NonUnicode { value: OsString },

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, HostError>;

impl HostError {
    /// Fatal errors stop the bootstrap; a failed shutdown is only reported.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, HostError::Shutdown { .. })
    }
}

fn hresult(status: &i32) -> String {
    format!("{:#010x}", *status as u32)
}
