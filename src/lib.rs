//! Native host for CoreCLR.
//!
//! Loads the runtime library, starts a runtime instance with a trusted platform assembly
//! list, binds managed methods to native function pointers and routes managed callbacks
//! back into the host.

pub mod bootstrap;
pub mod bridge;
pub mod config;
pub mod coreclr;
pub mod error;
pub mod host;
pub mod output;
pub mod platform;
pub mod tpa;

pub use crate::bootstrap::{Bootstrap, RunReport};
pub use crate::coreclr::{CoreClrLoader, HostingFunctions, ManagedDelegate};
pub use crate::config::HostConfig;
pub use crate::error::{HostError, Result};
pub use crate::host::{DomainId, HostHandle, HostState, RuntimeHost};
pub use crate::platform::Platform;
