//! # vcp-core
//!
//! Shared vocabulary for the VCP plugin trust core: the error taxonomy every
//! component returns, the plugin lifecycle states, the permission-string
//! grammar, and the namespaced event bus plugins and the host talk over.

pub mod error;
pub mod event;
pub mod types;

pub use error::{NetworkError, Result, VcpError};
pub use event::{EventBus, EventHandler, Subscription};
pub use types::*;
