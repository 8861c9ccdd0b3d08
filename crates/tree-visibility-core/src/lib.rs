//! Core primitives for the tree visibility engine.
//!
//! This crate provides the foundation shared by the visibility engine and its
//! hosts:
//!
//! - **Ids**: [`Id64`], the opaque 64-bit id every tree node is keyed by
//! - **Errors**: [`VisibilityError`] and the crate-wide [`Result`] alias
//! - **Signal/Slot System**: [`Signal`], used for viewport change events and
//!   visibility change notifications
//! - **Cancellation**: [`CancellationToken`], the abort signal for bulk reads
//!   and the dispose flag of long-lived components
//! - **Configuration**: [`VisibilityConfig`]
//! - **Logging**: tracing targets and span names
//!
//! # Signal Example
//!
//! ```
//! use tree_visibility_core::Signal;
//!
//! let visibility_changed = Signal::<()>::new();
//! let conn_id = visibility_changed.connect(|_| {
//!     println!("re-query visible nodes");
//! });
//! visibility_changed.emit(());
//! visibility_changed.disconnect(conn_id);
//! ```

pub mod cancellation;
mod config;
mod error;
mod id;
pub mod logging;
pub mod signal;

pub use cancellation::CancellationToken;
pub use config::VisibilityConfig;
pub use error::{Result, VisibilityError};
pub use id::{Id64, IdSet};
pub use logging::perf_span;
pub use signal::{ConnectionId, Signal};
