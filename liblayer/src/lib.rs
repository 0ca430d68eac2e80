//! Overlay layer stack for a container root.
//!
//! A container root is snapshotted into numbered overlayfs levels. Each new
//! level mounts a fresh upper directory over every earlier one and rebinds the
//! container root onto the result, so levels below the top are frozen
//! changesets that can be archived and shipped to another node.

pub mod archive;
pub mod command;
pub mod error;
mod flatten;
pub mod layer;

#[cfg(any(test, feature = "test-util"))]
pub mod fake;

pub use command::{CommandError, CommandOutput, CommandRunner, SystemRunner};
pub use error::LayerError;
pub use layer::{LayerLayout, LayerManager, LayerState};
