use std::io;
use std::path::{Path, PathBuf};

use common::FailureKind;
use thiserror::Error;

use crate::command::CommandError;
use crate::layer::LayerState;

#[derive(Debug, Error)]
pub enum LayerError {
    #[error("cannot {op} while the layer manager is {state:?}")]
    InvalidState {
        op: &'static str,
        state: LayerState,
    },
    #[error("layer directories are not contiguous: level {0} is missing")]
    Gap(u32),
    #[error("level {0} does not exist")]
    UnknownLevel(u32),
    #[error("level {0} already exists under the layer root")]
    LevelExists(u32),
    #[error("base {} is the container root the stack is bound onto", .0.display())]
    BaseIsRoot(PathBuf),
    #[error("failed to capture the container root at {}: {source}", .path.display())]
    CaptureBase {
        path: PathBuf,
        #[source]
        source: CommandError,
    },
    #[error("layer root holds {found} levels but the manager is at level {expected}")]
    OutOfSync { expected: u32, found: u32 },
    #[error("i/o error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to mount level {level}: {source}")]
    Mount {
        level: u32,
        #[source]
        source: CommandError,
    },
    #[error("{} is not a mount point after mounting it", .0.display())]
    NotMounted(PathBuf),
    #[error("failed to unmount {}: {source}", .path.display())]
    Unmount {
        path: PathBuf,
        #[source]
        source: CommandError,
    },
    #[error(transparent)]
    Command(#[from] CommandError),
}

impl LayerError {
    pub fn kind(&self) -> FailureKind {
        match self {
            LayerError::InvalidState { .. }
            | LayerError::Gap(_)
            | LayerError::UnknownLevel(_)
            | LayerError::LevelExists(_)
            | LayerError::BaseIsRoot(_)
            | LayerError::OutOfSync { .. } => FailureKind::Fatal,
            LayerError::Mount { source, .. }
            | LayerError::CaptureBase { source, .. }
            | LayerError::Unmount { source, .. }
            | LayerError::Command(source) => source.kind(),
            LayerError::Io { .. } | LayerError::NotMounted(_) => FailureKind::Retryable,
        }
    }
}

pub(crate) fn io_err(path: &Path) -> impl FnOnce(io::Error) -> LayerError + '_ {
    move |source| LayerError::Io {
        path: path.to_path_buf(),
        source,
    }
}
