use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// The pid does not belong to a live process.
    #[error("process {pid} does not exist")]
    ProcessNotFound {
        pid: u32,
        #[source]
        source: io::Error,
    },

    #[error("failed to inspect process {pid}: {source}")]
    Io {
        pid: u32,
        #[source]
        source: io::Error,
    },

    #[error("failed to prepare process {pid} for profiling: {reason}")]
    Preparation { pid: u32, reason: String },

    #[error("cgroup {} does not exist", path.display())]
    CgroupNotFound { path: PathBuf },

    #[error("profiler has already been started")]
    AlreadyStarted,

    #[error("profiling cycle failed: {0:#}")]
    Cycle(anyhow::Error),

    #[error("delivery failed: {0:#}")]
    Delivery(anyhow::Error),
}

impl Error {
    /// Reports "does not exist" failures, as opposed to any other I/O error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::ProcessNotFound { .. } | Error::CgroupNotFound { .. })
    }

    pub(crate) fn from_proc_io(pid: u32, source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::NotFound => Error::ProcessNotFound { pid, source },
            _ => Error::Io { pid, source },
        }
    }
}
