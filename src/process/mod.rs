mod jvm;

pub use jvm::{AttachCommand, JvmAttachConfig, DEFAULT_AGENT_JAR};

use crate::error::Error;
use std::fs;
use std::path::{Path, PathBuf};

pub const PROC_ROOT: &str = "/proc";

/// Executables whose path contains this marker are treated as JVM launchers. This is a
/// heuristic: a binary merely named like the launcher is classified the same way.
pub const JVM_MARKER: &str = "java";

/// A process that does not require special handling to begin profiling it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlainProcess {
    pid: u32,
    path: PathBuf,
}

/// A JVM process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JvmProcess {
    process: PlainProcess,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Process {
    Plain(PlainProcess),
    Jvm(JvmProcess),
}

impl Process {
    pub fn pid(&self) -> u32 {
        self.plain().pid
    }

    pub fn executable(&self) -> &Path {
        &self.plain().path
    }

    pub fn is_jvm(&self) -> bool {
        matches!(self, Process::Jvm(_))
    }

    /// Performs the one-off action needed before the process can be profiled.
    ///
    /// It is a noop for plain processes. For JVM processes the perf-map attach agent is
    /// loaded into the target so that it exports its JIT symbol map.
    pub async fn prepare_to_profile(&self, jvm: &JvmAttachConfig) -> Result<(), Error> {
        match self {
            Process::Plain(_) => Ok(()),
            Process::Jvm(p) => p.attach_command(jvm).run().await,
        }
    }

    fn plain(&self) -> &PlainProcess {
        match self {
            Process::Plain(p) => p,
            Process::Jvm(p) => &p.process,
        }
    }
}

impl JvmProcess {
    /// The helper runs the JVM launcher of the target itself.
    pub fn attach_command(&self, cfg: &JvmAttachConfig) -> AttachCommand {
        AttachCommand::new(&self.process.path, self.process.pid, cfg)
    }
}

/// Determines the kind of process that belongs to `pid` in the procfs mounted at `proc_root`.
pub fn detect(proc_root: &Path, pid: u32) -> Result<Process, Error> {
    let path = fs::read_link(proc_root.join(pid.to_string()).join("exe"))
        .map_err(|e| Error::from_proc_io(pid, e))?;

    let process = PlainProcess { pid, path };

    if process.path.to_string_lossy().contains(JVM_MARKER) {
        return Ok(Process::Jvm(JvmProcess { process }));
    }

    Ok(Process::Plain(process))
}
