use crate::error::Error;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

const ATTACH_MAIN_CLASS: &str = "net.virtualvoid.perf.AttachOnce";
const ATTACH_OPTIONS: &str = "unfoldall";
const MIN_HEAP: &str = "-Xms32m";
const MAX_HEAP: &str = "-Xmx128m";

pub const DEFAULT_AGENT_JAR: &str = "/usr/share/evagent/perf-map-agent.jar";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JvmAttachConfig {
    /// JVM installation providing `lib/tools.jar`.
    pub java_home: Option<PathBuf>,
    /// The perf-map attach agent.
    pub agent_jar: PathBuf,
}

impl Default for JvmAttachConfig {
    fn default() -> Self {
        Self {
            java_home: None,
            agent_jar: PathBuf::from(DEFAULT_AGENT_JAR),
        }
    }
}

/// The external helper that loads the perf-map agent into a running JVM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub agent_jar: PathBuf,
    pub pid: u32,
    pub uid: u32,
    pub gid: u32,
}

impl AttachCommand {
    /// The helper runs as the agent's own user and group, not the target's. Attaching to a
    /// JVM owned by a different user fails.
    pub fn new(java: &Path, pid: u32, cfg: &JvmAttachConfig) -> Self {
        let mut class_path = cfg.agent_jar.clone().into_os_string();
        if let Some(home) = &cfg.java_home {
            class_path.push(":");
            class_path.push(home.join("lib").join("tools.jar"));
        }

        let args = vec![
            OsString::from(MIN_HEAP),
            OsString::from(MAX_HEAP),
            OsString::from("-cp"),
            class_path,
            OsString::from(ATTACH_MAIN_CLASS),
            OsString::from(pid.to_string()),
            OsString::from(ATTACH_OPTIONS),
        ];

        Self {
            program: java.to_path_buf(),
            args,
            agent_jar: cfg.agent_jar.clone(),
            pid,
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
        }
    }

    pub async fn run(&self) -> Result<(), Error> {
        if !self.agent_jar.is_file() {
            return Err(self.failure(format!(
                "attach agent {} not found",
                self.agent_jar.display()
            )));
        }

        log::debug!(
            "Attaching perf map agent to pid {} with {}",
            self.pid,
            self.program.display()
        );

        let output = Command::new(&self.program)
            .args(&self.args)
            .uid(self.uid)
            .gid(self.gid)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                self.failure(format!(
                    "failed to start {}: {}",
                    self.program.display(),
                    e
                ))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(self.failure(format!(
                "attach helper exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        Ok(())
    }

    fn failure(&self, reason: String) -> Error {
        Error::Preparation {
            pid: self.pid,
            reason,
        }
    }
}
