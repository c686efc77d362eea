use crate::agent::ExternalLabels;
use crate::ksym::KALLSYMS;
use crate::process::{JvmAttachConfig, DEFAULT_AGENT_JAR};
use crate::sampler::DEFAULT_FREQUENCY;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

const HOSTNAME: &str = "/proc/sys/kernel/hostname";

#[derive(Parser, Debug, Clone)]
#[command(
    name = "evagent",
    about = "Continuous profiling agent for systemd units",
    version
)]
pub struct Args {
    /// Name of the node the agent runs on.
    #[arg(long, env = "NODE_NAME")]
    pub node: Option<String>,

    /// Systemd units to profile.
    #[arg(long, value_delimiter = ',', required = true)]
    pub systemd_units: Vec<String>,

    /// gRPC address of the profile and debug info store. Profiles are discarded when unset.
    #[arg(long)]
    pub store_address: Option<String>,

    /// Length of one sampling window in seconds.
    #[arg(long, default_value_t = 10, value_parser = clap::value_parser!(u64).range(1..))]
    pub sampling_duration: u64,

    /// Kernel stack sampling frequency in Hz.
    #[arg(long, default_value_t = DEFAULT_FREQUENCY)]
    pub sample_frequency: u32,

    #[arg(long, default_value = KALLSYMS)]
    pub kallsyms: PathBuf,

    /// Seconds after which the kernel symbol table is read again.
    #[arg(long, default_value_t = 300)]
    pub kallsyms_refresh: u64,

    /// JVM installation searched for `lib/tools.jar` when attaching to JVMs.
    #[arg(long, env = "JAVA_HOME")]
    pub java_home: Option<PathBuf>,

    #[arg(long, default_value = DEFAULT_AGENT_JAR)]
    pub attach_agent_jar: PathBuf,

    /// Directory holding the latest profile of every unit.
    #[arg(long)]
    pub scratch_dir: Option<PathBuf>,

    /// Label added to every profile, as KEY=VALUE.
    #[arg(long = "external-label", value_parser = parse_label)]
    pub external_labels: Vec<(String, String)>,
}

impl Args {
    pub fn node_name(&self) -> String {
        self.node.clone().unwrap_or_else(|| {
            std::fs::read_to_string(HOSTNAME)
                .map(|s| s.trim().to_string())
                .unwrap_or_else(|_| "unknown".to_string())
        })
    }

    pub fn sampling_duration(&self) -> Duration {
        Duration::from_secs(self.sampling_duration)
    }

    pub fn kallsyms_refresh(&self) -> Duration {
        Duration::from_secs(self.kallsyms_refresh)
    }

    pub fn jvm_attach(&self) -> JvmAttachConfig {
        JvmAttachConfig {
            java_home: self.java_home.clone(),
            agent_jar: self.attach_agent_jar.clone(),
        }
    }

    pub fn external_labels(&self) -> ExternalLabels {
        self.external_labels.iter().cloned().collect()
    }

    /// Scratch file of a unit.
    pub fn scratch_path(&self, unit: &str) -> PathBuf {
        self.scratch_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir)
            .join(format!("evagent-{unit}.pb.gz"))
    }
}

fn parse_label(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("invalid label {s:?}, expected KEY=VALUE")),
    }
}
