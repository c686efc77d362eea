mod builder;
mod encode;
pub mod executableinfo;
pub mod maps;

pub use builder::{ObjectFile, ProfileBuilder};
#[cfg(test)]
pub use encode::decode_gzip;
pub use encode::encode_gzip;

use std::time::Duration;

/// One aggregated stack as produced by a sampler.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawSample {
    pub pid: u32,
    /// Kernel instruction pointers, leaf first.
    pub kernel_stack: Vec<u64>,
    /// User space instruction pointers, leaf first.
    pub user_stack: Vec<u64>,
    /// Number of times the stack was observed in the window.
    pub count: i64,
}

/// The unsymbolized output of one sampling window.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawProfile {
    pub samples: Vec<RawSample>,
    /// Time between two samples of the same thread.
    pub period: Duration,
}
