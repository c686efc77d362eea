mod profiler;
mod target;

pub use profiler::{CgroupProfiler, Sink};
pub use target::{CgroupMode, SystemdUnitTarget, CGROUP_ROOT};

use crate::pprofpb::Profile;
use std::collections::BTreeMap;

/// Label name to value, attached to every record of a target.
pub type ExternalLabels = BTreeMap<String, String>;

/// One sampling window of a target, ready for delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub profile: Profile,
    pub labels: ExternalLabels,
}
