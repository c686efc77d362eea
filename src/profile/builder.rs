use super::executableinfo::BuildIdCache;
use super::maps::{object_path, ExecutableMapping, ProcessMappings};
use super::{RawProfile, RawSample};
use crate::pprofpb::{Function, Label, Line, Location, Mapping, Profile, Sample, ValueType};
use crate::symbolizer::SymbolResolver;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

pub const KERNEL_MAPPING: &str = "[kernel.kallsyms]";

/// An object file referenced by a profile that can be uploaded as debug information.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectFile {
    pub build_id: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct BuiltProfile {
    pub profile: Profile,
    /// Objects with a build ID referenced by the profile's mappings, one per build ID.
    pub objects: Vec<ObjectFile>,
}

struct StringTable {
    strings: Vec<String>,
    index: HashMap<String, i64>,
}

impl StringTable {
    fn new() -> Self {
        let mut table = Self {
            strings: Vec::new(),
            index: HashMap::new(),
        };
        // pprof requires string_table[0] to be "".
        table.intern("");
        table
    }

    fn intern(&mut self, s: &str) -> i64 {
        if let Some(&idx) = self.index.get(s) {
            return idx;
        }
        let idx = self.strings.len() as i64;
        self.strings.push(s.to_string());
        self.index.insert(s.to_string(), idx);
        idx
    }
}

/// Assembles raw samples of one sampling window into a pprof profile.
///
/// Kernel frames are symbolized here. User space frames are attached to the mapping of the
/// object they belong to and left for the store to symbolize with uploaded debug information.
/// No frame is dropped: an address that cannot be resolved becomes a location without lines,
/// and one outside of any known mapping a location without a mapping.
pub struct ProfileBuilder {
    resolver: SymbolResolver,
    proc_root: PathBuf,
    kernel_build_id: Option<String>,
    build_ids: BuildIdCache,

    strings: StringTable,
    samples: Vec<Sample>,
    mappings: Vec<Mapping>,
    locations: Vec<Location>,
    functions: Vec<Function>,

    kernel_mapping: Option<u64>,
    kernel_locations: HashMap<u64, u64>,
    user_locations: HashMap<(u32, u64), u64>,
    user_mappings: HashMap<(u32, u64), u64>,
    function_ids: HashMap<String, u64>,
    process_mappings: HashMap<u32, Option<ProcessMappings>>,
    objects: BTreeMap<String, PathBuf>,
}

impl ProfileBuilder {
    pub fn new(
        resolver: SymbolResolver,
        proc_root: impl Into<PathBuf>,
        kernel_build_id: Option<String>,
        build_ids: BuildIdCache,
    ) -> Self {
        Self {
            resolver,
            proc_root: proc_root.into(),
            kernel_build_id,
            build_ids,
            strings: StringTable::new(),
            samples: Vec::new(),
            mappings: Vec::new(),
            locations: Vec::new(),
            functions: Vec::new(),
            kernel_mapping: None,
            kernel_locations: HashMap::new(),
            user_locations: HashMap::new(),
            user_mappings: HashMap::new(),
            function_ids: HashMap::new(),
            process_mappings: HashMap::new(),
            objects: BTreeMap::new(),
        }
    }

    pub fn build(
        mut self,
        raw: &RawProfile,
        started_at: DateTime<Utc>,
        duration: Duration,
    ) -> BuiltProfile {
        for sample in raw.samples.iter() {
            self.add_sample(sample);
        }
        self.finish(started_at, duration, raw.period)
    }

    pub fn add_sample(&mut self, sample: &RawSample) {
        let mut location_id =
            Vec::with_capacity(sample.kernel_stack.len() + sample.user_stack.len());

        for &addr in sample.kernel_stack.iter() {
            location_id.push(self.kernel_location(addr));
        }
        for &addr in sample.user_stack.iter() {
            location_id.push(self.user_location(sample.pid, addr));
        }

        let key = self.strings.intern("pid");
        self.samples.push(Sample {
            location_id,
            value: vec![sample.count],
            label: vec![Label {
                key,
                num: i64::from(sample.pid),
                ..Default::default()
            }],
        });
    }

    pub fn finish(
        mut self,
        started_at: DateTime<Utc>,
        duration: Duration,
        period: Duration,
    ) -> BuiltProfile {
        let sample_type = ValueType {
            r#type: self.strings.intern("samples"),
            unit: self.strings.intern("count"),
        };
        let period_type = ValueType {
            r#type: self.strings.intern("cpu"),
            unit: self.strings.intern("nanoseconds"),
        };

        let profile = Profile {
            sample_type: vec![sample_type],
            sample: self.samples,
            mapping: self.mappings,
            location: self.locations,
            function: self.functions,
            string_table: self.strings.strings,
            time_nanos: started_at.timestamp_nanos_opt().unwrap_or_default(),
            duration_nanos: nanos(duration),
            period_type: Some(period_type),
            period: nanos(period),
            ..Default::default()
        };

        let objects = self
            .objects
            .into_iter()
            .map(|(build_id, path)| ObjectFile { build_id, path })
            .collect();

        BuiltProfile { profile, objects }
    }

    fn kernel_location(&mut self, addr: u64) -> u64 {
        if let Some(&id) = self.kernel_locations.get(&addr) {
            return id;
        }

        let mapping_id = self.kernel_mapping_id();
        let line = match self.resolver.resolve(addr) {
            Some(sym) => vec![Line {
                function_id: self.function_id(&sym.name, &sym.system_name),
                line: 0,
            }],
            None => Vec::new(),
        };

        let id = self.push_location(mapping_id, addr, line);
        self.kernel_locations.insert(addr, id);
        id
    }

    fn user_location(&mut self, pid: u32, addr: u64) -> u64 {
        if let Some(&id) = self.user_locations.get(&(pid, addr)) {
            return id;
        }

        let mapping_id = match self.find_mapping(pid, addr) {
            Some(m) => self.user_mapping_id(pid, &m),
            None => 0,
        };

        let id = self.push_location(mapping_id, addr, Vec::new());
        self.user_locations.insert((pid, addr), id);
        id
    }

    fn push_location(&mut self, mapping_id: u64, address: u64, line: Vec<Line>) -> u64 {
        let id = self.locations.len() as u64 + 1;
        self.locations.push(Location {
            id,
            mapping_id,
            address,
            line,
            is_folded: false,
        });
        id
    }

    fn kernel_mapping_id(&mut self) -> u64 {
        if let Some(id) = self.kernel_mapping {
            return id;
        }

        let id = self.mappings.len() as u64 + 1;
        let filename = self.strings.intern(KERNEL_MAPPING);
        let build_id = self.strings.intern(self.kernel_build_id.as_deref().unwrap_or_default());
        self.mappings.push(Mapping {
            id,
            filename,
            build_id,
            has_functions: true,
            ..Default::default()
        });
        self.kernel_mapping = Some(id);
        id
    }

    fn user_mapping_id(&mut self, pid: u32, m: &ExecutableMapping) -> u64 {
        if let Some(&id) = self.user_mappings.get(&(pid, m.start)) {
            return id;
        }

        let path = object_path(&self.proc_root, pid, &m.path);
        let build_id = self.build_ids.get(&path);
        if let Some(build_id) = &build_id {
            self.objects.entry(build_id.clone()).or_insert(path);
        }

        let id = self.mappings.len() as u64 + 1;
        let filename = self.strings.intern(&m.path);
        let build_id = self.strings.intern(build_id.as_deref().unwrap_or_default());
        self.mappings.push(Mapping {
            id,
            memory_start: m.start,
            memory_limit: m.end,
            file_offset: m.offset,
            filename,
            build_id,
            ..Default::default()
        });
        self.user_mappings.insert((pid, m.start), id);
        id
    }

    fn find_mapping(&mut self, pid: u32, addr: u64) -> Option<ExecutableMapping> {
        let proc_root = &self.proc_root;
        let mappings = self.process_mappings.entry(pid).or_insert_with(|| {
            ProcessMappings::read(proc_root, pid)
                .map_err(|e| log::debug!("No mappings for pid {}: {:#}", pid, e))
                .ok()
        });
        mappings.as_ref()?.find(addr).cloned()
    }

    fn function_id(&mut self, name: &str, system_name: &str) -> u64 {
        if let Some(&id) = self.function_ids.get(system_name) {
            return id;
        }

        let id = self.functions.len() as u64 + 1;
        let function = Function {
            id,
            name: self.strings.intern(name),
            system_name: self.strings.intern(system_name),
            filename: 0,
            start_line: 0,
        };
        self.functions.push(function);
        self.function_ids.insert(system_name.to_string(), id);
        id
    }
}

fn nanos(d: Duration) -> i64 {
    i64::try_from(d.as_nanos()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{own_executable_mapping, StaticKsyms};
    use std::path::Path;
    use std::sync::Arc;

    fn resolver() -> SymbolResolver {
        SymbolResolver::new(Arc::new(StaticKsyms::new(&[
            (0xffffffff81000100, "do_syscall_64"),
            (0xffffffff81000200, "vfs_read"),
        ])))
    }

    fn string<'p>(p: &'p Profile, idx: i64) -> &'p str {
        &p.string_table[idx as usize]
    }

    fn location(p: &Profile, id: u64) -> &Location {
        &p.location[id as usize - 1]
    }

    fn build(raw: &RawProfile, proc_root: &Path) -> BuiltProfile {
        ProfileBuilder::new(
            resolver(),
            proc_root,
            Some("abcd".to_string()),
            BuildIdCache::default(),
        )
        .build(raw, Utc::now(), Duration::from_secs(10))
    }

    #[test]
    fn test_empty_profile_is_valid() {
        let built = build(&RawProfile::default(), Path::new("/proc"));
        let p = &built.profile;

        assert!(p.sample.is_empty());
        assert!(p.function.is_empty());
        assert_eq!(p.string_table[0], "");
        assert_eq!(string(p, p.sample_type[0].r#type), "samples");
        assert_eq!(p.duration_nanos, 10_000_000_000);
        assert!(built.objects.is_empty());
    }

    #[test]
    fn test_kernel_frames_resolved_or_kept_unresolved() {
        let raw = RawProfile {
            samples: vec![RawSample {
                pid: 10,
                kernel_stack: vec![0xffffffff81000200, 0xffffffff8badf00d, 0xffffffff81000100],
                user_stack: vec![],
                count: 3,
            }],
            period: Duration::from_millis(10),
        };
        let p = build(&raw, Path::new("/proc")).profile;

        assert_eq!(p.sample.len(), 1);
        assert_eq!(p.sample[0].value, vec![3]);
        assert_eq!(p.sample[0].location_id.len(), 3);
        assert_eq!(p.period, 10_000_000);

        let leaf = location(&p, p.sample[0].location_id[0]);
        assert_eq!(leaf.address, 0xffffffff81000200);
        assert_eq!(leaf.line.len(), 1);
        let f = &p.function[leaf.line[0].function_id as usize - 1];
        assert_eq!(string(&p, f.name), "vfs_read");

        let unresolved = location(&p, p.sample[0].location_id[1]);
        assert_eq!(unresolved.address, 0xffffffff8badf00d);
        assert!(unresolved.line.is_empty());

        let mapping = &p.mapping[unresolved.mapping_id as usize - 1];
        assert_eq!(string(&p, mapping.filename), KERNEL_MAPPING);
        assert_eq!(string(&p, mapping.build_id), "abcd");
    }

    #[test]
    fn test_locations_and_functions_are_shared() {
        let sample = RawSample {
            pid: 1,
            kernel_stack: vec![0xffffffff81000100],
            user_stack: vec![],
            count: 1,
        };
        let raw = RawProfile {
            samples: vec![
                sample.clone(),
                RawSample {
                    pid: 2,
                    ..sample
                },
            ],
            period: Duration::from_millis(10),
        };
        let p = build(&raw, Path::new("/proc")).profile;

        assert_eq!(p.sample.len(), 2);
        assert_eq!(p.location.len(), 1);
        assert_eq!(p.function.len(), 1);
        assert_eq!(p.mapping.len(), 1);
        assert_eq!(string(&p, p.sample[1].label[0].key), "pid");
        assert_eq!(p.sample[1].label[0].num, 2);
    }

    #[test]
    fn test_user_frames_attach_to_mappings() {
        let pid = std::process::id();
        let text = own_executable_mapping();

        let raw = RawProfile {
            samples: vec![RawSample {
                pid,
                kernel_stack: vec![],
                user_stack: vec![text.start + 1, 0x10],
                count: 1,
            }],
            period: Duration::from_millis(10),
        };
        let built = build(&raw, Path::new("/proc"));
        let p = &built.profile;

        let mapped = location(p, p.sample[0].location_id[0]);
        assert!(mapped.line.is_empty());
        let mapping = &p.mapping[mapped.mapping_id as usize - 1];
        assert_eq!(string(p, mapping.filename), text.path);
        assert_eq!(mapping.memory_start, text.start);

        let unmapped = location(p, p.sample[0].location_id[1]);
        assert_eq!(unmapped.mapping_id, 0);
        assert_eq!(unmapped.address, 0x10);

        let build_id = string(p, mapping.build_id);
        if build_id.is_empty() {
            assert!(built.objects.is_empty());
        } else {
            assert_eq!(built.objects.len(), 1);
            assert_eq!(built.objects[0].build_id, build_id);
            assert_eq!(
                built.objects[0].path,
                object_path(Path::new("/proc"), pid, &text.path)
            );
        }
    }

    #[test]
    fn test_user_frames_of_vanished_process() {
        let proc_root = tempfile::tempdir().unwrap();
        let raw = RawProfile {
            samples: vec![RawSample {
                pid: 4242,
                kernel_stack: vec![],
                user_stack: vec![0x401000],
                count: 1,
            }],
            period: Duration::from_millis(10),
        };
        let p = build(&raw, proc_root.path()).profile;

        assert_eq!(p.location.len(), 1);
        assert_eq!(p.location[0].mapping_id, 0);
        assert!(p.mapping.is_empty());
    }
}
