use anyhow::Context;
use object::elf::{FileHeader64, NT_GNU_BUILD_ID};
use object::read::elf::NoteIterator;
use moka::sync::Cache;
use object::{Endianness, Object, ObjectKind};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Kernel notes, including the GNU build ID of the running kernel.
pub const KERNEL_NOTES: &str = "/sys/kernel/notes";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutableInfo {
    pub kind: ObjectKind,
    /// Hex encoded GNU build ID, when the object carries one.
    pub build_id: Option<String>,
}

impl ExecutableInfo {
    pub fn read(path: &Path) -> anyhow::Result<Self> {
        let data = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        Self::parse(&data).with_context(|| format!("failed to parse {}", path.display()))
    }

    pub fn parse(data: &[u8]) -> anyhow::Result<Self> {
        let file = object::File::parse(data)?;
        let build_id = file.build_id()?.map(hex);

        Ok(Self {
            kind: file.kind(),
            build_id,
        })
    }
}

/// Build IDs of object files, kept across sampling windows.
///
/// Entries are keyed by path and modification time, so a replaced file is read again.
#[derive(Debug, Clone)]
pub struct BuildIdCache {
    c: Cache<(PathBuf, SystemTime), Option<String>>,
}

impl Default for BuildIdCache {
    fn default() -> Self {
        Self::new(4096)
    }
}

impl BuildIdCache {
    pub fn new(cap: u64) -> Self {
        Self { c: Cache::new(cap) }
    }

    pub fn get(&self, path: &Path) -> Option<String> {
        let modified = match fs::metadata(path).and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(e) => {
                log::debug!("No build ID for {}: {}", path.display(), e);
                return None;
            }
        };

        self.c
            .get_with((path.to_path_buf(), modified), || {
                match ExecutableInfo::read(path) {
                    Ok(info) if matches!(info.kind, ObjectKind::Executable | ObjectKind::Dynamic) => {
                        info.build_id
                    }
                    Ok(info) => {
                        log::debug!("Ignoring {:?} object {}", info.kind, path.display());
                        None
                    }
                    Err(e) => {
                        log::debug!("No build ID for {}: {:#}", path.display(), e);
                        None
                    }
                }
            })
    }
}

/// Reads the running kernel's GNU build ID from a raw ELF note section.
pub fn kernel_build_id(notes: &Path) -> anyhow::Result<Option<String>> {
    let data = fs::read(notes).with_context(|| format!("failed to read {}", notes.display()))?;
    Ok(find_gnu_build_id(&data))
}

fn find_gnu_build_id(data: &[u8]) -> Option<String> {
    let endian = Endianness::default();
    let mut notes = NoteIterator::<FileHeader64<Endianness>>::new(endian, 4, data).ok()?;
    while let Ok(Some(note)) = notes.next() {
        if note.n_type(endian) == NT_GNU_BUILD_ID && note.name() == b"GNU" {
            return Some(hex(note.desc()));
        }
    }
    None
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
