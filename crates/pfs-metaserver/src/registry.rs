//! File registry, descriptor table, and striping-plan side effects.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use pfs_config::{Mode, PfsConfig, PfsError};
use pfs_striping::ChunkPlan;

/// A single chunk's recorded extent: the contiguous union of bytes written
/// to it so far.
#[derive(Debug, Clone, Copy)]
pub struct ChunkExtent {
    pub start_byte: u64,
    pub end_byte: u64,
}

#[derive(Debug, Clone)]
struct FileRecord {
    stripe_width: u32,
    size: u64,
    ctime: i64,
    mtime: i64,
    chunks: BTreeMap<u64, ChunkExtent>,
}

impl FileRecord {
    fn new(stripe_width: u32, now: i64) -> Self {
        Self {
            stripe_width,
            size: 0,
            ctime: now,
            mtime: now,
            chunks: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DescriptorEntry {
    client_id: u64,
    mode: DescriptorMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DescriptorMode {
    Read,
    Write,
}

impl From<Mode> for DescriptorMode {
    fn from(m: Mode) -> Self {
        match m {
            Mode::Read => DescriptorMode::Read,
            Mode::Write => DescriptorMode::Write,
        }
    }
}

/// A snapshot of a file's metadata, as returned by `fstat`.
#[derive(Debug, Clone)]
pub struct FileStat {
    pub name: String,
    pub size: u64,
    pub ctime: i64,
    pub mtime: i64,
    pub stripe_width: u32,
    pub chunks: Vec<(u64, ChunkExtent)>,
}

struct Inner {
    files: HashMap<String, FileRecord>,
    descriptors: HashMap<u64, (String, DescriptorEntry)>,
    open_by_file: HashMap<String, HashSet<u64>>,
    descriptors_by_client: HashMap<u64, HashSet<u64>>,
    next_descriptor: u64,
    next_client_id: u64,
}

/// The metadata service's file registry and descriptor table, guarded by a
/// single mutex.
pub struct FileRegistry {
    inner: Mutex<Inner>,
}

impl Default for FileRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FileRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                files: HashMap::new(),
                descriptors: HashMap::new(),
                open_by_file: HashMap::new(),
                descriptors_by_client: HashMap::new(),
                // fds 0..2 are reserved, matching POSIX descriptor
                // numbering.
                next_descriptor: 3,
                next_client_id: 1,
            }),
        }
    }

    pub fn initialize_client(&self) -> u64 {
        let mut inner = self.inner.lock();
        let id = inner.next_client_id;
        inner.next_client_id += 1;
        id
    }

    pub fn create(&self, name: &str, stripe_width: u32, max_width: u32) -> Result<(), PfsError> {
        if stripe_width == 0 || stripe_width > max_width {
            return Err(PfsError::InvalidArgument(format!(
                "stripe width {stripe_width} out of range [1, {max_width}]"
            )));
        }
        let mut inner = self.inner.lock();
        if inner.files.contains_key(name) {
            return Err(PfsError::AlreadyExists(name.to_string()));
        }
        inner
            .files
            .insert(name.to_string(), FileRecord::new(stripe_width, now()));
        Ok(())
    }

    pub fn open(&self, name: &str, mode: Mode, client_id: u64) -> Result<u64, PfsError> {
        let mut inner = self.inner.lock();
        if !inner.files.contains_key(name) {
            return Err(PfsError::NotFound(name.to_string()));
        }
        let descriptor = inner.next_descriptor;
        inner.next_descriptor += 1;
        inner.descriptors.insert(
            descriptor,
            (
                name.to_string(),
                DescriptorEntry {
                    client_id,
                    mode: mode.into(),
                },
            ),
        );
        inner
            .open_by_file
            .entry(name.to_string())
            .or_default()
            .insert(descriptor);
        inner
            .descriptors_by_client
            .entry(client_id)
            .or_default()
            .insert(descriptor);
        Ok(descriptor)
    }

    /// Drop a descriptor. Returns the filename and owning client so the
    /// caller can release every token the closing client holds on that
    /// file.
    pub fn close(&self, descriptor: u64) -> Result<(String, u64), PfsError> {
        let mut inner = self.inner.lock();
        let (name, entry) = inner
            .descriptors
            .remove(&descriptor)
            .ok_or_else(|| PfsError::NotFound(format!("descriptor {descriptor}")))?;
        if let Some(set) = inner.open_by_file.get_mut(&name) {
            set.remove(&descriptor);
            if set.is_empty() {
                inner.open_by_file.remove(&name);
            }
        }
        if let Some(set) = inner.descriptors_by_client.get_mut(&entry.client_id) {
            set.remove(&descriptor);
            if set.is_empty() {
                inner.descriptors_by_client.remove(&entry.client_id);
            }
        }
        Ok((name, entry.client_id))
    }

    /// All descriptors still open for `client_id`. Used to emulate a hard
    /// Close of every descriptor when a client's stream disconnects.
    pub fn descriptors_for_client(&self, client_id: u64) -> Vec<u64> {
        let inner = self.inner.lock();
        inner
            .descriptors_by_client
            .get(&client_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Resolve a descriptor to its filename and owning client, for
    /// descriptor validation in the token stream handler.
    pub fn descriptor_owner(&self, descriptor: u64) -> Option<(String, u64)> {
        let inner = self.inner.lock();
        inner
            .descriptors
            .get(&descriptor)
            .map(|(name, entry)| (name.clone(), entry.client_id))
    }

    pub fn delete(&self, name: &str) -> Result<(), PfsError> {
        let mut inner = self.inner.lock();
        if !inner.files.contains_key(name) {
            return Err(PfsError::NotFound(name.to_string()));
        }
        if inner
            .open_by_file
            .get(name)
            .is_some_and(|set| !set.is_empty())
        {
            return Err(PfsError::Busy(name.to_string()));
        }
        inner.files.remove(name);
        Ok(())
    }

    pub fn stat(&self, descriptor: u64) -> Result<FileStat, PfsError> {
        let inner = self.inner.lock();
        let (name, _) = inner
            .descriptors
            .get(&descriptor)
            .ok_or_else(|| PfsError::NotFound(format!("descriptor {descriptor}")))?;
        let record = inner
            .files
            .get(name)
            .ok_or_else(|| PfsError::NotFound(name.clone()))?;
        Ok(FileStat {
            name: name.clone(),
            size: record.size,
            ctime: record.ctime,
            mtime: record.mtime,
            stripe_width: record.stripe_width,
            chunks: record.chunks.iter().map(|(&k, &v)| (k, v)).collect(),
        })
    }

    /// Compute a read plan. No mutation.
    pub fn read_plan(
        &self,
        descriptor: u64,
        offset: u64,
        num_bytes: u64,
        config: &PfsConfig,
    ) -> Result<(String, Vec<ChunkPlan>), PfsError> {
        let inner = self.inner.lock();
        let (name, _) = inner
            .descriptors
            .get(&descriptor)
            .ok_or_else(|| PfsError::NotFound(format!("descriptor {descriptor}")))?;
        let record = inner
            .files
            .get(name)
            .ok_or_else(|| PfsError::NotFound(name.clone()))?;

        let plan = pfs_striping::plan_read(
            offset,
            num_bytes,
            record.stripe_width,
            config.chunk_size(),
            record.size,
            |k| record.chunks.contains_key(&k),
        );
        Ok((name.clone(), plan))
    }

    /// Compute a write plan. Updates the file record (chunks, size, mtime)
    /// synchronously before returning, so a subsequent `fstat` or read plan
    /// already sees the write.
    pub fn write_plan(
        &self,
        descriptor: u64,
        offset: u64,
        num_bytes: u64,
        config: &PfsConfig,
    ) -> Result<(String, Vec<ChunkPlan>), PfsError> {
        let mut inner = self.inner.lock();
        let (name, entry) = inner
            .descriptors
            .get(&descriptor)
            .ok_or_else(|| PfsError::NotFound(format!("descriptor {descriptor}")))?
            .clone();
        if entry.mode != DescriptorMode::Write {
            return Err(PfsError::InvalidArgument(format!(
                "descriptor {descriptor} was not opened for write"
            )));
        }
        let record = inner
            .files
            .get_mut(&name)
            .ok_or_else(|| PfsError::NotFound(name.clone()))?;

        let plan = pfs_striping::plan_write(
            offset,
            num_bytes,
            record.stripe_width,
            config.chunk_size(),
            record.size,
        )
        .map_err(|e| PfsError::InvalidArgument(e.to_string()))?;

        let mut new_high_water = record.size;
        for p in &plan {
            record
                .chunks
                .entry(p.chunk_index)
                .and_modify(|extent| {
                    extent.start_byte = extent.start_byte.min(p.start);
                    extent.end_byte = extent.end_byte.max(p.end);
                })
                .or_insert(ChunkExtent {
                    start_byte: p.start,
                    end_byte: p.end,
                });
            new_high_water = new_high_water.max(p.end + 1);
        }
        record.size = new_high_water;
        record.mtime = now().max(record.mtime);

        Ok((name, plan))
    }
}

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
