//! Compound file engine
//!
//! Orchestrates everything the on-disk structure needs: header parsing,
//! lazy sector materialisation, the DIFAT walk, FAT and mini-FAT chain
//! allocation, the mini-stream aggregation layer, directory persistence and
//! the in-place differential commit.
//!
//! The engine is a single-threaded object; every public operation borrows
//! it mutably. All I/O is synchronous against the backing seekable stream,
//! which the engine owns until `close` (subject to `LEAVE_OPEN`).

use crate::directory::{DirectoryEntry, EntryInfo, StgType, DIRECTORY_ENTRY_SIZE, NOSTREAM};
use crate::error::{CfbError, Result};
use crate::header::{Header, HEADER_DIFAT_ENTRIES, HEADER_SIZE};
use crate::rbtree::{self, SiblingTree};
use crate::sector::{
    Sector, SectorCollection, SectorType, DIFSECT, ENDOFCHAIN, FATSECT, FREESECT, MINI_SECTOR_SIZE,
};
use crate::storage::Storage;
use crate::stream_view::StreamView;
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::ops::BitOr;
use std::path::Path;

/// Format major version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    /// 512-byte sectors
    V3,
    /// 4096-byte sectors
    V4,
}

impl Version {
    pub fn major(self) -> u16 {
        match self {
            Version::V3 => 3,
            Version::V4 => 4,
        }
    }

    fn from_major(major: u16) -> Result<Self> {
        match major {
            3 => Ok(Version::V3),
            4 => Ok(Version::V4),
            other => Err(CfbError::FileFormat(format!(
                "unsupported major version {}",
                other
            ))),
        }
    }
}

/// How the backing stream may be touched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMode {
    /// Mutations stay in memory; persistence only through `save`
    ReadOnly,
    /// `commit` writes dirty sectors back in place
    Update,
}

/// Engine behaviour flags (bitset)
///
/// `DEFAULT` leaves everything off: freed sectors are neither reused nor
/// zeroed, corruption findings raise errors, and `close` drops the backing
/// stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Config(u32);

impl Config {
    pub const DEFAULT: Config = Config(0);
    /// Reuse freed sectors before appending fresh ones
    pub const SECTOR_RECYCLE: Config = Config(1 << 0);
    /// Zero freed sector bodies
    pub const ERASE_FREE_SECTORS: Config = Config(1 << 1);
    /// Downgrade sibling-validation findings from error to subtree skip
    pub const NO_VALIDATION_EXCEPTION: Config = Config(1 << 2);
    /// Keep the backing stream open when the engine closes
    pub const LEAVE_OPEN: Config = Config(1 << 3);

    pub fn contains(self, other: Config) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Config {
    type Output = Config;
    fn bitor(self, rhs: Config) -> Config {
        Config(self.0 | rhs.0)
    }
}

/// Staging buffer size for mini/normal transition copies.
const TRANSITION_BUF: usize = 4096;

/// Compound file engine
///
/// Owns the header, the sector collection, the directory and the backing
/// stream. The convenience handles in [`crate::storage`] drive the
/// operations defined here.
pub struct CompoundFile<F> {
    header: Header,
    version: Version,
    mode: UpdateMode,
    config: Config,

    sectors: SectorCollection,
    /// Session-local view of the mini stream, indexed by mini sector id.
    /// Payloads fault in from the root entry's chain and are stitched back
    /// by `persist_mini_stream`.
    mini_sectors: SectorCollection,

    directory: Vec<DirectoryEntry>,

    /// DIFAT: ids of the sectors holding the FAT
    fat_ids: Vec<u32>,
    /// Ids of the chained DIFAT sectors
    difat_ids: Vec<u32>,
    /// Cached directory chain
    dir_ids: Vec<u32>,
    /// Cached mini-FAT chain
    minifat_ids: Vec<u32>,

    source: Option<F>,
    source_len: u64,
    closed: bool,

    free_queue: VecDeque<u32>,
    mini_free_queue: VecDeque<u32>,

    /// Range-lock sector reserved after crossing the v3 size boundary
    lock_sector: Option<u32>,
    /// Whether the lock sector has been marked ENDOFCHAIN in the FAT
    lock_allocated: bool,
}

impl CompoundFile<File> {
    /// Create an empty in-memory compound file. Persist with [`save`].
    ///
    /// [`save`]: CompoundFile::save
    pub fn create(version: Version) -> Self {
        Self::create_with(version, Config::DEFAULT)
    }

    pub fn create_with(version: Version, config: Config) -> Self {
        CompoundFile {
            header: Header::new(version.major()),
            version,
            mode: UpdateMode::ReadOnly,
            config,
            sectors: SectorCollection::new(),
            mini_sectors: SectorCollection::new(),
            directory: vec![DirectoryEntry::root()],
            fat_ids: Vec::new(),
            difat_ids: Vec::new(),
            dir_ids: Vec::new(),
            minifat_ids: Vec::new(),
            source: None,
            source_len: 0,
            closed: false,
            free_queue: VecDeque::new(),
            mini_free_queue: VecDeque::new(),
            lock_sector: None,
            lock_allocated: false,
        }
    }

    /// Open a file read-only with default flags.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with(path, UpdateMode::ReadOnly, Config::DEFAULT)
    }

    /// Open a file in the given mode.
    ///
    /// ReadOnly requests read access only; Update requests read/write and
    /// enables `commit`. POSIX carries no mandatory share modes, so the
    /// mode governs which access is requested, not cross-process locking.
    pub fn open_with<P: AsRef<Path>>(path: P, mode: UpdateMode, config: Config) -> Result<Self> {
        let file = match mode {
            UpdateMode::ReadOnly => OpenOptions::new().read(true).open(path)?,
            UpdateMode::Update => OpenOptions::new().read(true).write(true).open(path)?,
        };
        Self::from_stream_with(file, mode, config)
    }

    /// Version-3-only in-place compaction.
    ///
    /// Rebuilds the file into a fresh compound file, dropping free sectors
    /// and tombstoned directory slots, then overwrites the source in place
    /// and truncates it. The file must be both readable and writable.
    /// Version 4 files are rejected with `InvalidOperation`.
    pub fn shrink<P: AsRef<Path>>(path: P) -> Result<()> {
        let mut src = Self::open_with(&path, UpdateMode::Update, Config::LEAVE_OPEN)?;
        if src.version == Version::V4 {
            src.close()?;
            return Err(CfbError::InvalidOperation(
                "shrink is only supported for version 3 files".into(),
            ));
        }

        let mut dest = Self::create(src.version);
        copy_storage_tree(&mut src, 0, &mut dest, 0)?;

        let mut buf: Vec<u8> = Vec::new();
        dest.save_to_stream(&mut buf)?;

        src.close()?;
        let mut file = src.into_inner().ok_or(CfbError::Disposed)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&buf)?;
        file.set_len(buf.len() as u64)?;
        file.sync_all()?;
        Ok(())
    }
}

impl<F: Read + Write + Seek> CompoundFile<F> {
    /// Load from an arbitrary seekable stream, read-only.
    pub fn from_stream(stream: F) -> Result<Self> {
        Self::from_stream_with(stream, UpdateMode::ReadOnly, Config::DEFAULT)
    }

    pub fn from_stream_with(mut stream: F, mode: UpdateMode, config: Config) -> Result<Self> {
        let source_len = stream.seek(SeekFrom::End(0))?;
        stream.seek(SeekFrom::Start(0))?;

        let mut prefix = vec![0u8; HEADER_SIZE.min(source_len as usize)];
        stream.read_exact(&mut prefix)?;
        let header = Header::from_bytes(&prefix)?;
        let version = Version::from_major(header.major_version)?;

        let sector_size = header.sector_size();
        let sector_count =
            (source_len.saturating_sub(sector_size as u64) as usize).div_ceil(sector_size);

        let mut sectors = SectorCollection::new();
        sectors.set_len(sector_count);

        let mut cf = CompoundFile {
            header,
            version,
            mode,
            config,
            sectors,
            mini_sectors: SectorCollection::new(),
            directory: Vec::new(),
            fat_ids: Vec::new(),
            difat_ids: Vec::new(),
            dir_ids: Vec::new(),
            minifat_ids: Vec::new(),
            source: Some(stream),
            source_len,
            closed: false,
            free_queue: VecDeque::new(),
            mini_free_queue: VecDeque::new(),
            lock_sector: None,
            lock_allocated: false,
        };

        if let Err(err) = cf.load() {
            // fatal load errors close the engine before surfacing
            let _ = cf.close();
            return Err(err);
        }
        Ok(cf)
    }

    fn load(&mut self) -> Result<()> {
        self.load_fat_ids()?;

        let first_dir = self.header.first_directory_sector;
        self.dir_ids = self.chain(first_dir)?;
        self.load_directory()?;

        let root = self
            .directory
            .first()
            .filter(|e| e.stg_type == StgType::Root)
            .ok_or_else(|| CfbError::Corrupted("missing Root Entry at SID 0".into()))?;
        let mini_count = (root.size / MINI_SECTOR_SIZE as u64) as usize;
        self.mini_sectors.set_len(mini_count);

        if self.header.first_mini_fat_sector != ENDOFCHAIN {
            self.minifat_ids = self.chain(self.header.first_mini_fat_sector)?;
        }
        Ok(())
    }

    /// Walk the DIFAT: 109 header entries, then the DIFAT sector chain.
    fn load_fat_ids(&mut self) -> Result<()> {
        let fat_count = self.header.fat_sectors_count as usize;
        let mut ids = Vec::with_capacity(fat_count);

        for &entry in self.header.difat.iter() {
            if ids.len() == fat_count || entry == FREESECT {
                break;
            }
            ids.push(entry);
        }

        if fat_count > ids.len() {
            let per_sector = self.sector_size() / 4 - 1;
            let declared = self.header.difat_sectors_count as usize;
            let mut cursor = self.header.first_difat_sector;
            let mut difat_ids = Vec::new();

            while cursor != ENDOFCHAIN && cursor != FREESECT {
                if cursor as usize >= self.sectors.len() {
                    return Err(CfbError::Corrupted(format!(
                        "DIFAT sector {} out of range",
                        cursor
                    )));
                }
                if difat_ids.len() >= declared {
                    return Err(CfbError::Corrupted(
                        "DIFAT chain longer than the declared sector count".into(),
                    ));
                }
                difat_ids.push(cursor);

                let data = self.sector_bytes(cursor, SectorType::Difat)?;
                for slot in 0..per_sector {
                    if ids.len() == fat_count {
                        break;
                    }
                    let off = slot * 4;
                    let value =
                        u32::from_le_bytes([data[off], data[off + 1], data[off + 2], data[off + 3]]);
                    if value == FREESECT {
                        break;
                    }
                    ids.push(value);
                }
                let tail = per_sector * 4;
                cursor = u32::from_le_bytes([
                    data[tail],
                    data[tail + 1],
                    data[tail + 2],
                    data[tail + 3],
                ]);
            }

            if cursor == FREESECT {
                // plenty of real files terminate the chain this way
                tracing::warn!("DIFAT chain terminated with FREESECT instead of ENDOFCHAIN");
            }
            if difat_ids.len() != declared {
                return Err(CfbError::Corrupted(format!(
                    "walked {} DIFAT sectors, header declares {}",
                    difat_ids.len(),
                    declared
                )));
            }
            self.difat_ids = difat_ids;
        }

        if ids.len() != fat_count {
            return Err(CfbError::Corrupted(format!(
                "walked {} FAT sectors, header declares {}",
                ids.len(),
                fat_count
            )));
        }
        self.fat_ids = ids;
        Ok(())
    }

    fn load_directory(&mut self) -> Result<()> {
        let sector_size = self.sector_size();
        let total = self.dir_ids.len() * sector_size;
        let mut bytes = vec![0u8; total];
        {
            let mut chain = std::mem::take(&mut self.dir_ids);
            let mut view = StreamView::new(
                &mut chain,
                &mut self.sectors,
                self.source.as_mut(),
                self.source_len,
                sector_size,
                SectorType::Directory,
                total as u64,
                None,
            );
            view.read_exact(&mut bytes)?;
            drop(view);
            self.dir_ids = chain;
        }

        let version_3 = self.version == Version::V3;
        let count = total / DIRECTORY_ENTRY_SIZE;
        let mut directory = Vec::with_capacity(count);
        for sid in 0..count {
            let off = sid * DIRECTORY_ENTRY_SIZE;
            let entry = DirectoryEntry::from_bytes(
                sid as u32,
                &bytes[off..off + DIRECTORY_ENTRY_SIZE],
                version_3,
            )?;
            directory.push(entry);
        }
        self.directory = directory;
        Ok(())
    }

    // ---- geometry ------------------------------------------------------

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn mode(&self) -> UpdateMode {
        self.mode
    }

    fn sector_size(&self) -> usize {
        self.header.sector_size()
    }

    fn mini_cutoff(&self) -> u64 {
        u64::from(self.header.min_standard_stream_size)
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(CfbError::Disposed)
        } else {
            Ok(())
        }
    }

    /// Close the engine, dropping every buffer. The backing stream is
    /// dropped too unless `LEAVE_OPEN` is set.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.sectors = SectorCollection::new();
        self.mini_sectors = SectorCollection::new();
        self.directory.clear();
        self.free_queue.clear();
        self.mini_free_queue.clear();
        if !self.config.contains(Config::LEAVE_OPEN) {
            self.source = None;
        }
        Ok(())
    }

    /// Take back the backing stream (present after a `LEAVE_OPEN` close).
    pub fn into_inner(mut self) -> Option<F> {
        self.source.take()
    }

    /// Escalate corruption: the engine closes before the error surfaces.
    fn seal<T>(&mut self, result: Result<T>) -> Result<T> {
        if matches!(result, Err(CfbError::Corrupted(_))) {
            let _ = self.close();
        }
        result
    }

    // ---- sector faulting ----------------------------------------------

    fn sector_bytes(&mut self, id: u32, sector_type: SectorType) -> Result<Vec<u8>> {
        let sector_size = self.sector_size();
        if self.sectors.get(id).is_none() {
            self.sectors
                .set(id, Sector::with_id(id, sector_size, sector_type));
        }
        let needs_load = {
            let sector = self.sectors.get(id).expect("slot exists");
            !sector.is_loaded() && sector.is_streamed(self.source_len)
        };
        if needs_load {
            let offset = self.sectors.get(id).expect("slot exists").file_offset();
            let mut buf = vec![0u8; sector_size];
            if let Some(source) = self.source.as_mut() {
                source.seek(SeekFrom::Start(offset))?;
                source.read_exact(&mut buf)?;
            }
            self.sectors.get_mut(id).expect("slot exists").set_loaded(buf);
        }
        Ok(self.sectors.get_mut(id).expect("slot exists").payload().to_vec())
    }

    // ---- FAT -----------------------------------------------------------

    fn read_fat(&mut self, id: u32) -> Result<u32> {
        let sector_size = self.sector_size();
        let len = (self.fat_ids.len() * sector_size) as u64;
        let mut view = StreamView::new(
            &mut self.fat_ids,
            &mut self.sectors,
            self.source.as_mut(),
            self.source_len,
            sector_size,
            SectorType::Fat,
            len,
            None,
        );
        Ok(view.read_u32_at(u64::from(id) * 4)?)
    }

    fn write_fat_raw(&mut self, id: u32, value: u32) -> Result<()> {
        let sector_size = self.sector_size();
        let len = (self.fat_ids.len() * sector_size) as u64;
        let mut view = StreamView::new(
            &mut self.fat_ids,
            &mut self.sectors,
            self.source.as_mut(),
            self.source_len,
            sector_size,
            SectorType::Fat,
            len,
            None,
        );
        view.write_u32_at(u64::from(id) * 4, value)?;
        Ok(())
    }

    fn write_fat(&mut self, id: u32, value: u32) -> Result<()> {
        self.ensure_fat_capacity()?;
        self.write_fat_raw(id, value)
    }

    /// Grow the FAT until it indexes every sector. Appending a FAT sector
    /// grows the sector count, so this iterates to a fixed point.
    fn ensure_fat_capacity(&mut self) -> Result<()> {
        let sector_size = self.sector_size();
        let per_sector = sector_size / 4;
        let mut added = Vec::new();
        while self.fat_ids.len() * per_sector < self.sectors.len() {
            let mut sector = Sector::new(sector_size, SectorType::Fat);
            sector.payload_mut().fill(0xFF);
            let (id, _) = self.sectors.push(sector);
            self.fat_ids.push(id);
            added.push(id);
        }
        if !added.is_empty() {
            tracing::info!(count = added.len(), "extended the FAT");
        }
        for id in added {
            self.write_fat_raw(id, FATSECT)?;
        }
        Ok(())
    }

    /// Follow a FAT chain from `start`, validating as we go.
    fn chain(&mut self, start: u32) -> Result<Vec<u32>> {
        let mut out = Vec::new();
        if start == ENDOFCHAIN {
            return Ok(out);
        }
        let total = self.sectors.len();
        let mut cursor = start;
        while cursor != ENDOFCHAIN {
            if cursor as usize >= total {
                return Err(CfbError::Corrupted(format!(
                    "chain sector {} out of range",
                    cursor
                )));
            }
            let next = self.read_fat(cursor)?;
            if next == cursor {
                return Err(CfbError::Corrupted(format!(
                    "FAT chain cycle at sector {}",
                    cursor
                )));
            }
            out.push(cursor);
            if out.len() > total {
                return Err(CfbError::Corrupted(
                    "FAT chain longer than the sector count".into(),
                ));
            }
            cursor = next;
        }
        Ok(out)
    }

    /// Write chain-forward pointers for a freshly laid-out chain.
    fn link_chain(&mut self, chain: &[u32]) -> Result<()> {
        self.ensure_fat_capacity()?;
        for pair in chain.windows(2) {
            self.write_fat_raw(pair[0], pair[1])?;
        }
        if let Some(&last) = chain.last() {
            self.write_fat_raw(last, ENDOFCHAIN)?;
        }
        Ok(())
    }

    /// Free `chain[keep..]`, optionally zeroing bodies, and terminate the
    /// kept prefix.
    fn free_chain_tail(&mut self, chain: &[u32], keep: usize) -> Result<()> {
        let erase = self.config.contains(Config::ERASE_FREE_SECTORS);
        for &id in &chain[keep..] {
            if erase {
                if self.sectors.get(id).is_none() {
                    let sector_size = self.sector_size();
                    self.sectors
                        .set(id, Sector::with_id(id, sector_size, SectorType::Normal));
                }
                self.sectors.get_mut(id).expect("slot exists").fill_zero();
            }
            self.write_fat(id, FREESECT)?;
            self.free_queue.push_back(id);
        }
        if keep > 0 {
            self.write_fat(chain[keep - 1], ENDOFCHAIN)?;
        }
        Ok(())
    }

    /// Populate the reusable-sector queue from the FAT when recycling is
    /// enabled and the queue has run dry.
    fn harvest_free_sectors(&mut self) -> Result<()> {
        if !self.config.contains(Config::SECTOR_RECYCLE) || !self.free_queue.is_empty() {
            return Ok(());
        }
        for id in 0..self.sectors.len() as u32 {
            if Some(id) == self.lock_sector {
                continue;
            }
            if self.read_fat(id)? == FREESECT {
                self.free_queue.push_back(id);
            }
        }
        Ok(())
    }

    /// Reserve the range-lock sector the first time the collection crosses
    /// the v3 size boundary. The FAT mark happens at commit time.
    fn note_range_lock(&mut self) {
        if self.sectors.take_range_lock_signal() {
            let sector_size = self.sector_size();
            let (id, _) = self.sectors.push(Sector::new(sector_size, SectorType::RangeLock));
            self.lock_sector = Some(id);
            self.lock_allocated = false;
            tracing::info!(sector = id, "reserved the range-lock sector");
        }
    }

    // ---- mini FAT ------------------------------------------------------

    fn read_minifat(&mut self, mini_id: u32) -> Result<u32> {
        let sector_size = self.sector_size();
        let len = (self.minifat_ids.len() * sector_size) as u64;
        if u64::from(mini_id) * 4 + 4 > len {
            return Ok(FREESECT);
        }
        let mut view = StreamView::new(
            &mut self.minifat_ids,
            &mut self.sectors,
            self.source.as_mut(),
            self.source_len,
            sector_size,
            SectorType::Normal,
            len,
            None,
        );
        Ok(view.read_u32_at(u64::from(mini_id) * 4)?)
    }

    fn write_minifat(&mut self, mini_id: u32, value: u32) -> Result<()> {
        self.ensure_minifat_capacity(mini_id as usize + 1)?;
        let sector_size = self.sector_size();
        let len = (self.minifat_ids.len() * sector_size) as u64;
        let mut view = StreamView::new(
            &mut self.minifat_ids,
            &mut self.sectors,
            self.source.as_mut(),
            self.source_len,
            sector_size,
            SectorType::Normal,
            len,
            None,
        );
        view.write_u32_at(u64::from(mini_id) * 4, value)?;
        Ok(())
    }

    /// Grow the mini-FAT chain so it can hold `entries` entries.
    fn ensure_minifat_capacity(&mut self, entries: usize) -> Result<()> {
        let sector_size = self.sector_size();
        let per_sector = sector_size / 4;
        let needed = entries.div_ceil(per_sector);
        if self.minifat_ids.len() >= needed {
            return Ok(());
        }
        while self.minifat_ids.len() < needed {
            let mut sector = Sector::new(sector_size, SectorType::Normal);
            sector.payload_mut().fill(0xFF);
            let (id, _) = self.sectors.push(sector);
            self.minifat_ids.push(id);
        }
        let chain = self.minifat_ids.clone();
        self.link_chain(&chain)?;
        self.header.first_mini_fat_sector = chain[0];
        self.header.mini_fat_sectors_count = chain.len() as u32;
        Ok(())
    }

    /// Follow a mini-FAT chain from `start`.
    fn mini_chain(&mut self, start: u32) -> Result<Vec<u32>> {
        let mut out = Vec::new();
        if start == ENDOFCHAIN {
            return Ok(out);
        }
        let total = self.mini_sectors.len();
        let mut cursor = start;
        while cursor != ENDOFCHAIN {
            if cursor as usize >= total {
                return Err(CfbError::Corrupted(format!(
                    "mini chain sector {} out of range",
                    cursor
                )));
            }
            let next = self.read_minifat(cursor)?;
            if next == cursor {
                return Err(CfbError::Corrupted(format!(
                    "mini-FAT chain cycle at sector {}",
                    cursor
                )));
            }
            out.push(cursor);
            if out.len() > total {
                return Err(CfbError::Corrupted(
                    "mini-FAT chain longer than the mini sector count".into(),
                ));
            }
            cursor = next;
        }
        Ok(out)
    }

    fn link_mini_chain(&mut self, chain: &[u32]) -> Result<()> {
        self.ensure_minifat_capacity(self.mini_sectors.len())?;
        for pair in chain.windows(2) {
            self.write_minifat(pair[0], pair[1])?;
        }
        if let Some(&last) = chain.last() {
            self.write_minifat(last, ENDOFCHAIN)?;
        }
        Ok(())
    }

    fn free_mini_chain_tail(&mut self, chain: &[u32], keep: usize) -> Result<()> {
        let erase = self.config.contains(Config::ERASE_FREE_SECTORS);
        for &id in &chain[keep..] {
            if erase {
                if self.mini_sectors.get(id).is_none() {
                    self.mini_sectors
                        .set(id, Sector::with_id(id, MINI_SECTOR_SIZE, SectorType::Mini));
                }
                self.mini_sectors.get_mut(id).expect("slot exists").fill_zero();
            }
            self.write_minifat(id, FREESECT)?;
            self.mini_free_queue.push_back(id);
        }
        if keep > 0 {
            self.write_minifat(chain[keep - 1], ENDOFCHAIN)?;
        }
        Ok(())
    }

    fn harvest_free_mini_sectors(&mut self) -> Result<()> {
        if !self.config.contains(Config::SECTOR_RECYCLE) || !self.mini_free_queue.is_empty() {
            return Ok(());
        }
        for id in 0..self.mini_sectors.len() as u32 {
            if self.read_minifat(id)? == FREESECT {
                self.mini_free_queue.push_back(id);
            }
        }
        Ok(())
    }

    /// Fault mini sector payloads in from the root entry's regular chain.
    fn load_mini_sectors(&mut self, chain: &[u32]) -> Result<()> {
        let missing: Vec<u32> = chain
            .iter()
            .copied()
            .filter(|&id| self.mini_sectors.get(id).map_or(true, |s| !s.is_loaded()))
            .collect();
        if missing.is_empty() {
            return Ok(());
        }

        let root_start = self.directory[0].start_sector;
        let root_len = self.directory[0].size;
        let mut root_chain = self.chain(root_start)?;
        let sector_size = self.sector_size();

        let mut fetched = Vec::with_capacity(missing.len());
        {
            let mut view = StreamView::new(
                &mut root_chain,
                &mut self.sectors,
                self.source.as_mut(),
                self.source_len,
                sector_size,
                SectorType::Normal,
                root_len,
                None,
            );
            for &id in &missing {
                let mut buf = vec![0u8; MINI_SECTOR_SIZE];
                view.seek(SeekFrom::Start(u64::from(id) * MINI_SECTOR_SIZE as u64))?;
                let mut filled = 0usize;
                while filled < MINI_SECTOR_SIZE {
                    let n = view.read(&mut buf[filled..])?;
                    if n == 0 {
                        break;
                    }
                    filled += n;
                }
                fetched.push((id, buf));
            }
        }

        let highest = missing.iter().copied().max().unwrap_or(0) as usize;
        if self.mini_sectors.len() <= highest {
            self.mini_sectors.set_len(highest + 1);
        }
        for (id, buf) in fetched {
            let mut sector = Sector::with_id(id, MINI_SECTOR_SIZE, SectorType::Mini);
            sector.set_loaded(buf);
            self.mini_sectors.set(id, sector);
        }
        Ok(())
    }

    /// Copy every dirty mini sector back into the root entry's regular
    /// chain at `id * 64` and refresh the mini-stream bookkeeping.
    fn persist_mini_stream(&mut self) -> Result<()> {
        let mini_count = self.mini_sectors.len();
        let stream_len = (mini_count * MINI_SECTOR_SIZE) as u64;

        let mut dirty = Vec::new();
        for id in 0..mini_count as u32 {
            if let Some(sector) = self.mini_sectors.get(id) {
                if sector.is_dirty() {
                    if let Some(data) = sector.data() {
                        dirty.push((id, data.to_vec()));
                    }
                }
            }
        }

        let root_start = self.directory[0].start_sector;
        let mut root_chain = self.chain(root_start)?;
        let sector_size = self.sector_size();
        let root_len = self.directory[0].size;
        self.harvest_free_sectors()?;
        {
            let mut view = StreamView::new(
                &mut root_chain,
                &mut self.sectors,
                self.source.as_mut(),
                self.source_len,
                sector_size,
                SectorType::Normal,
                root_len,
                Some(&mut self.free_queue),
            );
            view.extend_to(stream_len);
            for (id, data) in &dirty {
                view.seek(SeekFrom::Start(u64::from(*id) * MINI_SECTOR_SIZE as u64))?;
                view.write_all(data)?;
            }
        }
        self.link_chain(&root_chain)?;

        let root = &mut self.directory[0];
        root.start_sector = root_chain.first().copied().unwrap_or(ENDOFCHAIN);
        root.size = stream_len;

        for id in 0..mini_count as u32 {
            if let Some(sector) = self.mini_sectors.get_mut(id) {
                sector.clear_dirty();
            }
        }

        self.ensure_minifat_capacity(mini_count)?;
        self.header.first_mini_fat_sector =
            self.minifat_ids.first().copied().unwrap_or(ENDOFCHAIN);
        self.header.mini_fat_sectors_count = self.minifat_ids.len() as u32;
        self.note_range_lock();
        Ok(())
    }

    // ---- stream data ---------------------------------------------------

    fn entry(&self, sid: u32) -> Result<&DirectoryEntry> {
        self.directory
            .get(sid as usize)
            .ok_or_else(|| CfbError::Corrupted(format!("SID {} out of range", sid)))
    }

    fn entry_mut(&mut self, sid: u32) -> Result<&mut DirectoryEntry> {
        self.directory
            .get_mut(sid as usize)
            .ok_or_else(|| CfbError::Corrupted(format!("SID {} out of range", sid)))
    }

    fn entry_is_mini(&self, sid: u32) -> Result<bool> {
        let entry = self.entry(sid)?;
        Ok(entry.stg_type != StgType::Root && entry.size < self.mini_cutoff())
    }

    pub(crate) fn stream_len(&self, sid: u32) -> Result<u64> {
        Ok(self.entry(sid)?.size)
    }

    /// Read stream bytes at an arbitrary offset. Returns the number of
    /// bytes actually read (clamped at the stream length).
    pub(crate) fn read_stream_at(&mut self, sid: u32, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.ensure_open()?;
        let result = self.read_stream_at_inner(sid, offset, buf);
        self.seal(result)
    }

    fn read_stream_at_inner(&mut self, sid: u32, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let size = self.entry(sid)?.size;
        if offset >= size || buf.is_empty() {
            return Ok(0);
        }
        let want = buf.len().min((size - offset) as usize);
        let start = self.entry(sid)?.start_sector;

        let read = if self.entry_is_mini(sid)? {
            let mut chain = self.mini_chain(start)?;
            self.load_mini_sectors(&chain)?;
            let mut view: StreamView<'_, F> = StreamView::new(
                &mut chain,
                &mut self.mini_sectors,
                None,
                0,
                MINI_SECTOR_SIZE,
                SectorType::Mini,
                size,
                None,
            );
            view.seek(SeekFrom::Start(offset))?;
            view.read(&mut buf[..want])?
        } else {
            let sector_size = self.sector_size();
            let mut chain = self.chain(start)?;
            let mut view = StreamView::new(
                &mut chain,
                &mut self.sectors,
                self.source.as_mut(),
                self.source_len,
                sector_size,
                SectorType::Normal,
                size,
                None,
            );
            view.seek(SeekFrom::Start(offset))?;
            view.read(&mut buf[..want])?
        };
        Ok(read)
    }

    /// Write stream bytes at an arbitrary offset, growing (and possibly
    /// transitioning) the stream as needed.
    pub(crate) fn write_stream_at(&mut self, sid: u32, offset: u64, data: &[u8]) -> Result<()> {
        self.ensure_open()?;
        let result = self.write_stream_at_inner(sid, offset, data);
        self.seal(result)
    }

    fn write_stream_at_inner(&mut self, sid: u32, offset: u64, data: &[u8]) -> Result<()> {
        let end = offset + data.len() as u64;
        if end > self.entry(sid)?.size {
            self.set_stream_len_inner(sid, end)?;
        }
        if data.is_empty() {
            return Ok(());
        }

        let size = self.entry(sid)?.size;
        let start = self.entry(sid)?.start_sector;

        if self.entry_is_mini(sid)? {
            let mut chain = self.mini_chain(start)?;
            self.load_mini_sectors(&chain)?;
            {
                let mut view: StreamView<'_, F> = StreamView::new(
                    &mut chain,
                    &mut self.mini_sectors,
                    None,
                    0,
                    MINI_SECTOR_SIZE,
                    SectorType::Mini,
                    size,
                    None,
                );
                view.seek(SeekFrom::Start(offset))?;
                view.write_all(data)?;
            }
            self.persist_mini_stream()?;
        } else {
            let sector_size = self.sector_size();
            let mut chain = self.chain(start)?;
            {
                let mut view = StreamView::new(
                    &mut chain,
                    &mut self.sectors,
                    self.source.as_mut(),
                    self.source_len,
                    sector_size,
                    SectorType::Normal,
                    size,
                    None,
                );
                view.seek(SeekFrom::Start(offset))?;
                view.write_all(data)?;
            }
            self.note_range_lock();
        }
        Ok(())
    }

    pub(crate) fn set_stream_len(&mut self, sid: u32, new_len: u64) -> Result<()> {
        self.ensure_open()?;
        let result = self.set_stream_len_inner(sid, new_len);
        self.seal(result)
    }

    /// Resize a stream's chain, performing a mini/normal transition copy
    /// when the new length crosses the cutoff.
    fn set_stream_len_inner(&mut self, sid: u32, new_len: u64) -> Result<()> {
        let old_len = self.entry(sid)?.size;
        if old_len == new_len {
            return Ok(());
        }
        let is_root = self.entry(sid)?.stg_type == StgType::Root;
        let cutoff = self.mini_cutoff();
        let old_mini = !is_root && old_len < cutoff;
        let new_mini = !is_root && new_len < cutoff;
        let start = self.entry(sid)?.start_sector;

        if old_mini == new_mini {
            if old_mini {
                self.resize_mini_chain(sid, start, new_len)?;
            } else {
                self.resize_normal_chain(sid, start, new_len)?;
            }
        } else {
            self.transition_chain(sid, start, old_len, new_len, old_mini)?;
        }
        self.entry_mut(sid)?.size = new_len;
        Ok(())
    }

    fn resize_normal_chain(&mut self, sid: u32, start: u32, new_len: u64) -> Result<()> {
        let sector_size = self.sector_size();
        let mut chain = self.chain(start)?;
        let needed = (new_len as usize).div_ceil(sector_size);

        if needed > chain.len() {
            self.harvest_free_sectors()?;
            let current_len = (chain.len() * sector_size) as u64;
            let mut view = StreamView::new(
                &mut chain,
                &mut self.sectors,
                self.source.as_mut(),
                self.source_len,
                sector_size,
                SectorType::Normal,
                current_len,
                Some(&mut self.free_queue),
            );
            view.extend_to(new_len);
            drop(view);
            self.link_chain(&chain)?;
            self.note_range_lock();
        } else if needed < chain.len() {
            self.free_chain_tail(&chain, needed)?;
            chain.truncate(needed);
        }

        self.entry_mut(sid)?.start_sector = chain.first().copied().unwrap_or(ENDOFCHAIN);
        Ok(())
    }

    fn resize_mini_chain(&mut self, sid: u32, start: u32, new_len: u64) -> Result<()> {
        let mut chain = self.mini_chain(start)?;
        let needed = (new_len as usize).div_ceil(MINI_SECTOR_SIZE);

        if needed > chain.len() {
            self.load_mini_sectors(&chain)?;
            self.harvest_free_mini_sectors()?;
            let current_len = (chain.len() * MINI_SECTOR_SIZE) as u64;
            let mut view: StreamView<'_, F> = StreamView::new(
                &mut chain,
                &mut self.mini_sectors,
                None,
                0,
                MINI_SECTOR_SIZE,
                SectorType::Mini,
                current_len,
                Some(&mut self.mini_free_queue),
            );
            view.extend_to(new_len);
            drop(view);
            self.link_mini_chain(&chain)?;
        } else if needed < chain.len() {
            self.free_mini_chain_tail(&chain, needed)?;
            chain.truncate(needed);
        }

        self.entry_mut(sid)?.start_sector = chain.first().copied().unwrap_or(ENDOFCHAIN);
        self.persist_mini_stream()?;
        Ok(())
    }

    /// Move a stream between the mini and normal sector spaces, copying
    /// the surviving prefix through a bounded staging buffer.
    fn transition_chain(
        &mut self,
        sid: u32,
        start: u32,
        old_len: u64,
        new_len: u64,
        old_mini: bool,
    ) -> Result<()> {
        let copy_len = old_len.min(new_len);
        let sector_size = self.sector_size();

        let old_chain = if old_mini {
            let chain = self.mini_chain(start)?;
            self.load_mini_sectors(&chain)?;
            chain
        } else {
            self.chain(start)?
        };

        let mut new_chain: Vec<u32> = Vec::new();
        let mut staging = vec![0u8; TRANSITION_BUF];
        let mut copied = 0u64;

        if old_mini {
            // mini -> normal
            self.harvest_free_sectors()?;
            let mut old_view_chain = old_chain.clone();
            let mut old_view: StreamView<'_, F> = StreamView::new(
                &mut old_view_chain,
                &mut self.mini_sectors,
                None,
                0,
                MINI_SECTOR_SIZE,
                SectorType::Mini,
                old_len,
                None,
            );
            let mut new_view: StreamView<'_, F> = StreamView::new(
                &mut new_chain,
                &mut self.sectors,
                None,
                0,
                sector_size,
                SectorType::Normal,
                0,
                Some(&mut self.free_queue),
            );
            while copied < copy_len {
                let take = staging.len().min((copy_len - copied) as usize);
                old_view.read_exact(&mut staging[..take])?;
                new_view.write_all(&staging[..take])?;
                copied += take as u64;
            }
            new_view.extend_to(new_len);
            drop(new_view);
            drop(old_view);

            self.link_chain(&new_chain)?;
            self.free_mini_chain_tail(&old_chain, 0)?;
            self.entry_mut(sid)?.start_sector = new_chain.first().copied().unwrap_or(ENDOFCHAIN);
            self.persist_mini_stream()?;
            self.note_range_lock();
        } else {
            // normal -> mini
            self.harvest_free_mini_sectors()?;
            let mut old_view_chain = old_chain.clone();
            let mut old_view = StreamView::new(
                &mut old_view_chain,
                &mut self.sectors,
                self.source.as_mut(),
                self.source_len,
                sector_size,
                SectorType::Normal,
                old_len,
                None,
            );
            let mut new_view: StreamView<'_, F> = StreamView::new(
                &mut new_chain,
                &mut self.mini_sectors,
                None,
                0,
                MINI_SECTOR_SIZE,
                SectorType::Mini,
                0,
                Some(&mut self.mini_free_queue),
            );
            while copied < copy_len {
                let take = staging.len().min((copy_len - copied) as usize);
                old_view.read_exact(&mut staging[..take])?;
                new_view.write_all(&staging[..take])?;
                copied += take as u64;
            }
            new_view.extend_to(new_len);
            drop(new_view);
            drop(old_view);

            self.link_mini_chain(&new_chain)?;
            self.free_chain_tail(&old_chain, 0)?;
            self.entry_mut(sid)?.start_sector = new_chain.first().copied().unwrap_or(ENDOFCHAIN);
            self.persist_mini_stream()?;
        }
        Ok(())
    }

    /// Free a stream's whole data chain (used by deletion).
    fn free_stream_chain(&mut self, start: u32, size: u64) -> Result<()> {
        if start == ENDOFCHAIN {
            return Ok(());
        }
        if size < self.mini_cutoff() {
            let chain = self.mini_chain(start)?;
            if self.config.contains(Config::ERASE_FREE_SECTORS) {
                self.load_mini_sectors(&chain)?;
            }
            self.free_mini_chain_tail(&chain, 0)?;
            self.persist_mini_stream()?;
        } else {
            let chain = self.chain(start)?;
            self.free_chain_tail(&chain, 0)?;
        }
        Ok(())
    }

    // ---- directory management -----------------------------------------

    pub(crate) fn find_child(&self, parent_sid: u32, name: &str) -> Result<Option<u32>> {
        self.ensure_open()?;
        let key: Vec<u16> = name.encode_utf16().collect();
        let root = self.entry(parent_sid)?.child;
        rbtree::find(&self.directory, root, &key)
    }

    /// Children of a storage in tree order, honouring the validation
    /// policy for damaged sibling links.
    pub(crate) fn children_of(&self, parent_sid: u32) -> Result<Vec<EntryInfo>> {
        self.ensure_open()?;
        let strict = !self.config.contains(Config::NO_VALIDATION_EXCEPTION);
        let root = self.entry(parent_sid)?.child;
        let sids = rbtree::in_order(&self.directory, root, strict)?;
        Ok(sids
            .iter()
            .map(|&sid| EntryInfo::of(&self.directory[sid as usize]))
            .collect())
    }

    /// Add a storage or stream under `parent_sid`. Reuses the lowest
    /// Invalid directory slot before appending a new record.
    pub(crate) fn add_entry(&mut self, parent_sid: u32, name: &str, stg_type: StgType) -> Result<u32> {
        self.ensure_open()?;

        // validate the name before touching any slot
        let mut probe = DirectoryEntry::new(0, stg_type);
        probe.set_name(name)?;

        let reused = self
            .directory
            .iter()
            .position(|e| e.is_invalid())
            .map(|idx| idx as u32);
        let sid = match reused {
            Some(sid) => sid,
            None => {
                self.directory
                    .push(DirectoryEntry::new(self.directory.len() as u32, stg_type));
                self.directory.len() as u32 - 1
            }
        };
        let mut entry = DirectoryEntry::new(sid, stg_type);
        entry
            .set_name(name)
            .expect("name validated against the probe");
        self.directory[sid as usize] = entry;

        let root = self.entry(parent_sid)?.child;
        let insert = {
            let mut tree = SiblingTree::attach(&mut self.directory, root)?;
            tree.insert(sid).map(|_| tree.root())
        };
        match insert {
            Ok(new_root) => {
                self.entry_mut(parent_sid)?.child = new_root;
                Ok(sid)
            }
            Err(err) => {
                // roll the slot back before surfacing
                if reused.is_some() {
                    self.directory[sid as usize].tombstone();
                } else {
                    self.directory.pop();
                }
                Err(err)
            }
        }
    }

    /// Delete a named child of `parent_sid`. Storages are emptied
    /// recursively first; stream chains are freed; the structurally
    /// removed slot is tombstoned for reuse.
    pub(crate) fn delete_entry(&mut self, parent_sid: u32, name: &str) -> Result<()> {
        self.ensure_open()?;
        let result = self.delete_entry_inner(parent_sid, name);
        self.seal(result)
    }

    fn delete_entry_inner(&mut self, parent_sid: u32, name: &str) -> Result<()> {
        let key: Vec<u16> = name.encode_utf16().collect();
        let root = self.entry(parent_sid)?.child;
        let target = rbtree::find(&self.directory, root, &key)?
            .ok_or_else(|| CfbError::ItemNotFound(name.to_string()))?;

        if self.directory[target as usize].stg_type == StgType::Root {
            return Err(CfbError::InvalidOperation(
                "the root storage cannot be deleted".into(),
            ));
        }

        // empty a storage before touching its record
        while self.directory[target as usize].child != NOSTREAM {
            let child = self.directory[target as usize].child;
            let child_name = self.entry(child)?.name();
            self.delete_entry_inner(target, &child_name)?;
        }

        // capture chain facts before the tree relocates payloads
        let (start, size, is_stream) = {
            let entry = &self.directory[target as usize];
            (entry.start_sector, entry.size, entry.is_stream())
        };

        let root = self.entry(parent_sid)?.child;
        let (new_root, freed_sid) = {
            let mut tree = SiblingTree::attach(&mut self.directory, root)?;
            let removed = tree.remove(&key)?;
            (tree.root(), removed.freed_sid)
        };
        self.entry_mut(parent_sid)?.child = new_root;
        self.directory[freed_sid as usize].tombstone();

        if is_stream {
            self.free_stream_chain(start, size)?;
        }
        Ok(())
    }

    pub(crate) fn set_clsid(&mut self, sid: u32, clsid: [u8; 16]) -> Result<()> {
        self.ensure_open()?;
        let entry = self.entry_mut(sid)?;
        if !entry.is_storage() {
            return Err(CfbError::InvalidOperation(
                "CLSIDs can only be set on storages".into(),
            ));
        }
        entry.clsid = clsid;
        Ok(())
    }

    // ---- queries -------------------------------------------------------

    /// Every live entry with the given name, across the whole flat
    /// directory list (not just one storage).
    pub fn find_entries_named(&self, name: &str) -> Result<Vec<EntryInfo>> {
        self.ensure_open()?;
        Ok(self
            .directory
            .iter()
            .filter(|e| !e.is_invalid() && e.name() == name)
            .map(EntryInfo::of)
            .collect())
    }

    /// Number of directory records, tombstones included.
    pub fn directory_len(&self) -> Result<usize> {
        self.ensure_open()?;
        Ok(self.directory.len())
    }

    pub fn clsid_of_sid(&self, sid: u32) -> Result<[u8; 16]> {
        self.ensure_open()?;
        Ok(self.entry(sid)?.clsid)
    }

    /// Best-effort raw stream bytes by SID, without walking the tree.
    pub fn raw_data_of_sid(&mut self, sid: u32) -> Result<Vec<u8>> {
        self.ensure_open()?;
        let size = self.entry(sid)?.size;
        let mut buf = vec![0u8; size as usize];
        let read = self.read_stream_at(sid, 0, &mut buf)?;
        buf.truncate(read);
        Ok(buf)
    }

    pub(crate) fn entry_info(&self, sid: u32) -> Result<EntryInfo> {
        self.ensure_open()?;
        Ok(EntryInfo::of(self.entry(sid)?))
    }

    pub fn root_storage(&mut self) -> Result<Storage<'_, F>> {
        self.ensure_open()?;
        Ok(Storage::new(self, 0))
    }

    // ---- persistence ---------------------------------------------------

    /// Serialize the directory into its sector chain, padding the last
    /// sector with Invalid records.
    fn commit_directory(&mut self) -> Result<()> {
        let sector_size = self.sector_size();
        let bytes_needed = self.directory.len() * DIRECTORY_ENTRY_SIZE;

        let mut records = vec![0u8; bytes_needed];
        for (idx, entry) in self.directory.iter().enumerate() {
            entry.write_to(&mut records[idx * DIRECTORY_ENTRY_SIZE..]);
        }

        let mut chain = std::mem::take(&mut self.dir_ids);
        self.harvest_free_sectors()?;
        {
            let current = (chain.len() * sector_size) as u64;
            let mut view = StreamView::new(
                &mut chain,
                &mut self.sectors,
                self.source.as_mut(),
                self.source_len,
                sector_size,
                SectorType::Directory,
                current,
                Some(&mut self.free_queue),
            );
            view.seek(SeekFrom::Start(0))?;
            view.write_all(&records)?;

            // pad the tail of the last sector with Invalid records
            let capacity = (view.len() as usize).div_ceil(sector_size) * sector_size;
            let blank = DirectoryEntry::new(0, StgType::Invalid);
            let mut slot = [0u8; DIRECTORY_ENTRY_SIZE];
            blank.write_to(&mut slot);
            let mut off = bytes_needed;
            while off < capacity {
                view.write_all(&slot)?;
                off += DIRECTORY_ENTRY_SIZE;
            }
        }
        self.dir_ids = chain;

        let chain = self.dir_ids.clone();
        self.link_chain(&chain)?;
        self.header.first_directory_sector = chain.first().copied().unwrap_or(ENDOFCHAIN);
        // format rule: v3 files always declare zero directory sectors
        self.header.directory_sectors_count = match self.version {
            Version::V3 => 0,
            Version::V4 => chain.len() as u32,
        };
        self.note_range_lock();
        Ok(())
    }

    /// Lay the DIFAT out: 109 header slots, then chained DIFAT sectors.
    /// Adding a DIFAT sector can demand another FAT sector and vice versa,
    /// so capacity iterates to a fixed point before the layout is written.
    fn rebuild_difat(&mut self) -> Result<()> {
        let sector_size = self.sector_size();
        let per_difat = sector_size / 4 - 1;

        loop {
            self.ensure_fat_capacity()?;
            let overflow = self.fat_ids.len().saturating_sub(HEADER_DIFAT_ENTRIES);
            let needed = overflow.div_ceil(per_difat);
            if self.difat_ids.len() >= needed {
                break;
            }
            let mut sector = Sector::new(sector_size, SectorType::Difat);
            sector.payload_mut().fill(0xFF);
            let (id, _) = self.sectors.push(sector);
            self.difat_ids.push(id);
            self.ensure_fat_capacity()?;
            self.write_fat_raw(id, DIFSECT)?;
        }

        // idempotently mark the special sectors
        let fat_ids = self.fat_ids.clone();
        for id in &fat_ids {
            self.write_fat_raw(*id, FATSECT)?;
        }
        let difat_ids = self.difat_ids.clone();
        for id in &difat_ids {
            self.write_fat_raw(*id, DIFSECT)?;
        }

        // header DIFAT
        self.header.difat = [FREESECT; HEADER_DIFAT_ENTRIES];
        for (slot, id) in self
            .header
            .difat
            .iter_mut()
            .zip(fat_ids.iter().take(HEADER_DIFAT_ENTRIES))
        {
            *slot = *id;
        }

        // chained DIFAT sectors, a 4-byte next pointer at each tail
        let overflow_ids = &fat_ids[HEADER_DIFAT_ENTRIES.min(fat_ids.len())..];
        for (idx, &difat_id) in difat_ids.iter().enumerate() {
            let begin = idx * per_difat;
            let end = ((idx + 1) * per_difat).min(overflow_ids.len());
            let next = difat_ids.get(idx + 1).copied().unwrap_or(ENDOFCHAIN);

            let sector = self
                .sectors
                .get_mut(difat_id)
                .ok_or_else(|| CfbError::Corrupted("DIFAT sector slot vanished".into()))?;
            let payload = sector.payload_mut();
            payload.fill(0xFF);
            for (slot, &fat_id) in overflow_ids[begin..end].iter().enumerate() {
                let off = slot * 4;
                payload[off..off + 4].copy_from_slice(&fat_id.to_le_bytes());
            }
            let tail = per_difat * 4;
            payload[tail..tail + 4].copy_from_slice(&next.to_le_bytes());
        }

        self.header.first_difat_sector = difat_ids.first().copied().unwrap_or(ENDOFCHAIN);
        self.header.difat_sectors_count = difat_ids.len() as u32;
        self.header.fat_sectors_count = fat_ids.len() as u32;
        Ok(())
    }

    fn header_bytes(&self) -> Vec<u8> {
        let mut bytes = self.header.to_bytes();
        // v4 headers own a full 4096-byte sector
        if self.version == Version::V4 {
            bytes.resize(self.sector_size(), 0);
        }
        bytes
    }

    /// Flush in-place: only valid in Update mode.
    ///
    /// Dirty sectors are written back coalesced into contiguous runs; with
    /// `release_memory` each flushed sector's buffer is dropped after the
    /// write.
    pub fn commit(&mut self, release_memory: bool) -> Result<()> {
        self.ensure_open()?;
        if self.mode != UpdateMode::Update {
            return Err(CfbError::InvalidOperation(
                "commit requires a file opened in Update mode".into(),
            ));
        }
        if self.source.is_none() {
            return Err(CfbError::InvalidOperation(
                "commit requires a backing file".into(),
            ));
        }
        let result = self.commit_inner(release_memory);
        self.seal(result)
    }

    fn commit_inner(&mut self, release_memory: bool) -> Result<()> {
        let sector_size = self.sector_size();

        // the range-lock sector becomes visible in the FAT at commit time
        if self.version == Version::V4 {
            if let Some(lock) = self.lock_sector {
                if !self.lock_allocated {
                    self.write_fat(lock, ENDOFCHAIN)?;
                    self.lock_allocated = true;
                }
            }
        }

        // header placeholder
        {
            let source = self.source.as_mut().expect("checked by commit");
            source.seek(SeekFrom::Start(0))?;
            source.write_all(&vec![0u8; sector_size])?;
        }

        self.commit_directory()?;
        self.rebuild_difat()?;

        // flush dirty sectors, coalescing contiguous runs into one seek
        let mut flushed = 0usize;
        let mut expected_next: Option<u32> = None;
        {
            let total = self.sectors.len() as u32;
            for id in 0..total {
                let Some(sector) = self.sectors.get(id) else {
                    expected_next = None;
                    continue;
                };
                if !sector.is_dirty() || sector.data().is_none() {
                    expected_next = None;
                    continue;
                }
                let offset = sector.file_offset();
                let source = self.source.as_mut().expect("checked by commit");
                if expected_next != Some(id) {
                    source.seek(SeekFrom::Start(offset))?;
                }
                source.write_all(self.sectors.get(id).expect("slot exists").data().expect("dirty data"))?;
                expected_next = Some(id + 1);
                flushed += 1;

                let sector = self.sectors.get_mut(id).expect("slot exists");
                sector.clear_dirty();
                if release_memory {
                    sector.release_data();
                }
            }
        }

        // final header, then size the file to the sector array
        let needed = (self.sectors.len() as u64 + 1) * sector_size as u64;
        {
            let header_bytes = self.header_bytes();
            let source = self.source.as_mut().expect("checked by commit");
            source.seek(SeekFrom::Start(0))?;
            source.write_all(&header_bytes)?;
            if self.source_len < needed {
                source.seek(SeekFrom::Start(needed - 1))?;
                source.write_all(&[0u8])?;
            }
            source.flush()?;
        }
        self.source_len = self.source_len.max(needed);

        tracing::debug!(sectors = flushed, "commit flushed dirty sectors");
        Ok(())
    }

    /// Full copy into a destination writer: header first, then every
    /// sector in id order, faulting untouched slots from the source.
    pub fn save_to_stream<W: Write>(&mut self, dest: &mut W) -> Result<()> {
        self.ensure_open()?;
        let result = self.save_inner(dest);
        self.seal(result)
    }

    /// Full copy to a file path.
    pub fn save<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let mut file = File::create(path)?;
        self.save_to_stream(&mut file)?;
        file.sync_all()?;
        Ok(())
    }

    fn save_inner<W: Write>(&mut self, dest: &mut W) -> Result<()> {
        self.commit_directory()?;
        self.rebuild_difat()?;

        dest.write_all(&self.header_bytes())?;

        let sector_size = self.sector_size();
        let zeros = vec![0u8; sector_size];
        let total = self.sectors.len() as u32;
        for id in 0..total {
            let resident = self
                .sectors
                .get(id)
                .and_then(|s| s.data().map(<[u8]>::to_vec));
            match resident {
                Some(data) => dest.write_all(&data)?,
                None => {
                    // untouched slot: materialise from the source if the
                    // file reaches this far, zeros otherwise
                    let offset = (sector_size as u64) * (u64::from(id) + 1);
                    if offset + sector_size as u64 <= self.source_len {
                        let data = self.sector_bytes(id, SectorType::Normal)?;
                        dest.write_all(&data)?;
                    } else {
                        dest.write_all(&zeros)?;
                    }
                }
            }
        }
        tracing::debug!(sectors = total, "save wrote full sector array");
        Ok(())
    }
}

/// Recursively replicate `src_sid`'s subtree into `dest_sid`, preserving
/// CLSIDs and state bits. Used by shrink.
fn copy_storage_tree<F, G>(
    src: &mut CompoundFile<F>,
    src_sid: u32,
    dest: &mut CompoundFile<G>,
    dest_sid: u32,
) -> Result<()>
where
    F: Read + Write + Seek,
    G: Read + Write + Seek,
{
    let children = src.children_of(src_sid)?;
    for info in children {
        match info.stg_type {
            StgType::Stream => {
                let new_sid = dest.add_entry(dest_sid, &info.name, StgType::Stream)?;
                let data = src.raw_data_of_sid(info.sid)?;
                dest.write_stream_at(new_sid, 0, &data)?;
                dest.directory[new_sid as usize].state_bits =
                    src.directory[info.sid as usize].state_bits;
            }
            StgType::Storage => {
                let new_sid = dest.add_entry(dest_sid, &info.name, StgType::Storage)?;
                dest.set_clsid(new_sid, info.clsid)?;
                dest.directory[new_sid as usize].state_bits =
                    src.directory[info.sid as usize].state_bits;
                copy_storage_tree(src, info.sid, dest, new_sid)?;
            }
            StgType::Root | StgType::Invalid => {}
        }
    }
    Ok(())
}
