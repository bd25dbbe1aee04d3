//! Sector model and the sparse sector collection
//!
//! A compound file is a 512-byte (v3) or 4096-byte (v4) header followed by a
//! flat array of fixed-size sectors. Sector payloads are loaded lazily: a
//! slot can exist with no buffer until something actually reads or writes
//! it. Mini sectors (64 bytes) are not independent file regions; their bytes
//! live inside the root entry's regular chain and are stitched back on
//! persist.

/// Free / unallocated FAT entry.
pub const FREESECT: u32 = 0xFFFF_FFFF;
/// Chain terminator.
pub const ENDOFCHAIN: u32 = 0xFFFF_FFFE;
/// Sector holds FAT data.
pub const FATSECT: u32 = 0xFFFF_FFFD;
/// Sector holds DIFAT data.
pub const DIFSECT: u32 = 0xFFFF_FFFC;

/// Mini sectors are always 64 bytes.
pub const MINI_SECTOR_SIZE: usize = 64;

/// Sector count past which a v4 file reserves the range-lock sector (the
/// sector containing file byte 0x7FFFFF00).
pub const RANGE_LOCK_THRESHOLD: usize = 0x7F_FFFF;

/// Id of a sector that has not been placed in the collection yet.
const UNALLOCATED: u32 = u32::MAX;

/// Role of a sector within the file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectorType {
    /// Stream payload in the regular sector space
    Normal,
    /// 64-byte sub-sector carved out of the root entry's chain
    Mini,
    /// Holds FAT entries
    Fat,
    /// Holds DIFAT entries
    Difat,
    /// Holds packed 128-byte directory records
    Directory,
    /// Reserved lock marker near the 2 GiB boundary (v4 files)
    RangeLock,
}

/// Fixed-size byte block with identity, role and a dirty flag
#[derive(Debug)]
pub struct Sector {
    id: u32,
    size: usize,
    sector_type: SectorType,
    dirty: bool,
    data: Option<Vec<u8>>,
}

impl Sector {
    /// Create a sector that has not been assigned a position yet.
    pub fn new(size: usize, sector_type: SectorType) -> Self {
        Sector {
            id: UNALLOCATED,
            size,
            sector_type,
            dirty: false,
            data: None,
        }
    }

    /// Create a sector at a known position (used when materialising slots
    /// for a loaded file).
    pub fn with_id(id: u32, size: usize, sector_type: SectorType) -> Self {
        Sector {
            id,
            size,
            sector_type,
            dirty: false,
            data: None,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub(crate) fn set_id(&mut self, id: u32) {
        self.id = id;
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn sector_type(&self) -> SectorType {
        self.sector_type
    }

    pub(crate) fn set_sector_type(&mut self, sector_type: SectorType) {
        self.sector_type = sector_type;
    }

    /// Byte offset of this sector within the backing file. The header
    /// occupies one full sector-size worth of leading bytes.
    pub fn file_offset(&self) -> u64 {
        (self.size as u64) * (self.id as u64 + 1)
    }

    /// Whether the payload buffer is resident.
    pub fn is_loaded(&self) -> bool {
        self.data.is_some()
    }

    /// Whether this sector's bytes can be faulted in from a backing file of
    /// `file_len` bytes. Always false for mini sectors, whose bytes live in
    /// the root chain instead.
    pub fn is_streamed(&self, file_len: u64) -> bool {
        self.sector_type != SectorType::Mini
            && self.id != UNALLOCATED
            && self.file_offset() + self.size as u64 <= file_len
    }

    /// Resident payload, if any. Never materialises.
    pub fn data(&self) -> Option<&[u8]> {
        self.data.as_deref()
    }

    /// Payload for reading; materialises a zero buffer if none is resident.
    pub fn payload(&mut self) -> &[u8] {
        self.data.get_or_insert_with(|| vec![0u8; self.size])
    }

    /// Payload for writing; materialises a zero buffer if needed and marks
    /// the sector dirty.
    pub fn payload_mut(&mut self) -> &mut Vec<u8> {
        self.dirty = true;
        self.data.get_or_insert_with(|| vec![0u8; self.size])
    }

    /// Install a buffer read from the backing file. Does not dirty.
    pub fn set_loaded(&mut self, data: Vec<u8>) {
        debug_assert_eq!(data.len(), self.size);
        self.data = Some(data);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    /// Overwrite the payload with zeros and mark dirty.
    pub fn fill_zero(&mut self) {
        let size = self.size;
        let buf = self.payload_mut();
        buf.clear();
        buf.resize(size, 0);
    }

    /// Drop the resident buffer to reclaim memory. The sector keeps its
    /// identity; the next touch re-faults from the file or zeros.
    pub fn release_data(&mut self) {
        self.data = None;
    }
}

impl Default for SectorCollection {
    fn default() -> Self {
        Self::new()
    }
}

const SLAB_SIZE: usize = 4096;

/// Sparse, growable sequence of sectors indexed by id
///
/// Backed by a list of fixed-capacity slabs so a large file never needs one
/// contiguous slot allocation. An empty slab stands for "every slot in this
/// range untouched".
#[derive(Debug)]
pub struct SectorCollection {
    slabs: Vec<Vec<Option<Sector>>>,
    len: usize,
    lock_threshold: usize,
    signalled: bool,
    pending_signal: bool,
}

impl SectorCollection {
    pub fn new() -> Self {
        SectorCollection {
            slabs: Vec::new(),
            len: 0,
            lock_threshold: RANGE_LOCK_THRESHOLD,
            signalled: false,
            pending_signal: false,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_lock_threshold(lock_threshold: usize) -> Self {
        SectorCollection {
            slabs: Vec::new(),
            len: 0,
            lock_threshold,
            signalled: false,
            pending_signal: false,
        }
    }

    /// Number of sector positions, including untouched slots.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Declare `len` sector positions without materialising any of them.
    /// Used right after parsing a header, when the sector count is known
    /// from the file length.
    pub fn set_len(&mut self, len: usize) {
        debug_assert!(len >= self.len);
        self.len = len;
    }

    fn slot(&self, id: u32) -> Option<&Option<Sector>> {
        let idx = id as usize;
        if idx >= self.len {
            return None;
        }
        let slab = self.slabs.get(idx / SLAB_SIZE)?;
        if slab.is_empty() {
            None
        } else {
            slab.get(idx % SLAB_SIZE)
        }
    }

    pub fn get(&self, id: u32) -> Option<&Sector> {
        self.slot(id).and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut Sector> {
        let idx = id as usize;
        if idx >= self.len {
            return None;
        }
        let slab = self.slabs.get_mut(idx / SLAB_SIZE)?;
        if slab.is_empty() {
            None
        } else {
            slab.get_mut(idx % SLAB_SIZE).and_then(|s| s.as_mut())
        }
    }

    /// Place a sector at an existing position (materialising a lazy slot).
    pub fn set(&mut self, id: u32, mut sector: Sector) {
        let idx = id as usize;
        debug_assert!(idx < self.len);
        sector.set_id(id);

        let slab_idx = idx / SLAB_SIZE;
        if self.slabs.len() <= slab_idx {
            self.slabs.resize_with(slab_idx + 1, Vec::new);
        }
        let slab = &mut self.slabs[slab_idx];
        if slab.is_empty() {
            slab.resize_with(SLAB_SIZE, || None);
        }
        slab[idx % SLAB_SIZE] = Some(sector);
    }

    /// Append a sector, assigning its id. Returns the id and whether this
    /// push was the first to carry the collection past the range-lock
    /// threshold (signalled exactly once; the engine reacts by appending
    /// the lock sector and marking it in the FAT at commit time).
    pub fn push(&mut self, sector: Sector) -> (u32, bool) {
        let id = self.len as u32;
        self.len += 1;
        self.set(id, sector);

        let crossed = !self.signalled && self.len > self.lock_threshold;
        if crossed {
            self.signalled = true;
            self.pending_signal = true;
        }
        (id, crossed)
    }

    /// One-shot poll for a threshold crossing that happened since the last
    /// call. Lets the engine notice crossings that occur inside a stream
    /// view rather than through a direct `push`.
    pub fn take_range_lock_signal(&mut self) -> bool {
        let pending = self.pending_signal;
        self.pending_signal = false;
        pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_assigns_sequential_ids() {
        let mut sectors = SectorCollection::new();
        let (a, _) = sectors.push(Sector::new(512, SectorType::Normal));
        let (b, _) = sectors.push(Sector::new(512, SectorType::Fat));
        assert_eq!(a, 0);
        assert_eq!(b, 1);
        assert_eq!(sectors.len(), 2);
        assert_eq!(sectors.get(1).unwrap().sector_type(), SectorType::Fat);
    }

    #[test]
    fn test_lazy_slots() {
        let mut sectors = SectorCollection::new();
        sectors.set_len(10_000);
        assert_eq!(sectors.len(), 10_000);
        assert!(sectors.get(9_999).is_none());

        sectors.set(9_999, Sector::with_id(0, 512, SectorType::Normal));
        let sector = sectors.get(9_999).unwrap();
        // set() rewrites the id to match the slot
        assert_eq!(sector.id(), 9_999);
        // other slots in the same slab stay empty
        assert!(sectors.get(9_998).is_none());
        // untouched slab
        assert!(sectors.get(100).is_none());
    }

    #[test]
    fn test_range_lock_signal_fires_once() {
        let mut sectors = SectorCollection::with_lock_threshold(3);
        assert!(!sectors.push(Sector::new(512, SectorType::Normal)).1);
        assert!(!sectors.push(Sector::new(512, SectorType::Normal)).1);
        assert!(!sectors.push(Sector::new(512, SectorType::Normal)).1);
        // fourth push crosses len > 3
        assert!(sectors.push(Sector::new(512, SectorType::Normal)).1);
        // never again
        assert!(!sectors.push(Sector::new(512, SectorType::Normal)).1);
    }

    #[test]
    fn test_payload_dirty_tracking() {
        let mut sector = Sector::new(512, SectorType::Normal);
        assert!(!sector.is_loaded());

        // read path materialises zeros without dirtying
        assert_eq!(sector.payload()[0], 0);
        assert!(!sector.is_dirty());

        sector.payload_mut()[0] = 0xAB;
        assert!(sector.is_dirty());

        sector.clear_dirty();
        sector.release_data();
        assert!(!sector.is_loaded());
        // zero again after release
        assert_eq!(sector.payload()[0], 0);
    }

    #[test]
    fn test_fill_zero() {
        let mut sector = Sector::new(64, SectorType::Mini);
        sector.payload_mut().copy_from_slice(&[0xFF; 64]);
        sector.clear_dirty();

        sector.fill_zero();
        assert!(sector.is_dirty());
        assert!(sector.payload().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_file_offset() {
        let sector = Sector::with_id(3, 512, SectorType::Normal);
        assert_eq!(sector.file_offset(), 2048);

        let sector = Sector::with_id(0, 4096, SectorType::Normal);
        assert_eq!(sector.file_offset(), 4096);
    }

    #[test]
    fn test_mini_never_streamed() {
        let sector = Sector::with_id(0, 64, SectorType::Mini);
        assert!(!sector.is_streamed(u64::MAX));

        let sector = Sector::with_id(0, 512, SectorType::Normal);
        assert!(sector.is_streamed(1024));
        assert!(!sector.is_streamed(1023));
    }
}
