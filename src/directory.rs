//! Directory entries
//!
//! Storages and streams are described by fixed 128-byte records packed into
//! the directory sector chain. Records double as red-black tree nodes: the
//! sibling links and the node colour are stored inside the record itself,
//! addressed by SID (the record's index in the directory).

use crate::error::{CfbError, Result};
use crate::sector::ENDOFCHAIN;
use std::cmp::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};

/// Size of one directory record on disk.
pub const DIRECTORY_ENTRY_SIZE: usize = 128;

/// "No sibling / no child" SID sentinel.
pub const NOSTREAM: u32 = 0xFFFF_FFFF;

/// Maximum name length in UTF-16 code units, including the NUL terminator.
pub const MAX_NAME_UNITS: usize = 32;

/// Characters the format forbids in entry names.
const ILLEGAL_NAME_CHARS: [char; 4] = ['\\', '/', ':', '!'];

/// Seconds between 1601-01-01 (FILETIME epoch) and 1970-01-01.
const FILETIME_UNIX_DELTA: u64 = 11_644_473_600;

/// Kind of directory entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StgType {
    Invalid = 0,
    Storage = 1,
    Stream = 2,
    Root = 5,
}

impl StgType {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(StgType::Invalid),
            1 => Ok(StgType::Storage),
            2 => Ok(StgType::Stream),
            5 => Ok(StgType::Root),
            other => Err(CfbError::Corrupted(format!(
                "unknown directory entry type {}",
                other
            ))),
        }
    }
}

/// Red-black node colour, stored in the record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StgColor {
    Red = 0,
    Black = 1,
}

impl StgColor {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(StgColor::Red),
            1 => Ok(StgColor::Black),
            other => Err(CfbError::Corrupted(format!(
                "unknown directory entry colour {}",
                other
            ))),
        }
    }
}

/// One 128-byte directory record
#[derive(Debug, Clone)]
pub struct DirectoryEntry {
    /// Index of this record in the directory (0 is always the Root)
    pub sid: u32,

    /// Entry name as UTF-16 code units, without the NUL terminator
    name: Vec<u16>,

    pub stg_type: StgType,
    pub color: StgColor,
    pub left_sibling: u32,
    pub right_sibling: u32,
    pub child: u32,
    pub clsid: [u8; 16],
    pub state_bits: u32,
    pub creation_time: u64,
    pub modify_time: u64,

    /// First sector of the entry's data chain (mini or normal space,
    /// decided by `size` against the mini cutoff)
    pub start_sector: u32,

    /// Stream length in bytes. For the Root entry this is the mini
    /// stream's length.
    pub size: u64,
}

impl DirectoryEntry {
    /// Fresh unnamed entry of the given type, not linked anywhere.
    pub fn new(sid: u32, stg_type: StgType) -> Self {
        let now = filetime_now();
        let stamped = matches!(stg_type, StgType::Storage | StgType::Root);
        DirectoryEntry {
            sid,
            name: Vec::new(),
            stg_type,
            color: StgColor::Black,
            left_sibling: NOSTREAM,
            right_sibling: NOSTREAM,
            child: NOSTREAM,
            clsid: [0u8; 16],
            state_bits: 0,
            creation_time: if stamped { now } else { 0 },
            modify_time: if stamped { now } else { 0 },
            start_sector: ENDOFCHAIN,
            size: 0,
        }
    }

    /// The Root Entry (SID 0), owner of the mini stream.
    pub fn root() -> Self {
        let mut root = DirectoryEntry::new(0, StgType::Root);
        root.set_name("Root Entry").expect("root name is valid");
        root
    }

    pub fn name(&self) -> String {
        String::from_utf16_lossy(&self.name)
    }

    pub fn name_units(&self) -> &[u16] {
        &self.name
    }

    /// Set the entry name, enforcing the format's length and character
    /// rules.
    pub fn set_name(&mut self, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(CfbError::Validation("entry name cannot be empty".into()));
        }
        if let Some(bad) = name.chars().find(|c| ILLEGAL_NAME_CHARS.contains(c)) {
            return Err(CfbError::Validation(format!(
                "entry name '{}' contains illegal character '{}'",
                name, bad
            )));
        }

        let units: Vec<u16> = name.encode_utf16().collect();
        if units.len() + 1 > MAX_NAME_UNITS {
            return Err(CfbError::Validation(format!(
                "entry name '{}' exceeds {} UTF-16 units",
                name,
                MAX_NAME_UNITS - 1
            )));
        }

        self.name = units;
        Ok(())
    }

    /// Name length in bytes as stored on disk: encoded units plus the NUL
    /// terminator. Zero for unnamed (Invalid) entries.
    pub fn name_len_bytes(&self) -> u16 {
        if self.name.is_empty() {
            0
        } else {
            ((self.name.len() + 1) * 2) as u16
        }
    }

    pub fn is_invalid(&self) -> bool {
        self.stg_type == StgType::Invalid
    }

    pub fn is_storage(&self) -> bool {
        matches!(self.stg_type, StgType::Storage | StgType::Root)
    }

    pub fn is_stream(&self) -> bool {
        self.stg_type == StgType::Stream
    }

    /// Move another record's payload into this slot, keeping this
    /// record's tree links, colour and SID. The sibling tree uses this
    /// when a two-child deletion relocates the predecessor.
    pub(crate) fn copy_payload_from(&mut self, src: &DirectoryEntry) {
        self.name = src.name.clone();
        self.stg_type = src.stg_type;
        self.child = src.child;
        self.clsid = src.clsid;
        self.state_bits = src.state_bits;
        self.creation_time = src.creation_time;
        self.modify_time = src.modify_time;
        self.start_sector = src.start_sector;
        self.size = src.size;
    }

    /// Reset the record to an Invalid tombstone, freeing the slot for
    /// reuse. The tombstone name keeps deleted slots recognisable in hex
    /// dumps without colliding with live names.
    pub fn tombstone(&mut self) {
        let sid = self.sid;
        *self = DirectoryEntry::new(sid, StgType::Invalid);
        self.start_sector = ENDOFCHAIN;
        self.name = format!("_DELETED_NAME_{}", sid).encode_utf16().collect();
    }

    /// Serialize into a 128-byte slot.
    pub fn write_to(&self, out: &mut [u8]) {
        debug_assert!(out.len() >= DIRECTORY_ENTRY_SIZE);
        out[..DIRECTORY_ENTRY_SIZE].fill(0);

        for (i, unit) in self.name.iter().take(MAX_NAME_UNITS).enumerate() {
            out[i * 2..i * 2 + 2].copy_from_slice(&unit.to_le_bytes());
        }
        out[0x40..0x42].copy_from_slice(&self.name_len_bytes().to_le_bytes());
        out[0x42] = self.stg_type as u8;
        out[0x43] = self.color as u8;
        out[0x44..0x48].copy_from_slice(&self.left_sibling.to_le_bytes());
        out[0x48..0x4C].copy_from_slice(&self.right_sibling.to_le_bytes());
        out[0x4C..0x50].copy_from_slice(&self.child.to_le_bytes());
        out[0x50..0x60].copy_from_slice(&self.clsid);
        out[0x60..0x64].copy_from_slice(&self.state_bits.to_le_bytes());
        out[0x64..0x6C].copy_from_slice(&self.creation_time.to_le_bytes());
        out[0x6C..0x74].copy_from_slice(&self.modify_time.to_le_bytes());
        out[0x74..0x78].copy_from_slice(&self.start_sector.to_le_bytes());
        out[0x78..0x80].copy_from_slice(&self.size.to_le_bytes());
    }

    /// Deserialize from a 128-byte slot. In v3 files only the low 32 bits
    /// of the size field are meaningful; the high half is discarded.
    pub fn from_bytes(sid: u32, bytes: &[u8], version_3: bool) -> Result<Self> {
        if bytes.len() < DIRECTORY_ENTRY_SIZE {
            return Err(CfbError::Corrupted(format!(
                "directory record for SID {} is truncated",
                sid
            )));
        }

        let u16_at = |off: usize| u16::from_le_bytes([bytes[off], bytes[off + 1]]);
        let u32_at = |off: usize| {
            u32::from_le_bytes([bytes[off], bytes[off + 1], bytes[off + 2], bytes[off + 3]])
        };
        let u64_at = |off: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[off..off + 8]);
            u64::from_le_bytes(raw)
        };

        let name_len = u16_at(0x40) as usize;
        let unit_count = if name_len >= 2 {
            ((name_len / 2) - 1).min(MAX_NAME_UNITS)
        } else {
            0
        };
        let mut name = Vec::with_capacity(unit_count);
        for i in 0..unit_count {
            name.push(u16_at(i * 2));
        }

        let mut clsid = [0u8; 16];
        clsid.copy_from_slice(&bytes[0x50..0x60]);

        let mut size = u64_at(0x78);
        if version_3 {
            size &= 0xFFFF_FFFF;
        }

        Ok(DirectoryEntry {
            sid,
            name,
            stg_type: StgType::from_u8(bytes[0x42])?,
            color: StgColor::from_u8(bytes[0x43])?,
            left_sibling: u32_at(0x44),
            right_sibling: u32_at(0x48),
            child: u32_at(0x4C),
            clsid,
            state_bits: u32_at(0x60),
            creation_time: u64_at(0x64),
            modify_time: u64_at(0x6C),
            start_sector: u32_at(0x74),
            size,
        })
    }
}

/// Lightweight projection handed out by the walk APIs
#[derive(Debug, Clone)]
pub struct EntryInfo {
    pub sid: u32,
    pub name: String,
    pub stg_type: StgType,
    pub size: u64,
    pub clsid: [u8; 16],
}

impl EntryInfo {
    pub(crate) fn of(entry: &DirectoryEntry) -> Self {
        EntryInfo {
            sid: entry.sid,
            name: entry.name(),
            stg_type: entry.stg_type,
            size: entry.size,
            clsid: entry.clsid,
        }
    }
}

/// Format-mandated name ordering: shorter encoded names sort first; equal
/// lengths compare unit-by-unit on upper-cased UTF-16 code units.
pub fn cmp_names(a: &[u16], b: &[u16]) -> Ordering {
    match a.len().cmp(&b.len()) {
        Ordering::Equal => {}
        other => return other,
    }
    for (&ua, &ub) in a.iter().zip(b.iter()) {
        match upcase_unit(ua).cmp(&upcase_unit(ub)) {
            Ordering::Equal => {}
            other => return other,
        }
    }
    Ordering::Equal
}

/// Upper-case a single UTF-16 unit. Surrogate halves and characters with
/// multi-unit uppercase expansions map to themselves.
fn upcase_unit(unit: u16) -> u16 {
    if unit < 0x80 {
        return (unit as u8 as char).to_ascii_uppercase() as u16;
    }
    match char::from_u32(unit as u32) {
        Some(c) => {
            let mut upper = c.to_uppercase();
            match (upper.next(), upper.next()) {
                (Some(u), None) if (u as u32) <= 0xFFFF => u as u32 as u16,
                _ => unit,
            }
        }
        None => unit,
    }
}

/// Current time as a FILETIME (100ns intervals since 1601-01-01).
fn filetime_now() -> u64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(elapsed) => (elapsed.as_secs() + FILETIME_UNIX_DELTA) * 10_000_000
            + u64::from(elapsed.subsec_nanos() / 100),
        Err(_) => 0,
    }
}
