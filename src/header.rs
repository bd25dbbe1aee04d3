use crate::error::{CfbError, Result};
use crate::sector::{ENDOFCHAIN, FREESECT};

/// Compound file signature, first 8 bytes of every conforming file.
pub const SIGNATURE: [u8; 8] = [0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1];

/// The header proper always occupies 512 bytes, regardless of sector size.
pub const HEADER_SIZE: usize = 512;

/// Number of FAT sector ids embedded directly in the header DIFAT.
pub const HEADER_DIFAT_ENTRIES: usize = 109;

const BYTE_ORDER_LE: u16 = 0xFFFE;
const MINOR_VERSION: u16 = 0x003E;
const MINI_SECTOR_SHIFT: u16 = 6;

/// Compound file header (sector -1)
///
/// Fixed little-endian prefix of the file: signature, format version,
/// sector geometry, chain entry points for the directory, mini-FAT and
/// DIFAT, and the first 109 FAT sector ids.
#[derive(Debug, Clone)]
pub struct Header {
    /// Minor format version, informative only (0x003E in the wild)
    pub minor_version: u16,

    /// Major format version: 3 (512-byte sectors) or 4 (4096-byte sectors)
    pub major_version: u16,

    /// Byte-order mark, always 0xFFFE (little-endian)
    pub byte_order: u16,

    /// Sector size as a power of two: 9 for v3, 12 for v4
    pub sector_shift: u16,

    /// Mini-sector size as a power of two, always 6 (64 bytes)
    pub mini_sector_shift: u16,

    /// Number of directory sectors (always 0 in v3 files, by format rule)
    pub directory_sectors_count: u32,

    /// Number of FAT sectors
    pub fat_sectors_count: u32,

    /// First sector of the directory chain
    pub first_directory_sector: u32,

    /// Streams strictly below this byte size live in the mini stream
    pub min_standard_stream_size: u32,

    /// First sector of the mini-FAT chain
    pub first_mini_fat_sector: u32,

    /// Number of mini-FAT sectors
    pub mini_fat_sectors_count: u32,

    /// First sector of the DIFAT chain
    pub first_difat_sector: u32,

    /// Number of DIFAT sectors
    pub difat_sectors_count: u32,

    /// The first 109 FAT sector ids; unused slots hold FREESECT
    pub difat: [u32; HEADER_DIFAT_ENTRIES],
}

impl Header {
    /// Create a header for a fresh file of the given major version (3 or 4).
    pub fn new(major_version: u16) -> Self {
        debug_assert!(major_version == 3 || major_version == 4);
        Header {
            minor_version: MINOR_VERSION,
            major_version,
            byte_order: BYTE_ORDER_LE,
            sector_shift: if major_version == 4 { 12 } else { 9 },
            mini_sector_shift: MINI_SECTOR_SHIFT,
            directory_sectors_count: 0,
            fat_sectors_count: 0,
            first_directory_sector: ENDOFCHAIN,
            min_standard_stream_size: 4096,
            first_mini_fat_sector: ENDOFCHAIN,
            mini_fat_sectors_count: 0,
            first_difat_sector: ENDOFCHAIN,
            difat_sectors_count: 0,
            difat: [FREESECT; HEADER_DIFAT_ENTRIES],
        }
    }

    /// Regular sector size in bytes (512 or 4096).
    pub fn sector_size(&self) -> usize {
        1usize << self.sector_shift
    }

    /// Mini sector size in bytes (64).
    pub fn mini_sector_size(&self) -> usize {
        1usize << self.mini_sector_shift
    }

    /// Validate signature, version and sector geometry.
    pub fn validate(&self) -> Result<()> {
        if self.byte_order != BYTE_ORDER_LE {
            return Err(CfbError::FileFormat(format!(
                "unsupported byte order 0x{:04X}",
                self.byte_order
            )));
        }

        match (self.major_version, self.sector_shift) {
            (3, 9) | (4, 12) => {}
            (3, s) | (4, s) => {
                return Err(CfbError::FileFormat(format!(
                    "sector shift {} does not match version {}",
                    s, self.major_version
                )));
            }
            (v, _) => {
                return Err(CfbError::FileFormat(format!(
                    "unsupported major version {}",
                    v
                )));
            }
        }

        if self.mini_sector_shift != MINI_SECTOR_SHIFT {
            return Err(CfbError::FileFormat(format!(
                "unsupported mini sector shift {}",
                self.mini_sector_shift
            )));
        }

        Ok(())
    }

    /// Serialize to the 512-byte on-disk layout.
    ///
    /// Version 4 files reserve a full 4096-byte sector for the header; the
    /// engine pads the remaining 3584 bytes with zeros when writing.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_SIZE);

        bytes.extend_from_slice(&SIGNATURE);
        bytes.extend_from_slice(&[0u8; 16]); // header CLSID, always zero
        bytes.extend_from_slice(&self.minor_version.to_le_bytes());
        bytes.extend_from_slice(&self.major_version.to_le_bytes());
        bytes.extend_from_slice(&self.byte_order.to_le_bytes());
        bytes.extend_from_slice(&self.sector_shift.to_le_bytes());
        bytes.extend_from_slice(&self.mini_sector_shift.to_le_bytes());
        bytes.extend_from_slice(&[0u8; 6]); // reserved
        bytes.extend_from_slice(&self.directory_sectors_count.to_le_bytes());
        bytes.extend_from_slice(&self.fat_sectors_count.to_le_bytes());
        bytes.extend_from_slice(&self.first_directory_sector.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes()); // transaction signature
        bytes.extend_from_slice(&self.min_standard_stream_size.to_le_bytes());
        bytes.extend_from_slice(&self.first_mini_fat_sector.to_le_bytes());
        bytes.extend_from_slice(&self.mini_fat_sectors_count.to_le_bytes());
        bytes.extend_from_slice(&self.first_difat_sector.to_le_bytes());
        bytes.extend_from_slice(&self.difat_sectors_count.to_le_bytes());
        for entry in &self.difat {
            bytes.extend_from_slice(&entry.to_le_bytes());
        }

        debug_assert_eq!(bytes.len(), HEADER_SIZE);
        bytes
    }

    /// Deserialize from the on-disk layout, validating as we go.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(CfbError::FileFormat(format!(
                "file too short for a header: {} bytes",
                bytes.len()
            )));
        }

        if bytes[0..8] != SIGNATURE {
            return Err(CfbError::FileFormat("signature mismatch".into()));
        }

        let u16_at = |off: usize| u16::from_le_bytes([bytes[off], bytes[off + 1]]);
        let u32_at = |off: usize| {
            u32::from_le_bytes([bytes[off], bytes[off + 1], bytes[off + 2], bytes[off + 3]])
        };

        let mut difat = [FREESECT; HEADER_DIFAT_ENTRIES];
        for (i, slot) in difat.iter_mut().enumerate() {
            *slot = u32_at(0x4C + i * 4);
        }

        let header = Header {
            minor_version: u16_at(0x18),
            major_version: u16_at(0x1A),
            byte_order: u16_at(0x1C),
            sector_shift: u16_at(0x1E),
            mini_sector_shift: u16_at(0x20),
            directory_sectors_count: u32_at(0x28),
            fat_sectors_count: u32_at(0x2C),
            first_directory_sector: u32_at(0x30),
            min_standard_stream_size: u32_at(0x38),
            first_mini_fat_sector: u32_at(0x3C),
            mini_fat_sectors_count: u32_at(0x40),
            first_difat_sector: u32_at(0x44),
            difat_sectors_count: u32_at(0x48),
            difat,
        };

        header.validate()?;
        Ok(header)
    }
}
