//! Compound File Binary engine
//!
//! A read/write implementation of the Microsoft Compound File Binary
//! format (CFB, also known as OLE structured storage): a FAT-style file
//! system embedded inside a single host file, used by MSI packages,
//! legacy Office documents, Outlook messages and countless other formats.
//!
//! ## Features
//!
//! - **Versions 3 and 4** (512-byte and 4096-byte sectors)
//! - **Two-level addressing**: regular sectors plus 64-byte mini sectors
//!   carved out of the root entry's chain for streams under 4 KiB
//! - **Lazy sector loading**: payloads fault in on first touch
//! - **In-place differential commit**: only dirty sectors are rewritten,
//!   coalesced into contiguous runs
//! - **Red-black child index** with the format-mandated name ordering
//! - **Version-3 compaction** (`shrink`) that drops freed space
//!
//! ## Layout
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │ Header (one sector)                         │
//! │  - signature D0 CF 11 E0 A1 B1 1A E1        │
//! │  - 109-entry DIFAT, chain entry points      │
//! ├─────────────────────────────────────────────┤
//! │ Sector array                                │
//! │  - FAT / DIFAT / MiniFAT sectors            │
//! │  - directory chain (128-byte entries)       │
//! │  - stream data chains                       │
//! │  - mini stream (inside the root's chain)    │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use coffer::{CompoundFile, Version};
//!
//! # fn main() -> coffer::Result<()> {
//! let mut cf = CompoundFile::create(Version::V3);
//! let mut root = cf.root_storage()?;
//! let mut storage = root.add_storage("MyStorage")?;
//! let mut stream = storage.add_stream("MyStream")?;
//! stream.write_at(0, b"hello structured storage")?;
//! cf.save("example.cfs")?;
//! # Ok(())
//! # }
//! ```

pub mod compound;
pub mod directory;
pub mod error;
pub mod header;
pub mod rbtree;
pub mod sector;
pub mod storage;
pub mod stream_view;

pub use compound::{CompoundFile, Config, UpdateMode, Version};
pub use directory::{DirectoryEntry, EntryInfo, StgColor, StgType};
pub use error::{CfbError, Result};
pub use header::Header;
pub use sector::{Sector, SectorCollection, SectorType};
pub use storage::{Storage, Stream};
pub use stream_view::StreamView;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Format signature, re-exported for sniffing buffers
pub const SIGNATURE: &[u8; 8] = &header::SIGNATURE;
