//! Seekable byte view over a sector chain
//!
//! Maps logical stream offsets onto an ordered list of sector ids, faulting
//! sector payloads in from the backing source on first touch. Writing past
//! the end extends the chain, preferring sectors from a reusable-sector
//! queue before appending fresh ones. The FAT, mini-FAT, DIFAT and the
//! directory are all read and written through views like any other chain.

use crate::sector::{Sector, SectorCollection, SectorType};
use std::collections::VecDeque;
use std::io::{self, Read, Seek, SeekFrom, Write};

/// Byte view over an ordered sector chain
pub struct StreamView<'a, S: Read + Seek> {
    chain: &'a mut Vec<u32>,
    sectors: &'a mut SectorCollection,
    source: Option<&'a mut S>,
    source_len: u64,
    sector_size: usize,
    sector_type: SectorType,
    length: u64,
    position: u64,
    recycle: Option<&'a mut VecDeque<u32>>,
}

impl<'a, S: Read + Seek> StreamView<'a, S> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chain: &'a mut Vec<u32>,
        sectors: &'a mut SectorCollection,
        source: Option<&'a mut S>,
        source_len: u64,
        sector_size: usize,
        sector_type: SectorType,
        length: u64,
        recycle: Option<&'a mut VecDeque<u32>>,
    ) -> Self {
        StreamView {
            chain,
            sectors,
            source,
            source_len,
            sector_size,
            sector_type,
            length,
            position: 0,
            recycle,
        }
    }

    /// Logical length in bytes.
    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Make sure the chain covers at least `bytes` and raise the logical
    /// length. New sectors come from the recycle queue first (zeroed on
    /// reuse so extensions always read back as zeros), then fresh.
    pub fn extend_to(&mut self, bytes: u64) {
        let needed = (bytes as usize).div_ceil(self.sector_size);
        while self.chain.len() < needed {
            let id = match self.recycle.as_mut().and_then(|q| q.pop_front()) {
                Some(id) => {
                    if self.sectors.get(id).is_none() {
                        let sector = Sector::with_id(id, self.sector_size, self.sector_type);
                        self.sectors.set(id, sector);
                    }
                    let sector = self.sectors.get_mut(id).expect("recycled slot exists");
                    sector.set_sector_type(self.sector_type);
                    sector.fill_zero();
                    id
                }
                None => {
                    let (id, _) = self
                        .sectors
                        .push(Sector::new(self.sector_size, self.sector_type));
                    id
                }
            };
            self.chain.push(id);
        }
        if bytes > self.length {
            self.length = bytes;
        }
    }

    /// Fault the payload of the chain's `idx`-th sector and hand it back
    /// read-only.
    fn sector_payload(&mut self, idx: usize) -> io::Result<&[u8]> {
        let id = self.chain[idx];
        if self.sectors.get(id).is_none() {
            let sector = Sector::with_id(id, self.sector_size, self.sector_type);
            self.sectors.set(id, sector);
        }

        self.load_if_streamed(id)?;
        let sector = self.sectors.get_mut(id).expect("slot just materialised");
        Ok(sector.payload())
    }

    /// Same as `sector_payload` but writable; marks the sector dirty.
    fn sector_payload_mut(&mut self, idx: usize) -> io::Result<&mut Vec<u8>> {
        let id = self.chain[idx];
        if self.sectors.get(id).is_none() {
            let sector = Sector::with_id(id, self.sector_size, self.sector_type);
            self.sectors.set(id, sector);
        }

        self.load_if_streamed(id)?;
        let sector = self.sectors.get_mut(id).expect("slot just materialised");
        Ok(sector.payload_mut())
    }

    fn load_if_streamed(&mut self, id: u32) -> io::Result<()> {
        let needs_load = {
            let sector = self.sectors.get(id).expect("slot exists");
            !sector.is_loaded() && sector.is_streamed(self.source_len)
        };
        if !needs_load {
            return Ok(());
        }
        let offset = self
            .sectors
            .get(id)
            .expect("slot exists")
            .file_offset();
        let mut buf = vec![0u8; self.sector_size];
        if let Some(source) = self.source.as_mut() {
            source.seek(SeekFrom::Start(offset))?;
            source.read_exact(&mut buf)?;
        }
        self.sectors
            .get_mut(id)
            .expect("slot exists")
            .set_loaded(buf);
        Ok(())
    }

    /// Read a little-endian u32 at an absolute byte offset (FAT/DIFAT/
    /// mini-FAT entries are 4-byte aligned, so this never spans sectors).
    pub fn read_u32_at(&mut self, offset: u64) -> io::Result<u32> {
        let mut raw = [0u8; 4];
        self.seek(SeekFrom::Start(offset))?;
        self.read_exact(&mut raw)?;
        Ok(u32::from_le_bytes(raw))
    }

    /// Write a little-endian u32 at an absolute byte offset.
    pub fn write_u32_at(&mut self, offset: u64, value: u32) -> io::Result<()> {
        self.seek(SeekFrom::Start(offset))?;
        self.write_all(&value.to_le_bytes())
    }
}

impl<S: Read + Seek> Read for StreamView<'_, S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.position >= self.length {
            return Ok(0);
        }
        let sector_size = self.sector_size as u64;
        let mut copied = 0usize;
        let limit = buf.len().min((self.length - self.position) as usize);

        while copied < limit {
            let idx = (self.position / sector_size) as usize;
            let offset = (self.position % sector_size) as usize;
            if idx >= self.chain.len() {
                break;
            }
            let take = (self.sector_size - offset).min(limit - copied);
            let payload = self.sector_payload(idx)?;
            buf[copied..copied + take].copy_from_slice(&payload[offset..offset + take]);
            copied += take;
            self.position += take as u64;
        }
        Ok(copied)
    }
}

impl<S: Read + Seek> Write for StreamView<'_, S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let end = self.position + buf.len() as u64;
        self.extend_to(end.max(self.length));

        let sector_size = self.sector_size as u64;
        let mut copied = 0usize;
        while copied < buf.len() {
            let idx = (self.position / sector_size) as usize;
            let offset = (self.position % sector_size) as usize;
            let take = (self.sector_size - offset).min(buf.len() - copied);
            let payload = self.sector_payload_mut(idx)?;
            payload[offset..offset + take].copy_from_slice(&buf[copied..copied + take]);
            copied += take;
            self.position += take as u64;
        }
        Ok(copied)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<S: Read + Seek> Seek for StreamView<'_, S> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::End(offset) => self.length as i64 + offset,
            SeekFrom::Current(offset) => self.position as i64 + offset,
        };
        if target < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of stream view",
            ));
        }
        self.position = target as u64;
        Ok(self.position)
    }
}
