//! Storage and stream handles
//!
//! Thin borrow-based wrappers over the engine. A `Storage` navigates one
//! directory entry's children; a `Stream` reads and writes one entry's
//! byte chain. Handles hold a mutable borrow of the engine, so the borrow
//! checker rules out stale handles for the common cases and `Disposed`
//! covers the rest.

use crate::compound::CompoundFile;
use crate::directory::{EntryInfo, StgType};
use crate::error::{CfbError, Result};
use std::io::{Read, Seek, Write};

/// Handle to a storage (directory) entry
pub struct Storage<'a, F> {
    cf: &'a mut CompoundFile<F>,
    sid: u32,
}

impl<'a, F: Read + Write + Seek> Storage<'a, F> {
    pub(crate) fn new(cf: &'a mut CompoundFile<F>, sid: u32) -> Self {
        Storage { cf, sid }
    }

    pub fn sid(&self) -> u32 {
        self.sid
    }

    pub fn name(&self) -> Result<String> {
        Ok(self.cf.entry_info(self.sid)?.name)
    }

    pub fn clsid(&self) -> Result<[u8; 16]> {
        self.cf.clsid_of_sid(self.sid)
    }

    pub fn set_clsid(&mut self, clsid: [u8; 16]) -> Result<()> {
        self.cf.set_clsid(self.sid, clsid)
    }

    /// Create a child storage. Fails with `Duplicated` when the name is
    /// already taken under this storage.
    pub fn add_storage(&mut self, name: &str) -> Result<Storage<'_, F>> {
        let sid = self.cf.add_entry(self.sid, name, StgType::Storage)?;
        Ok(Storage::new(&mut *self.cf, sid))
    }

    /// Create a child stream, initially empty.
    pub fn add_stream(&mut self, name: &str) -> Result<Stream<'_, F>> {
        let sid = self.cf.add_entry(self.sid, name, StgType::Stream)?;
        Ok(Stream {
            cf: &mut *self.cf,
            sid,
        })
    }

    /// Open a child storage by name.
    pub fn storage(&mut self, name: &str) -> Result<Storage<'_, F>> {
        let sid = self
            .cf
            .find_child(self.sid, name)?
            .ok_or_else(|| CfbError::ItemNotFound(name.to_string()))?;
        if self.cf.entry_info(sid)?.stg_type != StgType::Storage {
            return Err(CfbError::ItemNotFound(name.to_string()));
        }
        Ok(Storage::new(&mut *self.cf, sid))
    }

    /// Open a child stream by name.
    pub fn stream(&mut self, name: &str) -> Result<Stream<'_, F>> {
        let sid = self
            .cf
            .find_child(self.sid, name)?
            .ok_or_else(|| CfbError::ItemNotFound(name.to_string()))?;
        if self.cf.entry_info(sid)?.stg_type != StgType::Stream {
            return Err(CfbError::ItemNotFound(name.to_string()));
        }
        Ok(Stream {
            cf: &mut *self.cf,
            sid,
        })
    }

    pub fn contains(&self, name: &str) -> Result<bool> {
        Ok(self.cf.find_child(self.sid, name)?.is_some())
    }

    /// Delete a named child. Storages are emptied recursively; the root
    /// itself can never be deleted.
    pub fn delete(&mut self, name: &str) -> Result<()> {
        self.cf.delete_entry(self.sid, name)
    }

    /// Direct children in tree order.
    pub fn entries(&self) -> Result<Vec<EntryInfo>> {
        self.cf.children_of(self.sid)
    }

    /// Walk entries, optionally descending into child storages. The
    /// visitor receives each entry with its depth below this storage.
    pub fn visit<V>(&self, recursive: bool, visitor: &mut V) -> Result<()>
    where
        V: FnMut(&EntryInfo, usize),
    {
        visit_inner(self.cf, self.sid, 0, recursive, visitor)
    }
}

fn visit_inner<F, V>(
    cf: &CompoundFile<F>,
    sid: u32,
    depth: usize,
    recursive: bool,
    visitor: &mut V,
) -> Result<()>
where
    F: Read + Write + Seek,
    V: FnMut(&EntryInfo, usize),
{
    for info in cf.children_of(sid)? {
        visitor(&info, depth);
        if recursive && info.stg_type == StgType::Storage {
            visit_inner(cf, info.sid, depth + 1, recursive, visitor)?;
        }
    }
    Ok(())
}

/// Handle to a stream entry
pub struct Stream<'a, F> {
    cf: &'a mut CompoundFile<F>,
    sid: u32,
}

impl<F: Read + Write + Seek> Stream<'_, F> {
    pub fn sid(&self) -> u32 {
        self.sid
    }

    pub fn name(&self) -> Result<String> {
        Ok(self.cf.entry_info(self.sid)?.name)
    }

    pub fn len(&self) -> Result<u64> {
        self.cf.stream_len(self.sid)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Read at an arbitrary offset; returns the bytes actually read.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.cf.read_stream_at(self.sid, offset, buf)
    }

    /// The whole stream as one buffer.
    pub fn read_all(&mut self) -> Result<Vec<u8>> {
        self.cf.raw_data_of_sid(self.sid)
    }

    /// Write at an arbitrary offset, growing the stream as needed. A
    /// write crossing the mini cutoff migrates the stream between the
    /// mini and normal sector spaces transparently.
    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.cf.write_stream_at(self.sid, offset, data)
    }

    /// Append at the current end.
    pub fn append(&mut self, data: &[u8]) -> Result<()> {
        let len = self.len()?;
        self.write_at(len, data)
    }

    /// Truncate or zero-extend to `new_len`.
    pub fn resize(&mut self, new_len: u64) -> Result<()> {
        self.cf.set_stream_len(self.sid, new_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compound::Version;

    #[test]
    fn test_nested_storages_and_streams() {
        let mut cf = CompoundFile::create(Version::V3);
        let mut root = cf.root_storage().unwrap();
        assert_eq!(root.name().unwrap(), "Root Entry");

        let mut level1 = root.add_storage("Level_1").unwrap();
        let mut stream = level1.add_stream("Level2Stream").unwrap();
        stream.write_at(0, &[0x42; 100]).unwrap();
        assert_eq!(stream.len().unwrap(), 100);

        let mut again = cf.root_storage().unwrap();
        let mut level1 = again.storage("Level_1").unwrap();
        let mut stream = level1.stream("Level2Stream").unwrap();
        let data = stream.read_all().unwrap();
        assert_eq!(data, vec![0x42; 100]);
    }

    #[test]
    fn test_duplicate_stream_name_rejected() {
        let mut cf = CompoundFile::create(Version::V3);
        let mut root = cf.root_storage().unwrap();
        let mut level1 = root.add_storage("Level_1").unwrap();
        level1.add_stream("Level2Stream").unwrap();
        assert!(matches!(
            level1.add_stream("Level2Stream"),
            Err(CfbError::Duplicated(_))
        ));
    }

    #[test]
    fn test_storage_and_stream_are_distinct_kinds() {
        let mut cf = CompoundFile::create(Version::V3);
        let mut root = cf.root_storage().unwrap();
        root.add_storage("folder").unwrap();
        root.add_stream("blob").unwrap();

        let mut root = cf.root_storage().unwrap();
        assert!(matches!(
            root.stream("folder"),
            Err(CfbError::ItemNotFound(_))
        ));
        assert!(matches!(
            root.storage("blob"),
            Err(CfbError::ItemNotFound(_))
        ));
    }

    #[test]
    fn test_delete_storage_recursively() {
        let mut cf = CompoundFile::create(Version::V3);
        let mut root = cf.root_storage().unwrap();
        let mut outer = root.add_storage("outer").unwrap();
        let mut inner = outer.add_storage("inner").unwrap();
        inner.add_stream("leaf").unwrap().write_at(0, b"x").unwrap();

        let mut root = cf.root_storage().unwrap();
        root.delete("outer").unwrap();
        assert!(!root.contains("outer").unwrap());
        // only tombstones remain besides the root
        assert_eq!(cf.find_entries_named("leaf").unwrap().len(), 0);
    }

    #[test]
    fn test_visit_recursive_depths() {
        let mut cf = CompoundFile::create(Version::V3);
        let mut root = cf.root_storage().unwrap();
        let mut a = root.add_storage("a").unwrap();
        a.add_stream("a1").unwrap();
        root.add_stream("top").unwrap();

        let root = cf.root_storage().unwrap();
        let mut seen = Vec::new();
        root.visit(true, &mut |info, depth| {
            seen.push((info.name.clone(), depth));
        })
        .unwrap();
        seen.sort();
        assert_eq!(
            seen,
            vec![
                ("a".to_string(), 0),
                ("a1".to_string(), 1),
                ("top".to_string(), 0)
            ]
        );
    }

    #[test]
    fn test_set_clsid_only_on_storages() {
        let mut cf = CompoundFile::create(Version::V3);
        let mut root = cf.root_storage().unwrap();
        let mut folder = root.add_storage("folder").unwrap();
        let clsid = [7u8; 16];
        folder.set_clsid(clsid).unwrap();
        assert_eq!(folder.clsid().unwrap(), clsid);

        let stream_sid = {
            let mut root = cf.root_storage().unwrap();
            let s = root.add_stream("s").unwrap();
            s.sid()
        };
        assert!(matches!(
            cf.set_clsid(stream_sid, clsid),
            Err(CfbError::InvalidOperation(_))
        ));
    }

    #[test]
    fn test_append_and_resize() {
        let mut cf = CompoundFile::create(Version::V3);
        let mut root = cf.root_storage().unwrap();
        let mut s = root.add_stream("grow").unwrap();
        s.write_at(0, b"hello").unwrap();
        s.append(b" world").unwrap();
        assert_eq!(s.read_all().unwrap(), b"hello world");

        s.resize(5).unwrap();
        assert_eq!(s.read_all().unwrap(), b"hello");

        s.resize(8).unwrap();
        assert_eq!(s.read_all().unwrap(), b"hello\0\0\0");
    }
}
