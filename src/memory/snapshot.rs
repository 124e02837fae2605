//! Serialized copy of another process's address space.
//!
//! A snapshot is a set of mapped segments (base address + bytes) together with the symbols
//! and registered type names that were exported from the inspected process. The out-of-process
//! reader/writer performs every read and write against a snapshot, and maps the regions it
//! allocates into the same snapshot at fresh addresses above every existing segment.
use crate::{
    error::{BuilderError, BuilderResult},
    utils::{align_up, Address},
};
use serde::{Deserialize, Serialize};
use std::{fs::File, io::BufReader, io::BufWriter, path::Path};
use thiserror::Error;

/// Granularity at which new segments are placed.
pub const SEGMENT_ALIGN: usize = 0x1000;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("segment '{name}' at {base} overlaps an existing segment")]
    Overlap { name: String, base: Address },
    #[error("snapshot I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed snapshot: {0}")]
    Format(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub name: String,
    pub base: Address,
    pub bytes: Vec<u8>,
}

impl Segment {
    pub fn end(&self) -> Address {
        self.base + self.bytes.len()
    }

    pub fn contains(&self, address: Address, len: usize) -> bool {
        match address.checked_sub(self.base) {
            Some(start) => (start as usize)
                .checked_add(len)
                .is_some_and(|end| end <= self.bytes.len()),
            None => false,
        }
    }

    fn range(&self, address: Address, len: usize) -> std::ops::Range<usize> {
        let start = (address.0 - self.base.0) as usize;
        start..start + len
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotSymbol {
    pub name: String,
    pub address: Address,
}

/// A mangled type name the inspected process could resolve, and the metadata it resolved to.
/// Generic instantiations also list the metadata of their arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeEntry {
    pub mangled_name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<Address>,
    pub metadata: Address,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemorySnapshot {
    pub pointer_size: usize,
    segments: Vec<Segment>,
    symbols: Vec<SnapshotSymbol>,
    types: Vec<TypeEntry>,
}

impl Default for MemorySnapshot {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySnapshot {
    pub fn new() -> Self {
        Self {
            pointer_size: 8,
            segments: vec![],
            symbols: vec![],
            types: vec![],
        }
    }

    pub fn map_segment(
        &mut self,
        name: impl Into<String>,
        base: Address,
        bytes: Vec<u8>,
    ) -> Result<(), SnapshotError> {
        let name = name.into();
        let end = base + bytes.len();
        if self
            .segments
            .iter()
            .any(|s| base < s.end() && s.base < end)
        {
            return Err(SnapshotError::Overlap { name, base });
        }
        let index = self.segments.partition_point(|s| s.base < base);
        self.segments.insert(index, Segment { name, base, bytes });
        Ok(())
    }

    /// Maps a zeroed segment of `size` bytes at the first free, segment-aligned address above
    /// every existing segment and returns its base.
    pub fn map_anonymous(&mut self, name: impl Into<String>, size: usize) -> Address {
        let base = self.next_free_address();
        self.segments.push(Segment {
            name: name.into(),
            base,
            bytes: vec![0; size],
        });
        base
    }

    pub fn next_free_address(&self) -> Address {
        let top = self
            .segments
            .iter()
            .map(|s| s.end().0 as usize)
            .max()
            .unwrap_or(SEGMENT_ALIGN);
        Address(align_up(top.max(SEGMENT_ALIGN), SEGMENT_ALIGN) as u64)
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn segment_containing(&self, address: Address) -> Option<&Segment> {
        self.segments.iter().find(|s| s.contains(address, 1))
    }

    pub fn read(&self, address: Address, out: &mut [u8]) -> BuilderResult<()> {
        let segment = self
            .segments
            .iter()
            .find(|s| s.contains(address, out.len()))
            .ok_or(BuilderError::MemoryRead {
                address,
                len: out.len(),
            })?;
        out.copy_from_slice(&segment.bytes[segment.range(address, out.len())]);
        Ok(())
    }

    /// Writes into mapped memory. Returns `false` without writing anything if the range is not
    /// entirely inside one segment.
    pub fn write(&mut self, address: Address, bytes: &[u8]) -> bool {
        match self
            .segments
            .iter_mut()
            .find(|s| s.contains(address, bytes.len()))
        {
            Some(segment) => {
                let range = segment.range(address, bytes.len());
                segment.bytes[range].copy_from_slice(bytes);
                true
            }
            None => false,
        }
    }

    pub fn add_symbol(&mut self, name: impl Into<String>, address: Address) {
        self.symbols.push(SnapshotSymbol {
            name: name.into(),
            address,
        });
    }

    pub fn symbol_address(&self, name: &str) -> Option<Address> {
        self.symbols
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.address)
    }

    /// Finds the closest symbol at or below `address` within the segment containing it.
    pub fn symbol_at(&self, address: Address) -> Option<(&SnapshotSymbol, &Segment)> {
        let segment = self.segment_containing(address)?;
        let symbol = self
            .symbols
            .iter()
            .filter(|s| s.address <= address && segment.contains(s.address, 1))
            .max_by_key(|s| s.address)?;
        Some((symbol, segment))
    }

    pub fn add_type(&mut self, mangled_name: impl Into<String>, metadata: Address) {
        self.add_instantiation(mangled_name, vec![], metadata);
    }

    pub fn add_instantiation(
        &mut self,
        mangled_name: impl Into<String>,
        arguments: Vec<Address>,
        metadata: Address,
    ) {
        self.types.push(TypeEntry {
            mangled_name: mangled_name.into(),
            arguments,
            metadata,
        });
    }

    pub fn types(&self) -> &[TypeEntry] {
        &self.types
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, SnapshotError> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), SnapshotError> {
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer(writer, self)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> MemorySnapshot {
        let mut snapshot = MemorySnapshot::new();
        snapshot
            .map_segment("libfoo", Address(0x10000), (0u8..32).collect())
            .unwrap();
        snapshot.add_symbol("first", Address(0x10000));
        snapshot.add_symbol("second", Address(0x10010));
        snapshot.add_type("Si", Address(0x10008));
        snapshot.add_instantiation("4main3BoxV", vec![Address(0x10008)], Address(0x10018));
        snapshot
    }

    #[test]
    fn test_read_and_write_within_segment() {
        let mut snapshot = snapshot();
        let mut out = [0u8; 4];
        snapshot.read(Address(0x10004), &mut out).unwrap();
        assert_eq!(out, [4, 5, 6, 7]);

        assert!(snapshot.write(Address(0x10004), &[9, 9]));
        snapshot.read(Address(0x10004), &mut out).unwrap();
        assert_eq!(out, [9, 9, 6, 7]);
    }

    #[test]
    fn test_out_of_bounds_access() {
        let mut snapshot = snapshot();
        let mut out = [0u8; 4];
        assert_eq!(
            snapshot.read(Address(0x1001e), &mut out),
            Err(BuilderError::MemoryRead {
                address: Address(0x1001e),
                len: 4
            })
        );
        assert!(!snapshot.write(Address(0x20000), &[1]));
    }

    #[test]
    fn test_overlap_rejected() {
        let mut snapshot = snapshot();
        assert!(matches!(
            snapshot.map_segment("other", Address(0x10010), vec![0; 8]),
            Err(SnapshotError::Overlap { .. })
        ));
    }

    #[test]
    fn test_anonymous_segments_are_placed_above_existing_ones() {
        let mut snapshot = snapshot();
        let base = snapshot.map_anonymous("alloc", 16);
        assert_eq!(base, Address(0x11000));
        let next = snapshot.map_anonymous("alloc", 16);
        assert_eq!(next, Address(0x12000));
    }

    #[test]
    fn test_symbol_at() {
        let snapshot = snapshot();
        let (symbol, segment) = snapshot.symbol_at(Address(0x10014)).unwrap();
        assert_eq!(symbol.name, "second");
        assert_eq!(segment.name, "libfoo");
        assert!(snapshot.symbol_at(Address(0x30000)).is_none());
    }

    #[test]
    fn test_json_round_trip() {
        let snapshot = snapshot();
        let json = serde_json::to_string(&snapshot).unwrap();
        let decoded: MemorySnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, snapshot);
    }
}
