//! Cross-checking the builder against metadata produced some other way.
//!
//! [`diff_metadata`] compares two records without side effects.
//! [`GenericMetadataBuilder::validate`] builds a record, diffs it against a trusted original and
//! logs both records when they differ. Whether a mismatch ends the process is up to the
//! caller, through [`ValidationOutcome::abort_on_mismatch`].
use crate::{
    abi::{Metadata, TypeDescriptor, ValueWitness, ValueWitnessFlags},
    buffer::Buffer,
    builder::{value_witnesses_of, DescriptorInfo, GenericMetadataBuilder, MetadataDump},
    error::BuilderResult,
    reader_writer::{MemoryReader, ReaderWriter},
    utils::Address,
};
use std::fmt::{self, Display, Formatter};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Difference {
    Witness {
        witness: ValueWitness,
        original: u64,
        built: u64,
    },
    Byte {
        offset: usize,
        original: u8,
        built: u8,
    },
}

impl Display for Difference {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Difference::Witness {
                witness,
                original,
                built,
            } => write!(f, "{witness}: original {original:#x}, built {built:#x}"),
            Difference::Byte {
                offset,
                original,
                built,
            } => write!(f, "byte {offset:#x}: original {original:#04x}, built {built:#04x}"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataDiff {
    pub differences: Vec<Difference>,
}

impl MetadataDiff {
    pub fn is_empty(&self) -> bool {
        self.differences.is_empty()
    }
}

impl Display for MetadataDiff {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("no differences");
        }
        writeln!(f, "{} differences:", self.differences.len())?;
        for difference in &self.differences {
            writeln!(f, "  {difference}")?;
        }
        Ok(())
    }
}

/// Compares the value witness tables of two records entry by entry, then the `record_size`
/// bytes starting at each logical record.
///
/// Enum witnesses are only compared when `is_enum` is set and both tables carry them. A table
/// missing them shows up as a difference in the flags entry.
pub fn diff_metadata<R: MemoryReader + ?Sized>(
    reader: &R,
    original: Buffer<Metadata>,
    built: Buffer<Metadata>,
    record_size: usize,
    is_enum: bool,
) -> BuilderResult<MetadataDiff> {
    let w = reader.pointer_size();
    let mut differences = vec![];

    let original_table = value_witnesses_of(reader, original)?;
    let built_table = value_witnesses_of(reader, built)?;
    let read_entry = |table: Address, witness: ValueWitness| -> BuilderResult<u64> {
        let at = table + witness.offset(w);
        if witness.width(w) == 4 {
            Ok(reader.read_u32(at)? as u64)
        } else {
            reader.read_word(at)
        }
    };
    let has_enum_witnesses = |table: Address| -> BuilderResult<bool> {
        let flags = read_entry(table, ValueWitness::Flags)?;
        Ok(ValueWitnessFlags(flags as u32).has_enum_witnesses())
    };
    let compare_enum_witnesses =
        is_enum && has_enum_witnesses(original_table)? && has_enum_witnesses(built_table)?;
    for witness in ValueWitness::schema(compare_enum_witnesses) {
        let original = read_entry(original_table, *witness)?;
        let built = read_entry(built_table, *witness)?;
        if original != built {
            differences.push(Difference::Witness {
                witness: *witness,
                original,
                built,
            });
        }
    }

    let mut original_bytes = vec![0u8; record_size];
    let mut built_bytes = vec![0u8; record_size];
    reader.read_bytes(original.address, &mut original_bytes)?;
    reader.read_bytes(built.address, &mut built_bytes)?;
    differences.extend(
        original_bytes
            .iter()
            .zip(&built_bytes)
            .enumerate()
            .filter(|(_, (a, b))| a != b)
            .map(|(offset, (original, built))| Difference::Byte {
                offset,
                original: *original,
                built: *built,
            }),
    );

    Ok(MetadataDiff { differences })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationOutcome {
    /// Validation is disabled in the configuration.
    Skipped,
    Matched,
    Mismatch(MetadataDiff),
}

impl ValidationOutcome {
    pub fn is_mismatch(&self) -> bool {
        matches!(self, ValidationOutcome::Mismatch(_))
    }

    /// Terminates the process if the builder disagreed with the original. A builder that
    /// produces wrong metadata must not keep running.
    pub fn abort_on_mismatch(&self) {
        if self.is_mismatch() {
            std::process::abort();
        }
    }
}

impl<R: ReaderWriter> GenericMetadataBuilder<R> {
    /// Builds and initializes metadata for `descriptor` with `arguments` and compares it
    /// against `original`, a record for the same instantiation made by a trusted path.
    pub fn validate(
        &mut self,
        original: Buffer<Metadata>,
        descriptor: Buffer<TypeDescriptor>,
        arguments: &[Address],
    ) -> BuilderResult<ValidationOutcome> {
        if !self.config().validate {
            return Ok(ValidationOutcome::Skipped);
        }
        let config = *self.config();
        let info = DescriptorInfo::read(self.reader_writer(), descriptor)?;
        let extra_data_size = self.extra_data_size(descriptor, info.pattern)?;
        let built = self.build_generic_value_metadata(
            descriptor,
            arguments,
            info.pattern,
            extra_data_size,
        )?;
        let built = self.initialize_generic_metadata(built)?;

        let reader = self.reader_writer();
        let diff = diff_metadata(
            reader,
            original,
            built.record(),
            built.record_size(),
            info.is_enum(),
        )?;
        if diff.is_empty() {
            validation_log!(config, "{} at {} matches the builder", info.name, original.address);
            return Ok(ValidationOutcome::Matched);
        }

        let original_dump = MetadataDump::collect(reader, original, built.record_size())?;
        let built_dump = MetadataDump::collect(reader, built.record(), built.record_size())?;
        validation_log!(
            config,
            failure,
            "builder mismatch for {}\n{diff}\noriginal:\n{original_dump}\nbuilt:\n{built_dump}",
            info.name
        );
        Ok(ValidationOutcome::Mismatch(diff))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::BuilderConfig,
        memory::snapshot::MemorySnapshot,
        reader_writer::SnapshotReaderWriter,
    };
    use pretty_assertions::assert_eq;

    /// 8-byte-pointer records: `a` and `b` share a struct witness table and differ in one
    /// extra byte, `c` matches `a` but points at a table with enum witnesses.
    fn snapshot() -> MemorySnapshot {
        let mut snapshot = MemorySnapshot::new();
        let mut table = vec![0u8; 88];
        table[64..72].copy_from_slice(&4u64.to_le_bytes());
        snapshot.map_segment("table", Address(0x1000), table).unwrap();

        let mut enum_table = vec![0u8; 112];
        enum_table[64..72].copy_from_slice(&4u64.to_le_bytes());
        enum_table[80..84].copy_from_slice(&ValueWitnessFlags::HAS_ENUM_WITNESSES.to_le_bytes());
        snapshot
            .map_segment("enum table", Address(0x1800), enum_table)
            .unwrap();

        let record = |table: u64, last: u8| {
            let mut bytes = vec![0u8; 32];
            bytes[0..8].copy_from_slice(&table.to_le_bytes());
            bytes[8..16].copy_from_slice(&0x200u64.to_le_bytes());
            bytes[31] = last;
            bytes
        };
        snapshot.map_segment("a", Address(0x2000), record(0x1000, 1)).unwrap();
        snapshot.map_segment("b", Address(0x3000), record(0x1000, 2)).unwrap();
        snapshot.map_segment("c", Address(0x4000), record(0x1800, 1)).unwrap();
        snapshot
    }

    #[test]
    fn test_diff() {
        let rw = SnapshotReaderWriter::new(snapshot(), BuilderConfig::default());
        let a = Buffer::new(Address(0x2008));
        let b = Buffer::new(Address(0x3008));
        let same = diff_metadata(&rw, a, a, 24, false).unwrap();
        assert!(same.is_empty());
        assert_eq!(same.to_string(), "no differences");

        let diff = diff_metadata(&rw, a, b, 24, false).unwrap();
        assert_eq!(
            diff.differences,
            vec![Difference::Byte {
                offset: 23,
                original: 1,
                built: 2
            }]
        );
        assert_eq!(diff.to_string(), "1 differences:\n  byte 0x17: original 0x01, built 0x02\n");
    }

    #[test]
    fn test_missing_enum_witnesses_differ_in_flags() {
        let rw = SnapshotReaderWriter::new(snapshot(), BuilderConfig::default());
        let a = Buffer::new(Address(0x2008));
        let c = Buffer::new(Address(0x4008));
        let diff = diff_metadata(&rw, a, c, 24, true).unwrap();
        assert_eq!(
            diff.differences,
            vec![Difference::Witness {
                witness: ValueWitness::Flags,
                original: 0,
                built: ValueWitnessFlags::HAS_ENUM_WITNESSES as u64,
            }]
        );
        assert!(diff_metadata(&rw, c, c, 24, true).unwrap().is_empty());
    }

    #[test]
    fn test_disabled_validation_is_skipped() {
        let rw = SnapshotReaderWriter::new(snapshot(), BuilderConfig::default());
        let mut builder = GenericMetadataBuilder::new(rw);
        let outcome = builder
            .validate(Buffer::new(Address(0x2008)), Buffer::null(), &[])
            .unwrap();
        assert_eq!(outcome, ValidationOutcome::Skipped);
        outcome.abort_on_mismatch();
    }
}
