//! Decoded views of the static structures the builder reads.
use super::instructions::{decode_instruction, FieldInstruction};
use crate::{
    abi::{
        descriptor, field_descriptor, instruction, pattern, DescriptorFlags, DescriptorKind,
        FieldDescriptor, Metadata, MetadataKind, MetadataPattern, TypeDescriptor, ValueWitness,
        ValueWitnessFlags,
    },
    buffer::Buffer,
    error::{BuilderError, BuilderResult},
    reader_writer::MemoryReader,
    utils::Address,
};

#[derive(Debug, Clone, PartialEq)]
pub struct DescriptorInfo {
    pub address: Buffer<TypeDescriptor>,
    pub flags: DescriptorFlags,
    pub name: String,
    pub pattern: Buffer<MetadataPattern>,
    pub fields: Buffer<FieldDescriptor>,
    kind_word0: u32,
    kind_word1: u32,
    pub num_params: u16,
    pub num_key_arguments: u16,
    pub generic_argument_offset: u32,
}

impl DescriptorInfo {
    pub fn read<R: MemoryReader + ?Sized>(
        reader: &R,
        address: Buffer<TypeDescriptor>,
    ) -> BuilderResult<Self> {
        let base = address.address;
        let name: Buffer<u8> = reader.resolve_field(base, descriptor::NAME)?;
        Ok(Self {
            address,
            flags: DescriptorFlags(reader.read_u32(base + descriptor::FLAGS)?),
            name: reader.read_c_string(name.address)?,
            pattern: reader.resolve_field(base, descriptor::PATTERN)?,
            fields: reader.resolve_field(base, descriptor::FIELDS)?,
            kind_word0: reader.read_u32(base + descriptor::NUM_FIELDS)?,
            kind_word1: reader.read_u32(base + descriptor::FIELD_OFFSET_VECTOR)?,
            num_params: reader.read_u16(base + descriptor::NUM_PARAMS)?,
            num_key_arguments: reader.read_u16(base + descriptor::NUM_KEY_ARGUMENTS)?,
            generic_argument_offset: reader.read_u32(base + descriptor::GENERIC_ARGUMENT_OFFSET)?,
        })
    }

    pub fn kind(&self) -> DescriptorKind {
        self.flags.kind()
    }

    pub fn is_enum(&self) -> bool {
        self.kind() == DescriptorKind::Enum
    }

    pub fn num_fields(&self) -> usize {
        self.kind_word0 as usize
    }

    /// Offset of the field offset vector in words from the logical record, 0 if absent.
    pub fn field_offset_vector_offset(&self) -> usize {
        self.kind_word1 as usize
    }

    pub fn num_payload_cases(&self) -> usize {
        (self.kind_word0 & descriptor::PAYLOAD_CASES_MASK) as usize
    }

    /// Offset of the payload size word in words from the logical record, 0 if absent.
    pub fn payload_size_offset(&self) -> usize {
        (self.kind_word0 >> descriptor::PAYLOAD_SIZE_OFFSET_SHIFT) as usize
    }

    pub fn num_empty_cases(&self) -> usize {
        self.kind_word1 as usize
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PatternInfo {
    pub address: Buffer<MetadataPattern>,
    pub value_witnesses: Address,
    pub kind: MetadataKind,
    pub instructions: Vec<FieldInstruction>,
}

impl PatternInfo {
    pub fn read<R: MemoryReader + ?Sized>(
        reader: &R,
        address: Buffer<MetadataPattern>,
    ) -> BuilderResult<Self> {
        if address.is_null() {
            return Err(BuilderError::invalid_pattern("descriptor has no metadata pattern"));
        }
        let base = address.address;
        let value_witnesses: Buffer<u8> = reader.resolve_field(base, pattern::VALUE_WITNESSES)?;
        let raw_kind = reader.read_u16(base + pattern::METADATA_KIND)?;
        let kind = MetadataKind::from_raw(raw_kind as u64).ok_or_else(|| {
            BuilderError::invalid_pattern(format!("unknown metadata kind {raw_kind:#x}"))
        })?;

        let count = reader.read_u16(base + pattern::NUM_INSTRUCTIONS)? as usize;
        let array: Buffer<u8> = reader.resolve_field(base, pattern::INSTRUCTIONS)?;
        if array.is_null() && count > 0 {
            return Err(BuilderError::invalid_pattern(format!(
                "pattern declares {count} instructions but has no instruction array"
            )));
        }
        let instructions = (0..count)
            .map(|i| decode_instruction(reader, array.address + i * instruction::SIZE))
            .collect::<BuilderResult<Vec<_>>>()?;

        Ok(Self {
            address,
            value_witnesses: value_witnesses.address,
            kind,
            instructions,
        })
    }
}

/// One record of a field descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldRecord {
    pub mangled_type_name: Option<String>,
    pub name: String,
}

pub fn read_field_records<R: MemoryReader + ?Sized>(
    reader: &R,
    fields: Buffer<FieldDescriptor>,
) -> BuilderResult<Vec<FieldRecord>> {
    if fields.is_null() {
        return Ok(vec![]);
    }
    let base = fields.address;
    let count = reader.read_u16(base + field_descriptor::NUM_RECORDS)? as usize;
    let stride = reader.read_u16(base + field_descriptor::RECORD_SIZE)? as usize;
    if stride < field_descriptor::RECORD_STRIDE {
        return Err(BuilderError::invalid_pattern(format!(
            "field record size {stride} is too small"
        )));
    }
    (0..count)
        .map(|i| {
            let record = base + field_descriptor::HEADER_SIZE + i * stride;
            let type_name: Buffer<u8> =
                reader.resolve_field(record, field_descriptor::MANGLED_TYPE_NAME)?;
            let name: Buffer<u8> = reader.resolve_field(record, field_descriptor::FIELD_NAME)?;
            Ok(FieldRecord {
                mangled_type_name: if type_name.is_null() {
                    None
                } else {
                    Some(reader.read_c_string(type_name.address)?)
                },
                name: reader.read_c_string(name.address)?,
            })
        })
        .collect()
}

/// The layout-related entries of a value witness table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeLayout {
    pub size: usize,
    pub stride: usize,
    pub flags: ValueWitnessFlags,
    pub extra_inhabitants: u32,
}

impl TypeLayout {
    pub fn read_table<R: MemoryReader + ?Sized>(reader: &R, table: Address) -> BuilderResult<Self> {
        let w = reader.pointer_size();
        Ok(Self {
            size: reader.read_word(table + ValueWitness::Size.offset(w))? as usize,
            stride: reader.read_word(table + ValueWitness::Stride.offset(w))? as usize,
            flags: ValueWitnessFlags(reader.read_u32(table + ValueWitness::Flags.offset(w))?),
            extra_inhabitants: reader
                .read_u32(table + ValueWitness::ExtraInhabitantCount.offset(w))?,
        })
    }

    /// Layout of the type described by `metadata`, read through its value witness table.
    pub fn read_metadata<R: MemoryReader + ?Sized>(
        reader: &R,
        metadata: Buffer<Metadata>,
    ) -> BuilderResult<Self> {
        let table = value_witnesses_of(reader, metadata)?;
        Self::read_table(reader, table)
    }

    pub fn alignment(&self) -> usize {
        self.flags.alignment()
    }
}

/// The value witness table pointer stored one word before a logical record.
pub fn value_witnesses_of<R: MemoryReader + ?Sized>(
    reader: &R,
    metadata: Buffer<Metadata>,
) -> BuilderResult<Address> {
    let w = reader.pointer_size();
    Ok(Address(reader.read_word(metadata.address - w)?))
}
