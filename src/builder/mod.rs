//! Construction of generic value metadata records from a descriptor, its metadata pattern and
//! a list of generic arguments.
//!
//! A record is built in two steps. [`GenericMetadataBuilder::build_generic_value_metadata`]
//! allocates the record, installs the fixed header and runs the pattern's field instructions
//! in order. [`GenericMetadataBuilder::initialize_generic_metadata`] then computes whatever
//! needs the populated record, such as field offsets and a completed value witness table.
//!
//! The builder only talks to memory through a [`ReaderWriter`], so the same code builds
//! records in the current process and inside a snapshot of another one.
use crate::{
    abi::{
        record, DescriptorKind, Metadata, MetadataPattern, TypeDescriptor, ValueWitness,
        ValueWitnessFlags,
    },
    buffer::{Buffer, WritableRegion},
    config::BuilderConfig,
    error::{BuilderError, BuilderResult},
    memory::AllocationTag,
    reader_writer::ReaderWriter,
    utils::{align_up, Address},
};

mod dump;
mod initialize;
mod instructions;
mod records;

pub use dump::MetadataDump;
pub use instructions::{
    decode_instruction, CallInstantiationFunction, CopyConstant, CopyGenericArgument,
    FieldInstruction, Instruction, NestedTypeLookup, ReserveComputed, WriteWitnessTableSlot,
};
pub use records::{
    read_field_records, value_witnesses_of, DescriptorInfo, FieldRecord, PatternInfo, TypeLayout,
};

/// A record produced by the builder, together with the allocation that holds it.
#[derive(Debug)]
pub struct BuiltMetadata {
    region: WritableRegion,
    record_offset: usize,
    extra_data_size: usize,
    is_enum: bool,
    initialized: bool,
}

impl BuiltMetadata {
    /// The logical record, as handed to callbacks and stored in generic arguments.
    pub fn record(&self) -> Buffer<Metadata> {
        Buffer::new(self.region.base() + self.record_offset)
    }

    /// Start of the allocation, which holds the value witness table word.
    pub fn base(&self) -> Address {
        self.region.base()
    }

    pub fn record_offset(&self) -> usize {
        self.record_offset
    }

    pub fn total_size(&self) -> usize {
        self.region.size()
    }

    /// Bytes from the logical record to the end of the allocation.
    pub fn record_size(&self) -> usize {
        self.region.size() - self.record_offset
    }

    pub fn extra_data_size(&self) -> usize {
        self.extra_data_size
    }

    pub fn is_enum(&self) -> bool {
        self.is_enum
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }
}

pub struct GenericMetadataBuilder<R> {
    reader_writer: R,
    config: BuilderConfig,
}

impl<R: ReaderWriter> GenericMetadataBuilder<R> {
    pub fn new(reader_writer: R) -> Self {
        let config = *reader_writer.config();
        Self {
            reader_writer,
            config,
        }
    }

    pub fn config(&self) -> &BuilderConfig {
        &self.config
    }

    pub fn reader_writer(&self) -> &R {
        &self.reader_writer
    }

    pub fn reader_writer_mut(&mut self) -> &mut R {
        &mut self.reader_writer
    }

    pub fn into_reader_writer(self) -> R {
        self.reader_writer
    }

    /// Number of bytes the pattern's instructions write past the fixed header.
    pub fn extra_data_size(
        &mut self,
        descriptor: Buffer<TypeDescriptor>,
        pattern: Buffer<MetadataPattern>,
    ) -> BuilderResult<usize> {
        let pattern_info = PatternInfo::read(&self.reader_writer, pattern)?;
        let widths = self.instruction_widths(descriptor, &pattern_info)?;
        let size = widths.iter().sum();
        builder_log!(
            self,
            "extra data for {} with pattern {}: {size} bytes in {} instructions",
            descriptor.address,
            pattern.address,
            widths.len()
        );
        Ok(size)
    }

    /// Width of every instruction, checking that they tile the extra data contiguously.
    fn instruction_widths(
        &mut self,
        descriptor: Buffer<TypeDescriptor>,
        pattern: &PatternInfo,
    ) -> BuilderResult<Vec<usize>> {
        let w = self.reader_writer.pointer_size();
        let mut cursor = record::extra_data_start(w);
        let mut widths = Vec::with_capacity(pattern.instructions.len());

        for (i, instruction) in pattern.instructions.iter().enumerate() {
            if instruction.target() != cursor {
                return Err(BuilderError::invalid_pattern(format!(
                    "instruction {i} targets {:#x}, expected {cursor:#x}",
                    instruction.target()
                )));
            }
            if instruction.is_pointer_valued() && instruction.target() % w != 0 {
                return Err(BuilderError::invalid_pattern(format!(
                    "instruction {i} writes a pointer at unaligned offset {:#x}",
                    instruction.target()
                )));
            }
            let width = match (instruction.static_width(w), instruction) {
                (Some(width), _) => width,
                (None, FieldInstruction::ReserveComputed(reserve)) => {
                    let size = self.reader_writer.call_size_function(
                        reserve.function,
                        descriptor,
                        pattern.address,
                    )?;
                    align_up(size, w)
                }
                (None, other) => {
                    return Err(BuilderError::invalid_pattern(format!(
                        "instruction {i} ({other}) has no width"
                    )))
                }
            };
            builder_trace!(self, "instruction {i}: {instruction} ({width} bytes)");
            cursor += width;
            widths.push(width);
        }
        Ok(widths)
    }

    /// Rejects descriptor and pattern combinations the builder cannot lay out. Runs before
    /// anything is allocated.
    fn check_kinds(
        &self,
        descriptor: &DescriptorInfo,
        pattern: &PatternInfo,
        arguments: &[Address],
    ) -> BuilderResult<()> {
        let is_enum = match descriptor.kind() {
            DescriptorKind::Struct => false,
            DescriptorKind::Enum => true,
            other => {
                return Err(BuilderError::invalid_pattern(format!(
                    "{} has descriptor kind {other:?}, not a value type",
                    descriptor.name
                )))
            }
        };
        if !descriptor.flags.is_generic() {
            return Err(BuilderError::invalid_pattern(format!(
                "{} is not generic",
                descriptor.name
            )));
        }
        if pattern.kind.is_enum() != is_enum {
            return Err(BuilderError::invalid_pattern(format!(
                "pattern kind {} does not match descriptor {}",
                pattern.kind, descriptor.name
            )));
        }

        let w = self.reader_writer.pointer_size();
        let flags = ValueWitnessFlags(self.reader_writer.read_u32(
            pattern.value_witnesses + ValueWitness::Flags.offset(w),
        )?);
        if flags.has_enum_witnesses() != is_enum {
            return Err(BuilderError::invalid_pattern(format!(
                "value witness template of {} has the wrong schema",
                descriptor.name
            )));
        }

        if arguments.len() < descriptor.num_key_arguments as usize {
            return Err(BuilderError::invalid_pattern(format!(
                "{} needs {} generic arguments, got {}",
                descriptor.name,
                descriptor.num_key_arguments,
                arguments.len()
            )));
        }
        for instruction in &pattern.instructions {
            if let FieldInstruction::CopyGenericArgument(copy) = instruction {
                if copy.index >= arguments.len() {
                    return Err(BuilderError::invalid_pattern(format!(
                        "generic argument {} out of range for {} arguments",
                        copy.index,
                        arguments.len()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Allocates a record for `descriptor` instantiated with `arguments` and fills it in by
    /// running the pattern.
    ///
    /// # Panics
    /// If the instructions do not write exactly `extra_data_size` bytes past the fixed header.
    pub fn build_generic_value_metadata(
        &mut self,
        descriptor: Buffer<TypeDescriptor>,
        arguments: &[Address],
        pattern: Buffer<MetadataPattern>,
        extra_data_size: usize,
    ) -> BuilderResult<BuiltMetadata> {
        let descriptor_info = DescriptorInfo::read(&self.reader_writer, descriptor)?;
        let pattern_info = PatternInfo::read(&self.reader_writer, pattern)?;
        self.check_kinds(&descriptor_info, &pattern_info, arguments)?;
        let widths = self.instruction_widths(descriptor, &pattern_info)?;

        let w = self.reader_writer.pointer_size();
        let record_offset = record::record_offset(w);
        let total_size = record::fixed_header_size(w) + extra_data_size;
        builder_log!(
            self,
            "building {} ({}) with {} arguments, {total_size} bytes",
            descriptor_info.name,
            pattern_info.kind,
            arguments.len()
        );

        let rw = &mut self.reader_writer;
        let mut region = rw.allocate(total_size, AllocationTag::GenericValueMetadata)?;
        let record: Buffer<Metadata> = Buffer::new(region.base() + record_offset);

        rw.write_pointer(&mut region, record::VALUE_WITNESSES, pattern_info.value_witnesses);
        rw.write_word(
            &mut region,
            record_offset + record::KIND,
            pattern_info.kind as u32 as u64,
        );
        rw.write_pointer(&mut region, record_offset + record::descriptor(w), descriptor.address);

        for (instruction, width) in pattern_info.instructions.iter().zip(widths) {
            let offset = record_offset + instruction.target();
            match instruction {
                FieldInstruction::CopyConstant(copy) => {
                    let mut bytes = vec![0u8; copy.len];
                    rw.read_bytes(copy.data, &mut bytes)?;
                    rw.write_bytes(&mut region, offset, &bytes);
                }
                FieldInstruction::CopyGenericArgument(copy) => {
                    rw.write_pointer(&mut region, offset, arguments[copy.index]);
                }
                FieldInstruction::CallInstantiationFunction(call) => {
                    let result = rw.call_instantiation_function(call.function, record, arguments)?;
                    rw.write_pointer(&mut region, offset, result);
                }
                FieldInstruction::WriteWitnessTableSlot(slot) => {
                    rw.write_pointer(&mut region, offset, slot.table);
                }
                FieldInstruction::NestedTypeLookup(lookup) => {
                    let name = rw.read_c_string(lookup.name)?;
                    let metadata = rw.get_type_by_mangled_name(record, &name)?;
                    rw.write_pointer(&mut region, offset, metadata.address);
                }
                FieldInstruction::ReserveComputed(_) => {
                    rw.write_bytes(&mut region, offset, &vec![0u8; width]);
                }
            }
        }

        assert_eq!(
            region.bytes_written(),
            total_size,
            "pattern for {} wrote {} bytes into a {total_size} byte record",
            descriptor_info.name,
            region.bytes_written()
        );
        builder_log!(self, "built {} at {}", descriptor_info.name, record.address);

        Ok(BuiltMetadata {
            region,
            record_offset,
            extra_data_size,
            is_enum: descriptor_info.is_enum(),
            initialized: false,
        })
    }
}
