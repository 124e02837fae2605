use super::{
    read_field_records, value_witnesses_of, BuiltMetadata, DescriptorInfo, GenericMetadataBuilder,
    TypeLayout,
};
use crate::{
    abi::{record, Metadata, ValueWitness, ValueWitnessFlags, ValueWitnessTable},
    buffer::Buffer,
    error::{BuilderError, BuilderResult},
    memory::AllocationTag,
    pointer::FunctionPointerKind,
    reader_writer::ReaderWriter,
    utils::{align_up, Address},
    witnesses::builtin_integer_symbol,
};

/// Layout computed for an incomplete record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ComputedLayout {
    size: usize,
    alignment: usize,
    pod: bool,
    bitwise_takable: bool,
    extra_inhabitants: u32,
}

impl ComputedLayout {
    fn empty() -> Self {
        Self {
            size: 0,
            alignment: 1,
            pod: true,
            bitwise_takable: true,
            extra_inhabitants: 0,
        }
    }

    fn absorb(&mut self, field: &TypeLayout) {
        self.alignment = self.alignment.max(field.alignment());
        self.pod &= field.flags.is_pod();
        self.bitwise_takable &= field.flags.is_bitwise_takable();
    }

    fn stride(&self) -> usize {
        align_up(self.size, self.alignment).max(1)
    }
}

/// Bytes needed to tell `cases` cases apart with an explicit tag.
fn tag_bytes(cases: usize) -> usize {
    match cases {
        0..=1 => 0,
        2..=256 => 1,
        257..=65536 => 2,
        _ => 4,
    }
}

impl<R: ReaderWriter> GenericMetadataBuilder<R> {
    /// Completes a freshly built record. Records whose value witness template is not marked
    /// incomplete only need marking as initialized; the others get their field layout computed
    /// and a value witness table of their own.
    ///
    /// On failure the record is consumed and its allocation must not be reused.
    pub fn initialize_generic_metadata(
        &mut self,
        metadata: BuiltMetadata,
    ) -> BuilderResult<BuiltMetadata> {
        if metadata.initialized {
            return Ok(metadata);
        }
        let record = metadata.record();
        self.initialize(metadata).map_err(|e| {
            builder_log!(self, "initializing {} failed: {e}", record.address);
            e.into_initialization_failure()
        })
    }

    fn initialize(&mut self, mut metadata: BuiltMetadata) -> BuilderResult<BuiltMetadata> {
        let rw = &self.reader_writer;
        let w = rw.pointer_size();
        let record = metadata.record();
        let template = value_witnesses_of(rw, record)?;
        let template_layout = TypeLayout::read_table(rw, template)?;
        if !template_layout.flags.is_incomplete() {
            builder_log!(self, "{} needs no initialization", record.address);
            metadata.initialized = true;
            return Ok(metadata);
        }

        let descriptor = Buffer::new(Address(
            rw.read_word(record.address + record::descriptor(w))?,
        ));
        let info = DescriptorInfo::read(rw, descriptor)?;
        let layout = if info.is_enum() {
            self.enum_layout(&mut metadata, &info)?
        } else {
            self.struct_layout(&mut metadata, &info)?
        };
        builder_log!(
            self,
            "{} at {}: size {}, alignment {}, {} extra inhabitants",
            info.name,
            record.address,
            layout.size,
            layout.alignment,
            layout.extra_inhabitants
        );

        let table = self.complete_value_witnesses(
            template,
            template_layout.flags,
            &layout,
            info.is_enum(),
        )?;
        self.reader_writer
            .write_pointer(&mut metadata.region, record::VALUE_WITNESSES, table);
        metadata.initialized = true;
        Ok(metadata)
    }

    /// Resolves a field's type in the context of `record` and reads its layout.
    fn field_layout(
        &self,
        record: Buffer<Metadata>,
        field: &str,
        type_name: Option<&str>,
    ) -> BuilderResult<TypeLayout> {
        let type_name = type_name.ok_or_else(|| {
            BuilderError::invalid_pattern(format!("field {field} has no type name"))
        })?;
        let field_type = self
            .reader_writer
            .get_type_by_mangled_name(record, type_name)?;
        TypeLayout::read_metadata(&self.reader_writer, field_type)
    }

    fn struct_layout(
        &mut self,
        metadata: &mut BuiltMetadata,
        info: &DescriptorInfo,
    ) -> BuilderResult<ComputedLayout> {
        let record = metadata.record();
        let fields = read_field_records(&self.reader_writer, info.fields)?;
        if fields.len() != info.num_fields() {
            return Err(BuilderError::invalid_pattern(format!(
                "{} declares {} fields but describes {}",
                info.name,
                info.num_fields(),
                fields.len()
            )));
        }

        let mut layout = ComputedLayout::empty();
        let mut offsets = Vec::with_capacity(fields.len());
        for field in &fields {
            let field_layout =
                self.field_layout(record, &field.name, field.mangled_type_name.as_deref())?;
            let offset = align_up(layout.size, field_layout.alignment());
            builder_trace!(self, "field {} at offset {offset}", field.name);
            offsets.push(offset);
            layout.size = offset + field_layout.size;
            layout.absorb(&field_layout);
            layout.extra_inhabitants = layout.extra_inhabitants.max(field_layout.extra_inhabitants);
        }

        let vector = info.field_offset_vector_offset();
        if vector != 0 {
            let w = self.reader_writer.pointer_size();
            let start = metadata.record_offset + vector * w;
            if start + offsets.len() * 4 > metadata.region.size() {
                return Err(BuilderError::invalid_pattern(format!(
                    "field offset vector of {} at word {vector} does not fit in a {} byte record",
                    info.name,
                    metadata.record_size()
                )));
            }
            for (i, offset) in offsets.iter().enumerate() {
                let offset = u32::try_from(*offset).map_err(|_| {
                    BuilderError::invalid_pattern(format!("field offset {offset} overflows"))
                })?;
                self.reader_writer
                    .write_bytes(&mut metadata.region, start + i * 4, &offset.to_le_bytes());
            }
        }
        Ok(layout)
    }

    fn enum_layout(
        &mut self,
        metadata: &mut BuiltMetadata,
        info: &DescriptorInfo,
    ) -> BuilderResult<ComputedLayout> {
        let record = metadata.record();
        let fields = read_field_records(&self.reader_writer, info.fields)?;
        let payload_cases = info.num_payload_cases();
        let empty_cases = info.num_empty_cases();
        if fields.len() < payload_cases {
            return Err(BuilderError::invalid_pattern(format!(
                "{} declares {payload_cases} payload cases but describes {}",
                info.name,
                fields.len()
            )));
        }

        let mut layout = ComputedLayout::empty();
        let mut payload_extra_inhabitants = 0;
        for case in &fields[..payload_cases] {
            let payload = self.field_layout(record, &case.name, case.mangled_type_name.as_deref())?;
            layout.size = layout.size.max(payload.size);
            layout.absorb(&payload);
            payload_extra_inhabitants = payload.extra_inhabitants;
        }
        let payload_size = layout.size;

        if payload_cases == 1 && empty_cases <= payload_extra_inhabitants as usize {
            layout.extra_inhabitants = payload_extra_inhabitants - empty_cases as u32;
        } else {
            layout.size += tag_bytes(payload_cases + empty_cases);
        }

        let payload_size_offset = info.payload_size_offset();
        if payload_size_offset != 0 {
            let w = self.reader_writer.pointer_size();
            let offset = metadata.record_offset + payload_size_offset * w;
            if offset + w > metadata.region.size() {
                return Err(BuilderError::invalid_pattern(format!(
                    "payload size of {} at word {} does not fit in a {} byte record",
                    info.name,
                    payload_size_offset,
                    metadata.record_size()
                )));
            }
            self.reader_writer
                .write_word(&mut metadata.region, offset, payload_size as u64);
        }
        Ok(layout)
    }

    /// Allocates the value witness table for a completed layout. Function entries come from
    /// the template, or from the builtin integer table when the layout is a plain integer.
    fn complete_value_witnesses(
        &mut self,
        template: Address,
        template_flags: ValueWitnessFlags,
        layout: &ComputedLayout,
        is_enum: bool,
    ) -> BuilderResult<Address> {
        let w = self.reader_writer.pointer_size();
        let builtin = match builtin_integer_symbol(layout.size) {
            Some(symbol) if layout.pod && layout.alignment == layout.size => {
                match self.reader_writer.get_symbol_pointer::<ValueWitnessTable>(&symbol) {
                    Ok(table) => Some(table.address),
                    Err(BuilderError::SymbolNotFound(_)) => {
                        builder_log!(self, "{symbol} not found, keeping template witnesses");
                        None
                    }
                    Err(e) => return Err(e),
                }
            }
            _ => None,
        };

        let flags = template_flags
            .with_alignment(layout.alignment)
            .with_pod(layout.pod)
            .with_bitwise_takable(layout.bitwise_takable)
            .with_inline_storage(
                layout.size <= 3 * w && layout.alignment <= w && layout.bitwise_takable,
            )
            .with_enum_witnesses(is_enum)
            .with_incomplete(false);

        let size = ValueWitness::table_size(w, is_enum);
        let mut table = self
            .reader_writer
            .allocate(size, AllocationTag::ValueWitnessTable)?;
        for witness in ValueWitness::schema(is_enum) {
            let offset = witness.offset(w);
            match witness {
                ValueWitness::Size => {
                    self.reader_writer
                        .write_word(&mut table, offset, layout.size as u64)
                }
                ValueWitness::Stride => {
                    self.reader_writer
                        .write_word(&mut table, offset, layout.stride() as u64)
                }
                ValueWitness::Flags => {
                    self.reader_writer
                        .write_bytes(&mut table, offset, &flags.0.to_le_bytes())
                }
                ValueWitness::ExtraInhabitantCount => self.reader_writer.write_bytes(
                    &mut table,
                    offset,
                    &layout.extra_inhabitants.to_le_bytes(),
                ),
                function => {
                    let source = match builtin {
                        Some(builtin) if offset < ValueWitness::Size.offset(w) => builtin,
                        _ => template,
                    };
                    let entry = self
                        .reader_writer
                        .resolve_function_pointer(source + offset, FunctionPointerKind::Absolute)?;
                    builder_trace!(self, "{function} -> {}", entry.address);
                    self.reader_writer
                        .write_function_pointer(&mut table, offset, entry);
                }
            }
        }
        Ok(table.base())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_bytes() {
        assert_eq!(tag_bytes(0), 0);
        assert_eq!(tag_bytes(1), 0);
        assert_eq!(tag_bytes(2), 1);
        assert_eq!(tag_bytes(256), 1);
        assert_eq!(tag_bytes(257), 2);
        assert_eq!(tag_bytes(65537), 4);
    }

    #[test]
    fn test_computed_stride() {
        let mut layout = ComputedLayout::empty();
        assert_eq!(layout.stride(), 1);
        layout.size = 9;
        layout.alignment = 8;
        assert_eq!(layout.stride(), 16);
    }
}
