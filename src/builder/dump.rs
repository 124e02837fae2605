use super::{value_witnesses_of, DescriptorInfo};
use crate::{
    abi::{record, Metadata, MetadataKind, ValueWitness, ValueWitnessFlags},
    buffer::Buffer,
    error::BuilderResult,
    reader_writer::MemoryReader,
    symbols::SymbolInfo,
    utils::{hex_words, Address},
};
use std::fmt::{self, Display, Formatter};

/// A human-readable snapshot of a metadata record, for diagnostics.
#[derive(Debug, Clone)]
pub struct MetadataDump {
    pub record: Address,
    pub kind: u64,
    pub descriptor: Address,
    pub descriptor_symbol: SymbolInfo,
    pub name: Option<String>,
    pub value_witnesses: Address,
    pub witnesses: Vec<(ValueWitness, u64, Option<SymbolInfo>)>,
    pub arguments: Vec<(Address, SymbolInfo)>,
    pub extra_data: Vec<u8>,
    word_size: usize,
}

impl MetadataDump {
    /// Reads the record at `record`, `record_size` bytes long from the logical record.
    pub fn collect<R: MemoryReader + ?Sized>(
        reader: &R,
        record: Buffer<Metadata>,
        record_size: usize,
    ) -> BuilderResult<Self> {
        let w = reader.pointer_size();
        let kind = reader.read_word(record.address + record::KIND)?;
        let descriptor = Address(reader.read_word(record.address + record::descriptor(w))?);

        let value_witnesses = value_witnesses_of(reader, record)?;
        let flags = ValueWitnessFlags(
            reader.read_u32(value_witnesses + ValueWitness::Flags.offset(w))?,
        );
        let mut witnesses = vec![];
        for witness in ValueWitness::schema(flags.has_enum_witnesses()) {
            let at = value_witnesses + witness.offset(w);
            let value = if witness.width(w) == 4 {
                reader.read_u32(at)? as u64
            } else {
                reader.read_word(at)?
            };
            let symbol = witness
                .is_function()
                .then(|| reader.get_symbol_info(Address(value)));
            witnesses.push((*witness, value, symbol));
        }

        // A descriptor that cannot be read still leaves the rest of the record worth printing.
        let info = DescriptorInfo::read(reader, Buffer::new(descriptor)).ok();
        let mut arguments = vec![];
        if let Some(info) = &info {
            let start = record.address + info.generic_argument_offset as usize * w;
            for i in 0..info.num_key_arguments as usize {
                let argument = Address(reader.read_word(start + i * w)?);
                arguments.push((argument, reader.get_symbol_info(argument)));
            }
        }

        let extra_start = record::extra_data_start(w);
        let mut extra_data = vec![0u8; record_size.saturating_sub(extra_start)];
        reader.read_bytes(record.address + extra_start, &mut extra_data)?;

        Ok(Self {
            record: record.address,
            kind,
            descriptor,
            descriptor_symbol: reader.get_symbol_info(descriptor),
            name: info.map(|info| info.name),
            value_witnesses,
            witnesses,
            arguments,
            extra_data,
            word_size: w,
        })
    }
}

impl Display for MetadataDump {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match MetadataKind::from_raw(self.kind) {
            Some(kind) => writeln!(f, "{kind} metadata at {}", self.record)?,
            None => writeln!(f, "metadata of kind {:#x} at {}", self.kind, self.record)?,
        }
        writeln!(
            f,
            "  descriptor: {} {}, {}",
            self.descriptor,
            self.name.as_deref().unwrap_or("?"),
            self.descriptor_symbol
        )?;
        writeln!(f, "  value witnesses: {}", self.value_witnesses)?;
        for (witness, value, symbol) in &self.witnesses {
            match symbol {
                Some(symbol) => writeln!(f, "    {witness}: {value:#x} {symbol}")?,
                None => writeln!(f, "    {witness}: {value:#x}")?,
            }
        }
        for (i, (argument, symbol)) in self.arguments.iter().enumerate() {
            writeln!(f, "  argument {i}: {argument} {symbol}")?;
        }
        write!(
            f,
            "  extra data: {}",
            hex_words(&self.extra_data, self.word_size)
        )
    }
}
