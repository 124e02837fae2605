#![allow(dead_code)]

use genmeta::{
    abi::{descriptor, DescriptorFlags, MetadataKind, ValueWitnessFlags},
    buffer::Buffer,
    builder::DescriptorInfo,
    image::{DescriptorLayout, ImageBuilder, InstructionLayout, LoadedImage},
    lookup::TypeRegistry,
    memory::{snapshot::MemorySnapshot, MetadataAllocator},
    symbols::SymbolTable,
    utils::{align_up, Address},
    BuilderConfig, BuilderResult, BuiltMetadata, GenericMetadataBuilder, InProcessReaderWriter,
    MemoryReader, ReaderWriter, SnapshotReaderWriter, Verbosity,
};
use std::mem::size_of;

pub const WORD: usize = size_of::<usize>();

/// What the `Pair` size callback asks to reserve.
pub const PAIR_EXTRA_SIZE: usize = 12;

pub const TAG: &[u8] = b"MAYBETAG";

const TEMPLATE_WITNESSES: [&str; 8] = [
    "template_vw0",
    "template_vw1",
    "template_vw2",
    "template_vw3",
    "template_vw4",
    "template_vw5",
    "template_vw6",
    "template_vw7",
];
const ENUM_WITNESSES: [&str; 3] = ["enum_vw0", "enum_vw1", "enum_vw2"];
const BUILTIN_WITNESSES: [&str; 8] = [
    "builtin_vw0",
    "builtin_vw1",
    "builtin_vw2",
    "builtin_vw3",
    "builtin_vw4",
    "builtin_vw5",
    "builtin_vw6",
    "builtin_vw7",
];

fn at(words: usize, w: usize) -> u32 {
    (words * w) as u32
}

/// Offset of the `Pair` word filled by the instantiation callback.
pub fn pair_instantiated_offset(w: usize) -> usize {
    5 * w + 8 + align_up(PAIR_EXTRA_SIZE, w)
}

/// Static metadata for a handful of value types:
///
/// * `Int` (`Si`) and `Bool` (`Sb`), non-generic, Bool with 254 extra inhabitants
/// * `struct Box<T> { value: T }`
/// * `struct Orphan<T> { value: Missing }`, where `Missing` is never registered
/// * `struct Pair<A, B> { first: A, second: B }`, whose pattern uses every non-enum instruction
/// * `enum Maybe<T> { some(T), none }`, an optional with a conformance slot and a tag word
/// * `class Object<T>`, which the builder must refuse
///
/// A `standalone` image also defines everything a snapshot cannot borrow from this process:
/// the callbacks, the builtin integer tables, and a reference `Maybe<Bool>` record laid out
/// the way the builder should produce it.
pub fn value_types(w: usize, standalone: bool) -> ImageBuilder {
    let mut image = ImageBuilder::new("value_types", w);
    for name in TEMPLATE_WITNESSES.iter().chain(ENUM_WITNESSES.iter()) {
        image.align(4).label(name).zeros(4);
    }
    if standalone {
        for name in BUILTIN_WITNESSES.iter() {
            image.align(4).label(name).zeros(4);
        }
        image
            .align(4)
            .label("pair_extra_size")
            .zeros(4)
            .label("pair_instantiate")
            .zeros(4)
            .value_witness_table("$sBi8_WV", &BUILTIN_WITNESSES, 1, 1, 0, 0)
            .value_witness_table("$sBi64_WV", &BUILTIN_WITNESSES, 8, 8, 7, 0);
    }

    let incomplete = ValueWitnessFlags::default().with_incomplete(true);
    image
        .value_witness_table("struct_template", &TEMPLATE_WITNESSES, 0, 1, incomplete.0, 0)
        .value_witness_table(
            "enum_template",
            &TEMPLATE_WITNESSES,
            0,
            1,
            incomplete.with_enum_witnesses(true).0,
            0,
        )
        .enum_witnesses(&ENUM_WITNESSES)
        .value_witness_table("bool_wv", &TEMPLATE_WITNESSES, 1, 1, 0, 254)
        .align(w)
        .label("maybe_conformance")
        .zeros(2 * w)
        .align(8)
        .label("zeros")
        .zeros(16);

    image
        .c_string("int_name", "Int")
        .c_string("bool_name", "Bool")
        .c_string("box_name", "Box")
        .c_string("pair_name", "Pair")
        .c_string("maybe_name", "Maybe")
        .c_string("object_name", "Object")
        .c_string("orphan_name", "Orphan")
        .c_string("type_missing", "4main7MissingV")
        .c_string("type_x", "x")
        .c_string("type_q_", "q_")
        .c_string("type_box_of_x", "4main3BoxVyxG")
        .c_string("field_value", "value")
        .c_string("field_first", "first")
        .c_string("field_second", "second")
        .c_string("case_some", "some")
        .c_string("case_none", "none")
        .c_string("maybe_tag", "MAYBETAG");

    image
        .type_descriptor(
            "int_descriptor",
            &DescriptorLayout {
                flags: DescriptorFlags::STRUCT,
                name: "int_name",
                ..Default::default()
            },
        )
        .type_descriptor(
            "bool_descriptor",
            &DescriptorLayout {
                flags: DescriptorFlags::STRUCT,
                name: "bool_name",
                ..Default::default()
            },
        )
        .value_metadata("Si", "$sBi64_WV", MetadataKind::Struct, "int_descriptor")
        .value_metadata("Sb", "bool_wv", MetadataKind::Struct, "bool_descriptor");

    image
        .field_descriptor("box_fields", &[(Some("type_x"), "field_value")])
        .field_instructions(
            "box_instructions",
            &[
                InstructionLayout::CopyGenericArgument {
                    target: at(2, w),
                    index: 0,
                },
                InstructionLayout::CopyConstant {
                    target: at(3, w),
                    data: "zeros",
                    len: 8,
                },
            ],
        )
        .metadata_pattern(
            "box_pattern",
            "struct_template",
            Some("box_instructions"),
            2,
            MetadataKind::Struct,
        )
        .type_descriptor(
            "box_descriptor",
            &DescriptorLayout {
                flags: DescriptorFlags::STRUCT | DescriptorFlags::GENERIC,
                name: "box_name",
                pattern: Some("box_pattern"),
                fields: Some("box_fields"),
                kind_word0: 1,
                kind_word1: 3,
                num_params: 1,
                num_key_arguments: 1,
                generic_argument_offset: 2,
            },
        );

    image
        .field_descriptor("orphan_fields", &[(Some("type_missing"), "field_value")])
        .type_descriptor(
            "orphan_descriptor",
            &DescriptorLayout {
                flags: DescriptorFlags::STRUCT | DescriptorFlags::GENERIC,
                name: "orphan_name",
                pattern: Some("box_pattern"),
                fields: Some("orphan_fields"),
                kind_word0: 1,
                kind_word1: 3,
                num_params: 1,
                num_key_arguments: 1,
                generic_argument_offset: 2,
            },
        );

    image
        .field_descriptor(
            "pair_fields",
            &[
                (Some("type_x"), "field_first"),
                (Some("type_q_"), "field_second"),
            ],
        )
        .field_instructions(
            "pair_instructions",
            &[
                InstructionLayout::CopyGenericArgument {
                    target: at(2, w),
                    index: 0,
                },
                InstructionLayout::CopyGenericArgument {
                    target: at(3, w),
                    index: 1,
                },
                InstructionLayout::CopyConstant {
                    target: at(4, w),
                    data: "zeros",
                    len: 8,
                },
                InstructionLayout::NestedTypeLookup {
                    target: (4 * w + 8) as u32,
                    name: "type_box_of_x",
                },
                InstructionLayout::ReserveComputed {
                    target: (5 * w + 8) as u32,
                    function: "pair_extra_size",
                },
                InstructionLayout::CallInstantiationFunction {
                    target: pair_instantiated_offset(w) as u32,
                    function: "pair_instantiate",
                },
            ],
        )
        .metadata_pattern(
            "pair_pattern",
            "struct_template",
            Some("pair_instructions"),
            6,
            MetadataKind::Struct,
        )
        .type_descriptor(
            "pair_descriptor",
            &DescriptorLayout {
                flags: DescriptorFlags::STRUCT | DescriptorFlags::GENERIC,
                name: "pair_name",
                pattern: Some("pair_pattern"),
                fields: Some("pair_fields"),
                kind_word0: 2,
                kind_word1: 4,
                num_params: 2,
                num_key_arguments: 2,
                generic_argument_offset: 2,
            },
        );

    image
        .field_descriptor(
            "maybe_fields",
            &[(Some("type_x"), "case_some"), (None, "case_none")],
        )
        .field_instructions(
            "maybe_instructions",
            &[
                InstructionLayout::CopyGenericArgument {
                    target: at(2, w),
                    index: 0,
                },
                InstructionLayout::CopyConstant {
                    target: at(3, w),
                    data: "zeros",
                    len: w as u16,
                },
                InstructionLayout::WriteWitnessTableSlot {
                    target: at(4, w),
                    table: "maybe_conformance",
                },
                InstructionLayout::CopyConstant {
                    target: at(5, w),
                    data: "maybe_tag",
                    len: w as u16,
                },
            ],
        )
        .metadata_pattern(
            "maybe_pattern",
            "enum_template",
            Some("maybe_instructions"),
            4,
            MetadataKind::Optional,
        )
        .type_descriptor(
            "maybe_descriptor",
            &DescriptorLayout {
                flags: DescriptorFlags::ENUM | DescriptorFlags::GENERIC,
                name: "maybe_name",
                pattern: Some("maybe_pattern"),
                fields: Some("maybe_fields"),
                kind_word0: 1 | (3 << descriptor::PAYLOAD_SIZE_OFFSET_SHIFT),
                kind_word1: 1,
                num_params: 1,
                num_key_arguments: 1,
                generic_argument_offset: 2,
            },
        )
        .type_descriptor(
            "object_descriptor",
            &DescriptorLayout {
                flags: DescriptorFlags::CLASS | DescriptorFlags::GENERIC,
                name: "object_name",
                pattern: Some("box_pattern"),
                num_params: 1,
                num_key_arguments: 1,
                generic_argument_offset: 2,
                ..Default::default()
            },
        );

    if standalone {
        image
            .value_witness_table(
                "expected_maybe_bool_wv",
                &BUILTIN_WITNESSES,
                1,
                1,
                ValueWitnessFlags::default().with_enum_witnesses(true).0,
                253,
            )
            .enum_witnesses(&ENUM_WITNESSES)
            .value_metadata(
                "expected_maybe_bool",
                "expected_maybe_bool_wv",
                MetadataKind::Optional,
                "maybe_descriptor",
            )
            .absolute("Sb")
            .word(1)
            .absolute("maybe_conformance")
            .bytes(&TAG[..w]);
    }
    image
}

extern "C" fn pair_extra_size(_descriptor: *const u8, _pattern: *const u8) -> usize {
    PAIR_EXTRA_SIZE
}

extern "C" fn pair_instantiate(_record: *const u8, arguments: *const *const u8) -> *const u8 {
    // SAFETY: the builder passes the record's argument array, which is never empty for Pair.
    unsafe { *arguments }
}

/// The value types loaded into this process, with everything a reader/writer shares.
pub struct InProcess {
    pub allocator: MetadataAllocator,
    pub symbols: SymbolTable,
    pub types: TypeRegistry,
    pub image: LoadedImage,
}

impl InProcess {
    pub fn load() -> Self {
        Self::with_parts(SymbolTable::with_builtins(), MetadataAllocator::new())
    }

    pub fn with_parts(symbols: SymbolTable, allocator: MetadataAllocator) -> Self {
        symbols.register(
            "pair_extra_size",
            Address::from_ptr(pair_extra_size as *const ()),
        );
        symbols.register(
            "pair_instantiate",
            Address::from_ptr(pair_instantiate as *const ()),
        );
        let image = value_types(WORD, false).load_in_process(&symbols).unwrap();
        let types = TypeRegistry::new();
        types.register_type("Si", image.symbol("Si").unwrap());
        types.register_type("Sb", image.symbol("Sb").unwrap());
        Self {
            allocator,
            symbols,
            types,
            image,
        }
    }

    pub fn address(&self, name: &str) -> Address {
        self.image.symbol(name).unwrap()
    }

    pub fn reader_writer(&self, config: BuilderConfig) -> InProcessReaderWriter<'_> {
        // SAFETY: the image is linked into a static arena and both callbacks are `extern "C"`
        // functions with the signatures the builder calls them with.
        unsafe { InProcessReaderWriter::new(&self.allocator, &self.symbols, &self.types, config) }
    }

    pub fn builder(&self) -> GenericMetadataBuilder<InProcessReaderWriter<'_>> {
        GenericMetadataBuilder::new(self.reader_writer(BuilderConfig::new(Verbosity::Verbose)))
    }
}

/// A snapshot holding the standalone value types, with `Int` and `Bool` in its type table.
pub fn snapshot() -> (MemorySnapshot, LoadedImage) {
    let mut snapshot = MemorySnapshot::new();
    let image = value_types(snapshot.pointer_size, true)
        .load_into_snapshot(&mut snapshot)
        .unwrap();
    snapshot.add_type("Si", image.symbol("Si").unwrap());
    snapshot.add_type("Sb", image.symbol("Sb").unwrap());
    (snapshot, image)
}

pub fn snapshot_builder(
    snapshot: MemorySnapshot,
    config: BuilderConfig,
) -> GenericMetadataBuilder<SnapshotReaderWriter> {
    let mut reader_writer = SnapshotReaderWriter::new(snapshot, config);
    reader_writer
        .register_size_function("pair_extra_size", Box::new(|_, _, _| Ok(PAIR_EXTRA_SIZE)));
    reader_writer.register_instantiation_function(
        "pair_instantiate",
        Box::new(|_, _, arguments: &[Address]| Ok(arguments[0])),
    );
    GenericMetadataBuilder::new(reader_writer)
}

/// Builds and initializes the instantiation of `descriptor` for `arguments`.
pub fn build<R: ReaderWriter>(
    builder: &mut GenericMetadataBuilder<R>,
    descriptor: Address,
    arguments: &[Address],
) -> BuilderResult<BuiltMetadata> {
    let descriptor = Buffer::new(descriptor);
    let info = DescriptorInfo::read(builder.reader_writer(), descriptor)?;
    let extra_data_size = builder.extra_data_size(descriptor, info.pattern)?;
    let built =
        builder.build_generic_value_metadata(descriptor, arguments, info.pattern, extra_data_size)?;
    builder.initialize_generic_metadata(built)
}

/// The `record_size` bytes of a built record, starting at the logical record.
pub fn record_bytes<R: ReaderWriter>(reader: &R, built: &BuiltMetadata) -> Vec<u8> {
    let mut bytes = vec![0u8; built.record_size()];
    reader
        .read_bytes(built.record().address, &mut bytes)
        .unwrap();
    bytes
}
