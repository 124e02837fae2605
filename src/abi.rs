//! Binary layout of type descriptors, metadata patterns, metadata records and value witness
//! tables. Offsets that depend on the pointer size take it as `w`.
use crate::pointer::{FunctionPointerKind, PointerField, PointerKind};
use std::fmt::{self, Display, Formatter};

/// Marker for a static type descriptor.
pub enum TypeDescriptor {}
/// Marker for a metadata pattern.
pub enum MetadataPattern {}
/// Marker for a field descriptor.
pub enum FieldDescriptor {}
/// Marker for a logical metadata record (the address just past the value witness table word).
pub enum Metadata {}

/// Record kinds this builder produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MetadataKind {
    Struct = 0x200,
    Enum = 0x201,
    Optional = 0x202,
}

impl MetadataKind {
    pub fn from_raw(raw: u64) -> Option<Self> {
        match raw {
            0x200 => Some(Self::Struct),
            0x201 => Some(Self::Enum),
            0x202 => Some(Self::Optional),
            _ => None,
        }
    }

    pub fn is_enum(self) -> bool {
        matches!(self, Self::Enum | Self::Optional)
    }
}

impl Display for MetadataKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Struct => "struct",
            Self::Enum => "enum",
            Self::Optional => "optional",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorKind {
    Class,
    Struct,
    Enum,
    Other(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorFlags(pub u32);

impl DescriptorFlags {
    pub const KIND_MASK: u32 = 0x1F;
    pub const GENERIC: u32 = 0x80;

    pub const CLASS: u32 = 16;
    pub const STRUCT: u32 = 17;
    pub const ENUM: u32 = 18;

    pub fn kind(self) -> DescriptorKind {
        match self.0 & Self::KIND_MASK {
            Self::CLASS => DescriptorKind::Class,
            Self::STRUCT => DescriptorKind::Struct,
            Self::ENUM => DescriptorKind::Enum,
            other => DescriptorKind::Other(other as u8),
        }
    }

    pub fn is_generic(self) -> bool {
        self.0 & Self::GENERIC != 0
    }
}

/// Header of a value metadata allocation. The allocation starts with the value witness table
/// word; the logical record begins one word later.
pub mod record {
    pub const VALUE_WITNESSES: usize = 0;

    pub fn record_offset(w: usize) -> usize {
        w
    }

    pub fn fixed_header_size(w: usize) -> usize {
        3 * w
    }

    /// Offsets below are relative to the logical record.
    pub const KIND: usize = 0;

    pub fn descriptor(w: usize) -> usize {
        w
    }

    /// First byte instructions may write.
    pub fn extra_data_start(w: usize) -> usize {
        2 * w
    }
}

pub mod descriptor {
    use super::*;

    pub const FLAGS: usize = 0;
    pub const NAME: PointerField = PointerField::new(4, PointerKind::RELATIVE);
    pub const PATTERN: PointerField = PointerField::new(8, PointerKind::RELATIVE_NULLABLE);
    pub const FIELDS: PointerField = PointerField::new(12, PointerKind::RELATIVE_NULLABLE);
    /// Struct: number of fields. Enum: payload case count and payload size offset.
    pub const NUM_FIELDS: usize = 16;
    /// Struct: field offset vector offset in words. Enum: number of empty cases.
    pub const FIELD_OFFSET_VECTOR: usize = 20;
    pub const NUM_PARAMS: usize = 24;
    pub const NUM_KEY_ARGUMENTS: usize = 26;
    pub const GENERIC_ARGUMENT_OFFSET: usize = 28;
    pub const SIZE: usize = 32;

    pub const PAYLOAD_CASES_MASK: u32 = 0x00FF_FFFF;
    pub const PAYLOAD_SIZE_OFFSET_SHIFT: u32 = 24;
}

pub mod field_descriptor {
    use super::*;

    pub const NUM_RECORDS: usize = 0;
    pub const RECORD_SIZE: usize = 2;
    pub const HEADER_SIZE: usize = 4;

    /// Each record starts with a flags word the builder ignores.
    pub const RECORD_STRIDE: usize = 12;
    pub const MANGLED_TYPE_NAME: PointerField =
        PointerField::new(4, PointerKind::RELATIVE_NULLABLE);
    pub const FIELD_NAME: PointerField = PointerField::new(8, PointerKind::RELATIVE);
}

/// A pattern starts with a flags word the builder ignores.
pub mod pattern {
    use super::*;

    pub const VALUE_WITNESSES: PointerField = PointerField::new(4, PointerKind::INDIRECT);
    pub const INSTRUCTIONS: PointerField = PointerField::new(8, PointerKind::RELATIVE_NULLABLE);
    pub const NUM_INSTRUCTIONS: usize = 12;
    pub const METADATA_KIND: usize = 14;
    pub const SIZE: usize = 16;
}

pub mod instruction {
    pub const KIND: usize = 0;
    pub const BYTE_COUNT: usize = 2;
    pub const TARGET: usize = 4;
    pub const ARGUMENT_INDEX: usize = 8;
    pub const OPERAND: usize = 12;
    pub const SIZE: usize = 16;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum InstructionKind {
    CopyConstant = 0,
    CopyGenericArgument = 1,
    CallInstantiationFunction = 2,
    WriteWitnessTableSlot = 3,
    NestedTypeLookup = 4,
    ReserveComputed = 5,
}

impl InstructionKind {
    pub fn from_u8(raw: u8) -> Option<Self> {
        Some(match raw {
            0 => Self::CopyConstant,
            1 => Self::CopyGenericArgument,
            2 => Self::CallInstantiationFunction,
            3 => Self::WriteWitnessTableSlot,
            4 => Self::NestedTypeLookup,
            5 => Self::ReserveComputed,
            _ => return None,
        })
    }

    /// Shape of the operand word, if the kind has one.
    pub fn operand_shape(self) -> Option<OperandShape> {
        match self {
            Self::CopyConstant => Some(OperandShape::Data(PointerKind::RELATIVE)),
            Self::CopyGenericArgument => None,
            Self::CallInstantiationFunction | Self::ReserveComputed => {
                Some(OperandShape::Function(FunctionPointerKind::Compact { nullable: false }))
            }
            Self::WriteWitnessTableSlot => Some(OperandShape::Data(PointerKind::INDIRECT)),
            Self::NestedTypeLookup => Some(OperandShape::Data(PointerKind::RELATIVE)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandShape {
    Data(PointerKind),
    Function(FunctionPointerKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ValueWitnessFlags(pub u32);

impl ValueWitnessFlags {
    pub const ALIGNMENT_MASK: u32 = 0xFF;
    pub const IS_NON_POD: u32 = 0x0001_0000;
    pub const IS_NON_INLINE: u32 = 0x0002_0000;
    pub const HAS_SPARE_BITS: u32 = 0x0008_0000;
    pub const IS_NON_BITWISE_TAKABLE: u32 = 0x0010_0000;
    pub const HAS_ENUM_WITNESSES: u32 = 0x0020_0000;
    pub const INCOMPLETE: u32 = 0x0040_0000;

    pub fn alignment_mask(self) -> usize {
        (self.0 & Self::ALIGNMENT_MASK) as usize
    }

    pub fn alignment(self) -> usize {
        self.alignment_mask() + 1
    }

    pub fn is_pod(self) -> bool {
        self.0 & Self::IS_NON_POD == 0
    }

    pub fn is_bitwise_takable(self) -> bool {
        self.0 & Self::IS_NON_BITWISE_TAKABLE == 0
    }

    pub fn has_enum_witnesses(self) -> bool {
        self.0 & Self::HAS_ENUM_WITNESSES != 0
    }

    pub fn is_incomplete(self) -> bool {
        self.0 & Self::INCOMPLETE != 0
    }

    fn set(self, bit: u32, on: bool) -> Self {
        if on {
            Self(self.0 | bit)
        } else {
            Self(self.0 & !bit)
        }
    }

    pub fn with_alignment(self, alignment: usize) -> Self {
        let mask = (alignment.max(1) - 1) as u32 & Self::ALIGNMENT_MASK;
        Self((self.0 & !Self::ALIGNMENT_MASK) | mask)
    }

    pub fn with_pod(self, pod: bool) -> Self {
        self.set(Self::IS_NON_POD, !pod)
    }

    pub fn with_bitwise_takable(self, takable: bool) -> Self {
        self.set(Self::IS_NON_BITWISE_TAKABLE, !takable)
    }

    pub fn with_inline_storage(self, inline: bool) -> Self {
        self.set(Self::IS_NON_INLINE, !inline)
    }

    pub fn with_enum_witnesses(self, enum_witnesses: bool) -> Self {
        self.set(Self::HAS_ENUM_WITNESSES, enum_witnesses)
    }

    pub fn with_incomplete(self, incomplete: bool) -> Self {
        self.set(Self::INCOMPLETE, incomplete)
    }
}

/// Entries of a value witness table, in layout order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueWitness {
    InitializeBufferWithCopyOfBuffer,
    Destroy,
    InitializeWithCopy,
    AssignWithCopy,
    InitializeWithTake,
    AssignWithTake,
    GetEnumTagSinglePayload,
    StoreEnumTagSinglePayload,
    Size,
    Stride,
    Flags,
    ExtraInhabitantCount,
    GetEnumTag,
    DestructiveProjectEnumData,
    DestructiveInjectEnumTag,
}

pub const BASE_SCHEMA: [ValueWitness; 12] = [
    ValueWitness::InitializeBufferWithCopyOfBuffer,
    ValueWitness::Destroy,
    ValueWitness::InitializeWithCopy,
    ValueWitness::AssignWithCopy,
    ValueWitness::InitializeWithTake,
    ValueWitness::AssignWithTake,
    ValueWitness::GetEnumTagSinglePayload,
    ValueWitness::StoreEnumTagSinglePayload,
    ValueWitness::Size,
    ValueWitness::Stride,
    ValueWitness::Flags,
    ValueWitness::ExtraInhabitantCount,
];

pub const ENUM_SCHEMA: [ValueWitness; 15] = [
    ValueWitness::InitializeBufferWithCopyOfBuffer,
    ValueWitness::Destroy,
    ValueWitness::InitializeWithCopy,
    ValueWitness::AssignWithCopy,
    ValueWitness::InitializeWithTake,
    ValueWitness::AssignWithTake,
    ValueWitness::GetEnumTagSinglePayload,
    ValueWitness::StoreEnumTagSinglePayload,
    ValueWitness::Size,
    ValueWitness::Stride,
    ValueWitness::Flags,
    ValueWitness::ExtraInhabitantCount,
    ValueWitness::GetEnumTag,
    ValueWitness::DestructiveProjectEnumData,
    ValueWitness::DestructiveInjectEnumTag,
];

impl ValueWitness {
    pub fn schema(is_enum: bool) -> &'static [ValueWitness] {
        if is_enum {
            &ENUM_SCHEMA
        } else {
            &BASE_SCHEMA
        }
    }

    pub fn table_size(w: usize, is_enum: bool) -> usize {
        let base = 10 * w + 8;
        if is_enum {
            base + 3 * w
        } else {
            base
        }
    }

    pub fn offset(self, w: usize) -> usize {
        use ValueWitness::*;
        match self {
            InitializeBufferWithCopyOfBuffer => 0,
            Destroy => w,
            InitializeWithCopy => 2 * w,
            AssignWithCopy => 3 * w,
            InitializeWithTake => 4 * w,
            AssignWithTake => 5 * w,
            GetEnumTagSinglePayload => 6 * w,
            StoreEnumTagSinglePayload => 7 * w,
            Size => 8 * w,
            Stride => 9 * w,
            Flags => 10 * w,
            ExtraInhabitantCount => 10 * w + 4,
            GetEnumTag => 10 * w + 8,
            DestructiveProjectEnumData => 11 * w + 8,
            DestructiveInjectEnumTag => 12 * w + 8,
        }
    }

    pub fn width(self, w: usize) -> usize {
        match self {
            ValueWitness::Flags | ValueWitness::ExtraInhabitantCount => 4,
            _ => w,
        }
    }

    pub fn is_function(self) -> bool {
        !matches!(
            self,
            ValueWitness::Size
                | ValueWitness::Stride
                | ValueWitness::Flags
                | ValueWitness::ExtraInhabitantCount
        )
    }

    pub fn name(self) -> &'static str {
        use ValueWitness::*;
        match self {
            InitializeBufferWithCopyOfBuffer => "initializeBufferWithCopyOfBuffer",
            Destroy => "destroy",
            InitializeWithCopy => "initializeWithCopy",
            AssignWithCopy => "assignWithCopy",
            InitializeWithTake => "initializeWithTake",
            AssignWithTake => "assignWithTake",
            GetEnumTagSinglePayload => "getEnumTagSinglePayload",
            StoreEnumTagSinglePayload => "storeEnumTagSinglePayload",
            Size => "size",
            Stride => "stride",
            Flags => "flags",
            ExtraInhabitantCount => "extraInhabitantCount",
            GetEnumTag => "getEnumTag",
            DestructiveProjectEnumData => "destructiveProjectEnumData",
            DestructiveInjectEnumTag => "destructiveInjectEnumTag",
        }
    }
}

impl Display for ValueWitness {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub type BufferCopyFn = unsafe extern "C" fn(*mut u8, *mut u8, *const u8) -> *mut u8;
pub type DestroyFn = unsafe extern "C" fn(*mut u8, *const u8);
pub type CopyFn = unsafe extern "C" fn(*mut u8, *mut u8, *const u8) -> *mut u8;
pub type GetEnumTagSinglePayloadFn = unsafe extern "C" fn(*const u8, u32, *const u8) -> u32;
pub type StoreEnumTagSinglePayloadFn = unsafe extern "C" fn(*mut u8, u32, u32, *const u8);

/// In-process layout of the base value witness schema.
#[repr(C)]
pub struct ValueWitnessTable {
    pub initialize_buffer_with_copy_of_buffer: BufferCopyFn,
    pub destroy: DestroyFn,
    pub initialize_with_copy: CopyFn,
    pub assign_with_copy: CopyFn,
    pub initialize_with_take: CopyFn,
    pub assign_with_take: CopyFn,
    pub get_enum_tag_single_payload: GetEnumTagSinglePayloadFn,
    pub store_enum_tag_single_payload: StoreEnumTagSinglePayloadFn,
    pub size: usize,
    pub stride: usize,
    pub flags: u32,
    pub extra_inhabitant_count: u32,
}
