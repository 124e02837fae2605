use crate::{
    abi::{instruction, InstructionKind, OperandShape},
    buffer::{Buffer, Code},
    error::{BuilderError, BuilderResult},
    reader_writer::MemoryReader,
    utils::Address,
};
use enum_dispatch::enum_dispatch;
use std::fmt::{self, Display, Formatter};

#[enum_dispatch]
pub trait Instruction {
    /// Offset from the logical record of the first byte this instruction writes.
    fn target(&self) -> usize;

    /// Number of bytes written, when it does not depend on a size callback.
    fn static_width(&self, pointer_size: usize) -> Option<usize>;

    fn is_pointer_valued(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyConstant {
    pub target: usize,
    pub data: Address,
    pub len: usize,
}

impl Instruction for CopyConstant {
    fn target(&self) -> usize {
        self.target
    }

    fn static_width(&self, _: usize) -> Option<usize> {
        Some(self.len)
    }

    fn is_pointer_valued(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyGenericArgument {
    pub target: usize,
    pub index: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallInstantiationFunction {
    pub target: usize,
    pub function: Buffer<Code>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteWitnessTableSlot {
    pub target: usize,
    pub table: Address,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NestedTypeLookup {
    pub target: usize,
    pub name: Address,
}

macro_rules! pointer_valued {
    ($($t:ty),*) => {$(
        impl Instruction for $t {
            fn target(&self) -> usize {
                self.target
            }

            fn static_width(&self, pointer_size: usize) -> Option<usize> {
                Some(pointer_size)
            }

            fn is_pointer_valued(&self) -> bool {
                true
            }
        }
    )*};
}
pointer_valued!(
    CopyGenericArgument,
    CallInstantiationFunction,
    WriteWitnessTableSlot,
    NestedTypeLookup
);

/// Zero-filled space whose size a callback decides at build time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReserveComputed {
    pub target: usize,
    pub function: Buffer<Code>,
}

impl Instruction for ReserveComputed {
    fn target(&self) -> usize {
        self.target
    }

    fn static_width(&self, _: usize) -> Option<usize> {
        None
    }

    fn is_pointer_valued(&self) -> bool {
        false
    }
}

#[enum_dispatch(Instruction)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldInstruction {
    CopyConstant,
    CopyGenericArgument,
    CallInstantiationFunction,
    WriteWitnessTableSlot,
    NestedTypeLookup,
    ReserveComputed,
}

impl FieldInstruction {
    pub fn kind(&self) -> InstructionKind {
        match self {
            FieldInstruction::CopyConstant(_) => InstructionKind::CopyConstant,
            FieldInstruction::CopyGenericArgument(_) => InstructionKind::CopyGenericArgument,
            FieldInstruction::CallInstantiationFunction(_) => {
                InstructionKind::CallInstantiationFunction
            }
            FieldInstruction::WriteWitnessTableSlot(_) => InstructionKind::WriteWitnessTableSlot,
            FieldInstruction::NestedTypeLookup(_) => InstructionKind::NestedTypeLookup,
            FieldInstruction::ReserveComputed(_) => InstructionKind::ReserveComputed,
        }
    }
}

impl Display for FieldInstruction {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            FieldInstruction::CopyConstant(i) => {
                write!(f, "+{:#x}: copy {} bytes from {}", i.target, i.len, i.data)
            }
            FieldInstruction::CopyGenericArgument(i) => {
                write!(f, "+{:#x}: generic argument {}", i.target, i.index)
            }
            FieldInstruction::CallInstantiationFunction(i) => {
                write!(f, "+{:#x}: instantiate via {}", i.target, i.function.address)
            }
            FieldInstruction::WriteWitnessTableSlot(i) => {
                write!(f, "+{:#x}: witness table {}", i.target, i.table)
            }
            FieldInstruction::NestedTypeLookup(i) => {
                write!(f, "+{:#x}: type named at {}", i.target, i.name)
            }
            FieldInstruction::ReserveComputed(i) => {
                write!(f, "+{:#x}: reserve via {}", i.target, i.function.address)
            }
        }
    }
}

/// Decodes the 16-byte instruction at `location`, resolving its operand with the shape its
/// kind prescribes.
pub fn decode_instruction<R: MemoryReader + ?Sized>(
    reader: &R,
    location: Address,
) -> BuilderResult<FieldInstruction> {
    let raw_kind = reader.read_u8(location + instruction::KIND)?;
    let kind = InstructionKind::from_u8(raw_kind).ok_or_else(|| {
        BuilderError::invalid_pattern(format!(
            "unknown instruction kind {raw_kind} at {location}"
        ))
    })?;
    let target = reader.read_u32(location + instruction::TARGET)? as usize;
    let operand_location = location + instruction::OPERAND;

    let data = |shape| -> BuilderResult<Address> {
        match shape {
            Some(OperandShape::Data(kind)) => {
                Ok(reader.resolve_pointer::<u8>(operand_location, kind)?.address)
            }
            _ => Ok(Address::NULL),
        }
    };
    let function = |shape| -> BuilderResult<Buffer<Code>> {
        match shape {
            Some(OperandShape::Function(kind)) => {
                reader.resolve_function_pointer(operand_location, kind)
            }
            _ => Ok(Buffer::null()),
        }
    };

    let shape = kind.operand_shape();
    let decoded = match kind {
        InstructionKind::CopyConstant => CopyConstant {
            target,
            data: data(shape)?,
            len: reader.read_u16(location + instruction::BYTE_COUNT)? as usize,
        }
        .into(),
        InstructionKind::CopyGenericArgument => CopyGenericArgument {
            target,
            index: reader.read_u32(location + instruction::ARGUMENT_INDEX)? as usize,
        }
        .into(),
        InstructionKind::CallInstantiationFunction => CallInstantiationFunction {
            target,
            function: function(shape)?,
        }
        .into(),
        InstructionKind::WriteWitnessTableSlot => WriteWitnessTableSlot {
            target,
            table: data(shape)?,
        }
        .into(),
        InstructionKind::NestedTypeLookup => NestedTypeLookup {
            target,
            name: data(shape)?,
        }
        .into(),
        InstructionKind::ReserveComputed => ReserveComputed {
            target,
            function: function(shape)?,
        }
        .into(),
    };
    crate::builder_trace!(reader, "decoded instruction at {location}: {decoded}");
    Ok(decoded)
}
