//! Assembly of metadata images.
//!
//! An [`ImageBuilder`] lays out descriptors, patterns, value witness tables, strings and
//! reference records as raw bytes with symbolic fixups, the same shape a compiler emits for a
//! type's static metadata. Images are linked when loaded: either into the current process
//! (inside a static arena, so that compact function pointers can reach native code in the
//! same binary) or into a [`MemorySnapshot`] standing in for another process.
use crate::{
    abi::{descriptor, field_descriptor, instruction, pattern, InstructionKind, MetadataKind},
    memory::snapshot::{MemorySnapshot, SnapshotError},
    symbols::SymbolTable,
    utils::{align_up, Address},
};
use std::{
    cell::UnsafeCell,
    collections::{HashMap, HashSet},
    mem::size_of,
    sync::atomic::{AtomicUsize, Ordering},
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("undefined symbol '{0}'")]
    UndefinedSymbol(String),
    #[error("symbol '{0}' defined more than once")]
    DuplicateSymbol(String),
    #[error("relocation to '{symbol}' at offset {offset:#x} does not fit in 32 bits")]
    RelocationOutOfRange { symbol: String, offset: usize },
    #[error("image arena exhausted: {requested} bytes requested, {available} available")]
    ArenaExhausted { requested: usize, available: usize },
    #[error("image uses {found}-byte pointers, target uses {expected}-byte pointers")]
    PointerSize { expected: usize, found: usize },
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FixupKind {
    Relative32,
    AbsoluteWord,
}

#[derive(Debug, Clone)]
struct Fixup {
    offset: usize,
    kind: FixupKind,
    symbol: String,
    addend: i64,
}

/// One field instruction of a metadata pattern, with operands named by symbol.
#[derive(Debug, Clone, Copy)]
pub enum InstructionLayout<'a> {
    CopyConstant { target: u32, data: &'a str, len: u16 },
    CopyGenericArgument { target: u32, index: u32 },
    CallInstantiationFunction { target: u32, function: &'a str },
    WriteWitnessTableSlot { target: u32, table: &'a str },
    NestedTypeLookup { target: u32, name: &'a str },
    ReserveComputed { target: u32, function: &'a str },
}

/// Contents of a type descriptor, with pointer fields named by symbol.
#[derive(Debug, Clone, Copy, Default)]
pub struct DescriptorLayout<'a> {
    pub flags: u32,
    pub name: &'a str,
    pub pattern: Option<&'a str>,
    pub fields: Option<&'a str>,
    /// Struct: number of fields. Enum: payload cases | payload size offset << 24.
    pub kind_word0: u32,
    /// Struct: field offset vector offset. Enum: number of empty cases.
    pub kind_word1: u32,
    pub num_params: u16,
    pub num_key_arguments: u16,
    pub generic_argument_offset: u32,
}

pub struct ImageBuilder {
    name: String,
    pointer_size: usize,
    bytes: Vec<u8>,
    labels: HashMap<String, usize>,
    duplicate: Option<String>,
    fixups: Vec<Fixup>,
    indirect_targets: Vec<String>,
}

impl ImageBuilder {
    pub fn new(name: impl Into<String>, pointer_size: usize) -> Self {
        Self {
            name: name.into(),
            pointer_size,
            bytes: vec![],
            labels: HashMap::new(),
            duplicate: None,
            fixups: vec![],
            indirect_targets: vec![],
        }
    }

    /// Builder for an image loaded into the current process.
    pub fn native(name: impl Into<String>) -> Self {
        Self::new(name, size_of::<usize>())
    }

    pub fn pointer_size(&self) -> usize {
        self.pointer_size
    }

    pub fn offset(&self) -> usize {
        self.bytes.len()
    }

    pub fn align(&mut self, align: usize) -> &mut Self {
        let aligned = align_up(self.bytes.len(), align);
        self.bytes.resize(aligned, 0);
        self
    }

    pub fn label(&mut self, name: &str) -> &mut Self {
        if self.labels.insert(name.to_string(), self.bytes.len()).is_some() {
            self.duplicate.get_or_insert_with(|| name.to_string());
        }
        self
    }

    pub fn bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.bytes.extend_from_slice(bytes);
        self
    }

    pub fn zeros(&mut self, len: usize) -> &mut Self {
        self.bytes.resize(self.bytes.len() + len, 0);
        self
    }

    pub fn u8(&mut self, value: u8) -> &mut Self {
        self.bytes(&[value])
    }

    pub fn u16(&mut self, value: u16) -> &mut Self {
        self.bytes(&value.to_le_bytes())
    }

    pub fn u32(&mut self, value: u32) -> &mut Self {
        self.bytes(&value.to_le_bytes())
    }

    pub fn i32(&mut self, value: i32) -> &mut Self {
        self.bytes(&value.to_le_bytes())
    }

    pub fn word(&mut self, value: u64) -> &mut Self {
        let w = self.pointer_size;
        self.bytes(&value.to_le_bytes()[..w])
    }

    /// A labelled NUL-terminated string.
    pub fn c_string(&mut self, label: &str, value: &str) -> &mut Self {
        self.label(label).bytes(value.as_bytes()).u8(0)
    }

    fn fixup(&mut self, kind: FixupKind, symbol: &str, addend: i64) -> &mut Self {
        self.fixups.push(Fixup {
            offset: self.bytes.len(),
            kind,
            symbol: symbol.to_string(),
            addend,
        });
        match kind {
            FixupKind::Relative32 => self.i32(0),
            FixupKind::AbsoluteWord => self.word(0),
        }
    }

    /// A 32-bit offset from this field to `symbol`.
    pub fn relative(&mut self, symbol: &str) -> &mut Self {
        self.fixup(FixupKind::Relative32, symbol, 0)
    }

    /// A compact function pointer; encoded like a direct relative pointer.
    pub fn function(&mut self, symbol: &str) -> &mut Self {
        self.relative(symbol)
    }

    pub fn null_relative(&mut self) -> &mut Self {
        self.i32(0)
    }

    fn optional_relative(&mut self, symbol: Option<&str>) -> &mut Self {
        match symbol {
            Some(symbol) => self.relative(symbol),
            None => self.null_relative(),
        }
    }

    /// A 32-bit offset from this field to a pointer-sized slot holding the address of `symbol`.
    pub fn indirect(&mut self, symbol: &str) -> &mut Self {
        if !self.indirect_targets.iter().any(|t| t == symbol) {
            self.indirect_targets.push(symbol.to_string());
        }
        self.relative(&slot_label(symbol))
    }

    pub fn absolute(&mut self, symbol: &str) -> &mut Self {
        self.fixup(FixupKind::AbsoluteWord, symbol, 0)
    }

    pub fn absolute_addend(&mut self, symbol: &str, addend: i64) -> &mut Self {
        self.fixup(FixupKind::AbsoluteWord, symbol, addend)
    }

    pub fn type_descriptor(&mut self, label: &str, layout: &DescriptorLayout<'_>) -> &mut Self {
        self.align(4).label(label);
        let start = self.offset();
        self.u32(layout.flags)
            .relative(layout.name)
            .optional_relative(layout.pattern)
            .optional_relative(layout.fields)
            .u32(layout.kind_word0)
            .u32(layout.kind_word1)
            .u16(layout.num_params)
            .u16(layout.num_key_arguments)
            .u32(layout.generic_argument_offset);
        debug_assert_eq!(self.offset() - start, descriptor::SIZE);
        self
    }

    pub fn metadata_pattern(
        &mut self,
        label: &str,
        value_witnesses: &str,
        instructions: Option<&str>,
        num_instructions: u16,
        kind: MetadataKind,
    ) -> &mut Self {
        self.align(4).label(label);
        let start = self.offset();
        self.u32(0)
            .indirect(value_witnesses)
            .optional_relative(instructions)
            .u16(num_instructions)
            .u16(kind as u32 as u16);
        debug_assert_eq!(self.offset() - start, pattern::SIZE);
        self
    }

    pub fn field_instructions(
        &mut self,
        label: &str,
        instructions: &[InstructionLayout<'_>],
    ) -> &mut Self {
        self.align(4).label(label);
        for layout in instructions {
            let start = self.offset();
            let (kind, byte_count, target, index) = match *layout {
                InstructionLayout::CopyConstant { target, len, .. } => {
                    (InstructionKind::CopyConstant, len, target, 0)
                }
                InstructionLayout::CopyGenericArgument { target, index } => {
                    (InstructionKind::CopyGenericArgument, 0, target, index)
                }
                InstructionLayout::CallInstantiationFunction { target, .. } => {
                    (InstructionKind::CallInstantiationFunction, 0, target, 0)
                }
                InstructionLayout::WriteWitnessTableSlot { target, .. } => {
                    (InstructionKind::WriteWitnessTableSlot, 0, target, 0)
                }
                InstructionLayout::NestedTypeLookup { target, .. } => {
                    (InstructionKind::NestedTypeLookup, 0, target, 0)
                }
                InstructionLayout::ReserveComputed { target, .. } => {
                    (InstructionKind::ReserveComputed, 0, target, 0)
                }
            };
            self.u8(kind as u8).u8(0).u16(byte_count).u32(target).u32(index);
            match *layout {
                InstructionLayout::CopyConstant { data, .. } => self.relative(data),
                InstructionLayout::CopyGenericArgument { .. } => self.i32(0),
                InstructionLayout::CallInstantiationFunction { function, .. }
                | InstructionLayout::ReserveComputed { function, .. } => self.function(function),
                InstructionLayout::WriteWitnessTableSlot { table, .. } => self.indirect(table),
                InstructionLayout::NestedTypeLookup { name, .. } => self.relative(name),
            };
            debug_assert_eq!(self.offset() - start, instruction::SIZE);
        }
        self
    }

    /// A field descriptor. Each record is `(mangled type name, field name)`, both labels.
    pub fn field_descriptor(&mut self, label: &str, records: &[(Option<&str>, &str)]) -> &mut Self {
        self.align(4).label(label);
        self.u16(records.len() as u16)
            .u16(field_descriptor::RECORD_STRIDE as u16);
        for (type_name, field_name) in records {
            self.u32(0).optional_relative(*type_name).relative(field_name);
        }
        self
    }

    /// A base-schema value witness table. `functions` names the eight witness functions.
    pub fn value_witness_table(
        &mut self,
        label: &str,
        functions: &[&str; 8],
        size: u64,
        stride: u64,
        flags: u32,
        extra_inhabitants: u32,
    ) -> &mut Self {
        self.align(self.pointer_size).label(label);
        for function in functions {
            self.absolute(function);
        }
        self.word(size).word(stride).u32(flags).u32(extra_inhabitants)
    }

    /// Appends the three enum witnesses after a value witness table.
    pub fn enum_witnesses(&mut self, functions: &[&str; 3]) -> &mut Self {
        for function in functions {
            self.absolute(function);
        }
        self
    }

    /// The header of a value metadata record. `label` names the logical record, one word
    /// past the value witness table pointer. Extra data follows from the caller.
    pub fn value_metadata(
        &mut self,
        label: &str,
        value_witnesses: &str,
        kind: MetadataKind,
        descriptor: &str,
    ) -> &mut Self {
        self.align(self.pointer_size)
            .absolute(value_witnesses)
            .label(label)
            .word(kind as u32 as u64)
            .absolute(descriptor)
    }

    /// Appends the indirect slots and applies every fixup for an image placed at `base`.
    fn link(
        &self,
        base: Address,
        resolve_external: impl Fn(&str) -> Option<Address>,
    ) -> Result<Linked, ImageError> {
        if let Some(name) = &self.duplicate {
            return Err(ImageError::DuplicateSymbol(name.clone()));
        }
        let w = self.pointer_size;
        let mut bytes = self.bytes.clone();
        let mut labels = self.labels.clone();
        let mut fixups = self.fixups.clone();

        bytes.resize(align_up(bytes.len(), w), 0);
        for target in &self.indirect_targets {
            labels.insert(slot_label(target), bytes.len());
            fixups.push(Fixup {
                offset: bytes.len(),
                kind: FixupKind::AbsoluteWord,
                symbol: target.clone(),
                addend: 0,
            });
            bytes.resize(bytes.len() + w, 0);
        }

        let resolve = |symbol: &str| -> Result<Address, ImageError> {
            match labels.get(symbol) {
                Some(offset) => Ok(base + *offset),
                None => resolve_external(symbol)
                    .ok_or_else(|| ImageError::UndefinedSymbol(symbol.to_string())),
            }
        };

        for fixup in &fixups {
            let target = resolve(&fixup.symbol)?.offset(fixup.addend);
            match fixup.kind {
                FixupKind::Relative32 => {
                    let place = base + fixup.offset;
                    let value = crate::pointer::relative_offset(place, target).ok_or_else(|| {
                        ImageError::RelocationOutOfRange {
                            symbol: fixup.symbol.clone(),
                            offset: fixup.offset,
                        }
                    })?;
                    bytes[fixup.offset..fixup.offset + 4].copy_from_slice(&value.to_le_bytes());
                }
                FixupKind::AbsoluteWord => {
                    bytes[fixup.offset..fixup.offset + w]
                        .copy_from_slice(&target.0.to_le_bytes()[..w]);
                }
            }
        }

        let slots: HashSet<String> = self.indirect_targets.iter().map(|t| slot_label(t)).collect();
        let symbols = labels
            .into_iter()
            .filter(|(name, _)| !slots.contains(name))
            .map(|(name, offset)| (name, base + offset))
            .collect();
        Ok(Linked { bytes, symbols })
    }

    /// Size of the image once indirect slots are appended.
    fn linked_size(&self) -> usize {
        align_up(self.bytes.len(), self.pointer_size)
            + self.indirect_targets.len() * self.pointer_size
    }

    /// Links the image into the static image arena of this process and registers its symbols.
    /// External symbols are resolved through `symbols`.
    pub fn load_in_process(&self, symbols: &SymbolTable) -> Result<LoadedImage, ImageError> {
        let expected = size_of::<usize>();
        if self.pointer_size != expected {
            return Err(ImageError::PointerSize {
                expected,
                found: self.pointer_size,
            });
        }
        let size = self.linked_size();
        let base = IMAGE_ARENA.reserve(size)?;
        let linked = self.link(base, |name| symbols.lookup(name))?;
        // SAFETY: `reserve` handed out `[base, base + size)` exclusively to this image.
        unsafe {
            std::ptr::copy_nonoverlapping(linked.bytes.as_ptr(), base.as_mut_ptr::<u8>(), size);
        }
        symbols.register_image(self.name.clone(), base, base + size);
        for (name, address) in &linked.symbols {
            symbols.register(name.clone(), *address);
        }
        Ok(LoadedImage {
            name: self.name.clone(),
            base,
            size,
            symbols: linked.symbols,
        })
    }

    /// Links the image at the next free address of `snapshot` and adds its symbols there.
    /// External symbols are resolved against the snapshot's symbols.
    pub fn load_into_snapshot(
        &self,
        snapshot: &mut MemorySnapshot,
    ) -> Result<LoadedImage, ImageError> {
        if self.pointer_size != snapshot.pointer_size {
            return Err(ImageError::PointerSize {
                expected: snapshot.pointer_size,
                found: self.pointer_size,
            });
        }
        let base = snapshot.next_free_address();
        let linked = self.link(base, |name| snapshot.symbol_address(name))?;
        let size = linked.bytes.len();
        snapshot.map_segment(self.name.clone(), base, linked.bytes)?;
        for (name, address) in &linked.symbols {
            snapshot.add_symbol(name.clone(), *address);
        }
        Ok(LoadedImage {
            name: self.name.clone(),
            base,
            size,
            symbols: linked.symbols,
        })
    }
}

fn slot_label(symbol: &str) -> String {
    format!("{symbol}@slot")
}

struct Linked {
    bytes: Vec<u8>,
    symbols: HashMap<String, Address>,
}

#[derive(Debug, Clone)]
pub struct LoadedImage {
    pub name: String,
    pub base: Address,
    pub size: usize,
    symbols: HashMap<String, Address>,
}

impl LoadedImage {
    pub fn symbol(&self, name: &str) -> Result<Address, ImageError> {
        self.symbols
            .get(name)
            .copied()
            .ok_or_else(|| ImageError::UndefinedSymbol(name.to_string()))
    }

    pub fn symbols(&self) -> impl Iterator<Item = (&str, Address)> {
        self.symbols.iter().map(|(n, a)| (n.as_str(), *a))
    }
}

const IMAGE_ARENA_SIZE: usize = 1 << 20;

#[repr(C, align(4096))]
struct ImageArena {
    storage: UnsafeCell<[u8; IMAGE_ARENA_SIZE]>,
    used: AtomicUsize,
}

// SAFETY: `reserve` hands out disjoint ranges; each range is written once by the loader that
// reserved it before its address is published.
unsafe impl Sync for ImageArena {}

impl ImageArena {
    fn reserve(&self, size: usize) -> Result<Address, ImageError> {
        let size = align_up(size.max(1), 16);
        let start = self
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(size).filter(|end| *end <= IMAGE_ARENA_SIZE)
            })
            .map_err(|used| ImageError::ArenaExhausted {
                requested: size,
                available: IMAGE_ARENA_SIZE - used,
            })?;
        Ok(Address::from_ptr(self.storage.get() as *const u8) + start)
    }
}

static IMAGE_ARENA: ImageArena = ImageArena {
    storage: UnsafeCell::new([0; IMAGE_ARENA_SIZE]),
    used: AtomicUsize::new(0),
};
