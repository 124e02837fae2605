//! The memory capabilities the builder is written against.
//!
//! [`MemoryReader`] covers reads, pointer resolution and symbol/type queries; [`ReaderWriter`]
//! adds allocation, offset-checked writes and callback invocation. The builder only ever talks
//! to these traits, so the same algorithm runs against the current process
//! ([`InProcessReaderWriter`]) or against a snapshot of another one ([`SnapshotReaderWriter`]).
use crate::{
    abi::{Metadata, MetadataPattern, TypeDescriptor},
    buffer::{Buffer, Code, WritableRegion},
    config::BuilderConfig,
    error::{BuilderError, BuilderResult},
    memory::AllocationTag,
    pointer::{relative_target, FunctionPointerKind, PointerField, PointerKind},
    symbols::SymbolInfo,
    utils::Address,
};

mod in_process;
mod snapshot;

pub use in_process::InProcessReaderWriter;
pub use snapshot::{InstantiationEmulation, SizeEmulation, SnapshotReaderWriter};

/// Longest C string `read_c_string` will scan before giving up.
pub const MAX_STRING_LENGTH: usize = 4096;

pub trait MemoryReader {
    fn pointer_size(&self) -> usize;

    fn config(&self) -> &BuilderConfig;

    fn read_bytes(&self, address: Address, out: &mut [u8]) -> BuilderResult<()>;

    fn read_u8(&self, address: Address) -> BuilderResult<u8> {
        let mut buf = [0u8; 1];
        self.read_bytes(address, &mut buf)?;
        Ok(buf[0])
    }

    fn read_u16(&self, address: Address) -> BuilderResult<u16> {
        let mut buf = [0u8; 2];
        self.read_bytes(address, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn read_u32(&self, address: Address) -> BuilderResult<u32> {
        let mut buf = [0u8; 4];
        self.read_bytes(address, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_i32(&self, address: Address) -> BuilderResult<i32> {
        let mut buf = [0u8; 4];
        self.read_bytes(address, &mut buf)?;
        Ok(i32::from_le_bytes(buf))
    }

    /// Reads a pointer-sized, zero-extended word.
    fn read_word(&self, address: Address) -> BuilderResult<u64> {
        let mut buf = [0u8; 8];
        let w = self.pointer_size();
        self.read_bytes(address, &mut buf[..w])?;
        Ok(u64::from_le_bytes(buf))
    }

    fn read_c_string(&self, address: Address) -> BuilderResult<String> {
        let mut bytes = vec![];
        loop {
            let b = self.read_u8(address + bytes.len())?;
            if b == 0 {
                break;
            }
            bytes.push(b);
            if bytes.len() >= MAX_STRING_LENGTH {
                return Err(BuilderError::invalid_pattern(format!(
                    "unterminated string at {address}"
                )));
            }
        }
        String::from_utf8(bytes)
            .map_err(|_| BuilderError::invalid_pattern(format!("string at {address} is not UTF-8")))
    }

    /// Resolves the pointer stored at `location`, interpreting it with the given shape. A
    /// nullable field holding "no target" resolves to a null buffer.
    fn resolve_pointer<T>(&self, location: Address, kind: PointerKind) -> BuilderResult<Buffer<T>> {
        let target = match kind {
            PointerKind::Absolute => Some(Address(self.read_word(location)?)),
            PointerKind::RelativeDirect { nullable } => {
                relative_target(location, self.read_i32(location)?, nullable)
            }
            PointerKind::RelativeIndirect { nullable } => {
                match relative_target(location, self.read_i32(location)?, nullable) {
                    Some(slot) => Some(Address(self.read_word(slot)?)),
                    None => None,
                }
            }
        };
        let target = target.unwrap_or(Address::NULL);
        if target.is_null() && !kind.is_nullable() {
            return Err(BuilderError::invalid_pattern(format!(
                "non-nullable {kind:?} pointer at {location} has no target"
            )));
        }
        crate::builder_trace!(self, "resolved {kind:?} at {location} -> {target}");
        Ok(Buffer::new(target))
    }

    fn resolve_field<T>(&self, base: Address, field: PointerField) -> BuilderResult<Buffer<T>> {
        self.resolve_pointer(base + field.offset, field.kind)
    }

    /// Hook for platforms that sign or otherwise wrap code pointers.
    fn unwrap_function_address(&self, address: Address) -> Address {
        address
    }

    fn resolve_function_pointer(
        &self,
        location: Address,
        kind: FunctionPointerKind,
    ) -> BuilderResult<Buffer<Code>> {
        let target = match kind {
            FunctionPointerKind::Absolute => Address(self.read_word(location)?),
            FunctionPointerKind::Compact { nullable } => {
                relative_target(location, self.read_i32(location)?, nullable)
                    .unwrap_or(Address::NULL)
            }
        };
        let target = self.unwrap_function_address(target);
        crate::builder_trace!(self, "resolved function {kind:?} at {location} -> {target}");
        Ok(Buffer::new(target))
    }

    fn get_symbol_pointer<T>(&self, name: &str) -> BuilderResult<Buffer<T>>;

    /// Best-effort reverse lookup for diagnostics. Never fails.
    fn get_symbol_info(&self, address: Address) -> SymbolInfo;

    /// Resolves a mangled type name referenced from `containing`, substituting the generic
    /// arguments already installed in it.
    fn get_type_by_mangled_name(
        &self,
        containing: Buffer<Metadata>,
        mangled_name: &str,
    ) -> BuilderResult<Buffer<Metadata>>;
}

pub trait ReaderWriter: MemoryReader {
    /// Allocates `size` zeroed, pointer-aligned bytes.
    fn allocate(&mut self, size: usize, tag: AllocationTag) -> BuilderResult<WritableRegion>;

    /// Writes `bytes` at `offset` inside `region`.
    ///
    /// # Panics
    /// If the write does not lie entirely inside the region.
    fn write_bytes(&mut self, region: &mut WritableRegion, offset: usize, bytes: &[u8]);

    fn write_word(&mut self, region: &mut WritableRegion, offset: usize, value: u64) {
        let w = self.pointer_size();
        self.write_bytes(region, offset, &value.to_le_bytes()[..w]);
    }

    /// Stores `target` as an absolute pointer at `offset` inside `region`.
    fn write_pointer(&mut self, region: &mut WritableRegion, offset: usize, target: Address) {
        crate::builder_trace!(self, "writing pointer {target} at {}", region.base() + offset);
        self.write_word(region, offset, target.0);
    }

    fn write_function_pointer(
        &mut self,
        region: &mut WritableRegion,
        offset: usize,
        target: Buffer<Code>,
    ) {
        crate::builder_trace!(
            self,
            "writing function pointer {} at {}",
            target.address,
            region.base() + offset
        );
        self.write_word(region, offset, target.address.0);
    }

    /// Invokes a pattern's size callback.
    fn call_size_function(
        &mut self,
        function: Buffer<Code>,
        descriptor: Buffer<TypeDescriptor>,
        pattern: Buffer<MetadataPattern>,
    ) -> BuilderResult<usize>;

    /// Invokes a pattern's instantiation callback on the record under construction.
    fn call_instantiation_function(
        &mut self,
        function: Buffer<Code>,
        record: Buffer<Metadata>,
        arguments: &[Address],
    ) -> BuilderResult<Address>;
}
