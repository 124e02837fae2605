use super::{MemoryReader, ReaderWriter};
use crate::{
    abi::{Metadata, MetadataPattern, TypeDescriptor},
    buffer::{Buffer, Code, WritableRegion},
    config::BuilderConfig,
    error::{BuilderError, BuilderResult},
    lookup::{SubstGenericParametersFromMetadata, TypeLookup, TypeRegistry},
    memory::{snapshot::MemorySnapshot, AllocationTag},
    symbols::SymbolInfo,
    utils::Address,
};
use std::collections::HashMap;

/// Native stand-in for a size callback in the inspected process.
pub type SizeEmulation =
    Box<dyn Fn(&MemorySnapshot, Address, Address) -> BuilderResult<usize> + Send + Sync>;

/// Native stand-in for an instantiation callback in the inspected process.
pub type InstantiationEmulation =
    Box<dyn Fn(&mut MemorySnapshot, Address, &[Address]) -> BuilderResult<Address> + Send + Sync>;

/// Reader/writer over a [`MemorySnapshot`] of another process.
///
/// Addresses are the inspected process's addresses. Allocations are mapped into the snapshot
/// as new anonymous segments, so records built here can be written back or compared against
/// records that already exist in the snapshot. Code in the snapshot cannot run here; callbacks
/// are dispatched by symbol name to emulations registered up front.
pub struct SnapshotReaderWriter {
    snapshot: MemorySnapshot,
    types: TypeRegistry,
    size_functions: HashMap<String, SizeEmulation>,
    instantiation_functions: HashMap<String, InstantiationEmulation>,
    allocation_limit: Option<usize>,
    allocated: usize,
    config: BuilderConfig,
}

impl SnapshotReaderWriter {
    pub fn new(snapshot: MemorySnapshot, config: BuilderConfig) -> Self {
        let types = TypeRegistry::from_snapshot(&snapshot);
        Self {
            snapshot,
            types,
            size_functions: HashMap::new(),
            instantiation_functions: HashMap::new(),
            allocation_limit: None,
            allocated: 0,
            config,
        }
    }

    /// Caps the total number of bytes this reader/writer may map into the snapshot.
    pub fn with_allocation_limit(mut self, limit: usize) -> Self {
        self.allocation_limit = Some(limit);
        self
    }

    pub fn register_size_function(&mut self, symbol: impl Into<String>, emulation: SizeEmulation) {
        self.size_functions.insert(symbol.into(), emulation);
    }

    pub fn register_instantiation_function(
        &mut self,
        symbol: impl Into<String>,
        emulation: InstantiationEmulation,
    ) {
        self.instantiation_functions.insert(symbol.into(), emulation);
    }

    pub fn snapshot(&self) -> &MemorySnapshot {
        &self.snapshot
    }

    pub fn into_snapshot(self) -> MemorySnapshot {
        self.snapshot
    }

    pub fn types(&self) -> &TypeRegistry {
        &self.types
    }

    /// Name of the symbol that starts exactly at `function`.
    fn callback_symbol(&self, function: Buffer<Code>) -> BuilderResult<String> {
        match self.snapshot.symbol_at(function.address) {
            Some((symbol, _)) if symbol.address == function.address => Ok(symbol.name.clone()),
            _ => Err(BuilderError::invalid_pattern(format!(
                "callback at {} does not name a symbol",
                function.address
            ))),
        }
    }
}

impl MemoryReader for SnapshotReaderWriter {
    fn pointer_size(&self) -> usize {
        self.snapshot.pointer_size
    }

    fn config(&self) -> &BuilderConfig {
        &self.config
    }

    fn read_bytes(&self, address: Address, out: &mut [u8]) -> BuilderResult<()> {
        self.snapshot.read(address, out)
    }

    fn get_symbol_pointer<T>(&self, name: &str) -> BuilderResult<Buffer<T>> {
        self.snapshot
            .symbol_address(name)
            .map(Buffer::new)
            .ok_or_else(|| BuilderError::SymbolNotFound(name.to_string()))
    }

    fn get_symbol_info(&self, address: Address) -> SymbolInfo {
        match self.snapshot.symbol_at(address) {
            Some((symbol, segment)) => SymbolInfo {
                symbol: symbol.name.clone(),
                module: segment.name.clone(),
                offset: address.0 - symbol.address.0,
            },
            None => SymbolInfo::unknown(),
        }
    }

    fn get_type_by_mangled_name(
        &self,
        containing: Buffer<Metadata>,
        mangled_name: &str,
    ) -> BuilderResult<Buffer<Metadata>> {
        let substitutions = SubstGenericParametersFromMetadata::read(self, containing)?;
        let metadata = self
            .types
            .lookup_type(mangled_name, &substitutions)
            .map_err(|source| BuilderError::TypeLookupFailed {
                name: mangled_name.to_string(),
                source,
            })?;
        crate::builder_log!(self, "type {mangled_name} in {} -> {metadata}", containing.address);
        Ok(Buffer::new(metadata))
    }
}

impl ReaderWriter for SnapshotReaderWriter {
    fn allocate(&mut self, size: usize, tag: AllocationTag) -> BuilderResult<WritableRegion> {
        let total = self.allocated.saturating_add(size);
        if self.allocation_limit.is_some_and(|limit| total > limit) {
            return Err(BuilderError::AllocationFailed { size, tag });
        }
        self.allocated = total;
        let base = self.snapshot.map_anonymous(tag.name(), size);
        crate::builder_log!(self, "mapped {size} bytes for {tag} at {base}");
        Ok(WritableRegion::new(base, size, tag))
    }

    fn write_bytes(&mut self, region: &mut WritableRegion, offset: usize, bytes: &[u8]) {
        let address = region.check_write(offset, bytes.len());
        assert!(
            self.snapshot.write(address, bytes),
            "region at {} is not mapped in the snapshot",
            region.base()
        );
    }

    fn call_size_function(
        &mut self,
        function: Buffer<Code>,
        descriptor: Buffer<TypeDescriptor>,
        pattern: Buffer<MetadataPattern>,
    ) -> BuilderResult<usize> {
        let name = self.callback_symbol(function)?;
        let emulation = self.size_functions.get(&name).ok_or_else(|| {
            BuilderError::invalid_pattern(format!("no emulation for size callback {name}"))
        })?;
        let size = emulation(&self.snapshot, descriptor.address, pattern.address)?;
        crate::builder_trace!(self, "size callback {name} returned {size}");
        Ok(size)
    }

    fn call_instantiation_function(
        &mut self,
        function: Buffer<Code>,
        record: Buffer<Metadata>,
        arguments: &[Address],
    ) -> BuilderResult<Address> {
        let name = self.callback_symbol(function)?;
        let emulation = self.instantiation_functions.get(&name).ok_or_else(|| {
            BuilderError::invalid_pattern(format!("no emulation for instantiation callback {name}"))
        })?;
        let result = emulation(&mut self.snapshot, record.address, arguments)?;
        crate::builder_trace!(self, "instantiation callback {name} returned {result}");
        Ok(result)
    }
}
