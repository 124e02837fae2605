use super::{MemoryReader, ReaderWriter};
use crate::{
    abi::{Metadata, MetadataPattern, TypeDescriptor},
    buffer::{Buffer, Code, WritableRegion},
    config::BuilderConfig,
    error::{BuilderError, BuilderResult},
    lookup::{SubstGenericParametersFromMetadata, TypeLookup},
    memory::{AllocationTag, MetadataAllocator},
    symbols::{SymbolInfo, SymbolTable},
    utils::Address,
};
use libffi::middle::{Arg, Cif, CodePtr, Type};
use std::{ffi::c_void, mem::size_of, ptr};

/// Reader/writer for metadata living in the current process. Reads and writes are plain
/// loads and stores; callbacks are native functions called through libffi.
///
/// The allocator, symbol table and type lookup are shared; each thread builds its own
/// reader/writer around them.
pub struct InProcessReaderWriter<'a> {
    allocator: &'a MetadataAllocator,
    symbols: &'a SymbolTable,
    types: &'a dyn TypeLookup,
    config: BuilderConfig,
}

impl<'a> InProcessReaderWriter<'a> {
    /// # Safety
    /// Reads dereference whatever addresses descriptors, patterns, records and arguments lead
    /// to, and callbacks are called as native code. The caller must ensure that every address
    /// reachable from the descriptors and arguments given to this reader/writer stays mapped
    /// and readable while it is in use, and that every size callback has the C signature
    /// `(descriptor, pattern) -> usize` and every instantiation callback
    /// `(record, arguments) -> pointer`.
    ///
    /// ```compile_fail,E0133
    /// use genmeta::{
    ///     lookup::TypeRegistry, memory::MetadataAllocator, symbols::SymbolTable, BuilderConfig,
    ///     InProcessReaderWriter,
    /// };
    ///
    /// let allocator = MetadataAllocator::new();
    /// let symbols = SymbolTable::new();
    /// let types = TypeRegistry::new();
    /// let _ = InProcessReaderWriter::new(&allocator, &symbols, &types, BuilderConfig::default());
    /// ```
    pub unsafe fn new(
        allocator: &'a MetadataAllocator,
        symbols: &'a SymbolTable,
        types: &'a dyn TypeLookup,
        config: BuilderConfig,
    ) -> Self {
        Self {
            allocator,
            symbols,
            types,
            config,
        }
    }

    pub fn symbols(&self) -> &'a SymbolTable {
        self.symbols
    }

    fn code_ptr(&self, function: Buffer<Code>, what: &str) -> BuilderResult<CodePtr> {
        if function.is_null() {
            return Err(BuilderError::invalid_pattern(format!(
                "{what} callback is null"
            )));
        }
        Ok(CodePtr::from_ptr(function.address.as_ptr::<c_void>()))
    }
}

impl MemoryReader for InProcessReaderWriter<'_> {
    fn pointer_size(&self) -> usize {
        size_of::<usize>()
    }

    fn config(&self) -> &BuilderConfig {
        &self.config
    }

    fn read_bytes(&self, address: Address, out: &mut [u8]) -> BuilderResult<()> {
        if address.is_null() {
            return Err(BuilderError::MemoryRead {
                address,
                len: out.len(),
            });
        }
        // SAFETY: `new` requires every address reachable from the metadata to stay mapped.
        unsafe {
            ptr::copy_nonoverlapping(address.as_ptr::<u8>(), out.as_mut_ptr(), out.len());
        }
        Ok(())
    }

    fn get_symbol_pointer<T>(&self, name: &str) -> BuilderResult<Buffer<T>> {
        let address = self
            .symbols
            .lookup(name)
            .ok_or_else(|| BuilderError::SymbolNotFound(name.to_string()))?;
        crate::builder_trace!(self, "symbol {name} -> {address}");
        Ok(Buffer::new(address))
    }

    fn get_symbol_info(&self, address: Address) -> SymbolInfo {
        self.symbols.symbol_info(address)
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

impl ReaderWriter for InProcessReaderWriter<'_> {
    fn allocate(&mut self, size: usize, tag: AllocationTag) -> BuilderResult<WritableRegion> {
        let ptr = self
            .allocator
            .allocate(size, tag)
            .ok_or(BuilderError::AllocationFailed { size, tag })?;
        let base = Address::from_ptr(ptr.as_ptr());
        crate::builder_log!(self, "allocated {size} bytes for {tag} at {base}");
        Ok(WritableRegion::new(base, size, tag))
    }

    fn write_bytes(&mut self, region: &mut WritableRegion, offset: usize, bytes: &[u8]) {
        let address = region.check_write(offset, bytes.len());
        // SAFETY: `check_write` verified the range lies inside the region, which this
        // reader/writer allocated from the metadata allocator.
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), address.as_mut_ptr::<u8>(), bytes.len());
        }
    }

    fn call_size_function(
        &mut self,
        function: Buffer<Code>,
        descriptor: Buffer<TypeDescriptor>,
        pattern: Buffer<MetadataPattern>,
    ) -> BuilderResult<usize> {
        let code = self.code_ptr(function, "size")?;
        let cif = Cif::new([Type::pointer(), Type::pointer()], Type::usize());
        let descriptor = descriptor.address.as_ptr::<u8>();
        let pattern = pattern.address.as_ptr::<u8>();
        // SAFETY: `new` requires size callbacks to have the C signature
        // `(descriptor, pattern) -> usize`.
        let size: usize = unsafe { cif.call(code, &[Arg::new(&descriptor), Arg::new(&pattern)]) };
        crate::builder_trace!(self, "size callback {} returned {size}", function.address);
        Ok(size)
    }

    fn call_instantiation_function(
        &mut self,
        function: Buffer<Code>,
        record: Buffer<Metadata>,
        arguments: &[Address],
    ) -> BuilderResult<Address> {
        let code = self.code_ptr(function, "instantiation")?;
        let cif = Cif::new([Type::pointer(), Type::pointer()], Type::pointer());
        let record = record.address.as_ptr::<u8>();
        let argument_words: Vec<*const u8> = arguments.iter().map(|a| a.as_ptr()).collect();
        let argument_array = argument_words.as_ptr();
        // SAFETY: `new` requires instantiation callbacks to have the C signature
        // `(record, arguments) -> ptr`; the argument array outlives the call.
        let result: *const u8 =
            unsafe { cif.call(code, &[Arg::new(&record), Arg::new(&argument_array)]) };
        let result = Address::from_ptr(result);
        crate::builder_trace!(
            self,
            "instantiation callback {} returned {result}",
            function.address
        );
        Ok(result)
    }
}
