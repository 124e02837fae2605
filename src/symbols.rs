//! Name/address lookup for the running process.
//!
//! Symbols come from two places: names registered explicitly (loaded images, builtin witness
//! tables, callbacks) and, as a fallback, the dynamic loader of the running process. Forward
//! lookups go through `libloading`, reverse lookups through `dladdr`.
use crate::utils::Address;
use parking_lot::RwLock;
use std::collections::HashMap;

pub const UNKNOWN: &str = "<unknown>";

/// Diagnostic description of an address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolInfo {
    pub symbol: String,
    pub module: String,
    pub offset: u64,
}

impl SymbolInfo {
    pub fn unknown() -> Self {
        Self {
            symbol: UNKNOWN.to_string(),
            module: UNKNOWN.to_string(),
            offset: 0,
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.symbol == UNKNOWN
    }
}

impl std::fmt::Display for SymbolInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.offset == 0 {
            write!(f, "{} ({})", self.symbol, self.module)
        } else {
            write!(f, "{}+{:#x} ({})", self.symbol, self.offset, self.module)
        }
    }
}

#[derive(Debug, Clone)]
struct ImageRange {
    name: String,
    start: Address,
    end: Address,
}

#[derive(Default)]
struct Tables {
    by_name: HashMap<String, Address>,
    // sorted by address
    by_address: Vec<(Address, String)>,
    images: Vec<ImageRange>,
}

pub struct SymbolTable {
    tables: RwLock<Tables>,
    process: Option<libloading::Library>,
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolTable {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            process: open_running_process(),
        }
    }

    /// A table with the builtin POD value witness tables registered.
    pub fn with_builtins() -> Self {
        let table = Self::new();
        crate::witnesses::register_builtins(&table);
        table
    }

    pub fn register(&self, name: impl Into<String>, address: Address) {
        let name = name.into();
        let mut tables = self.tables.write();
        if let Some(previous) = tables.by_name.insert(name.clone(), address) {
            tables.by_address.retain(|(a, n)| !(*a == previous && *n == name));
        }
        let index = tables.by_address.partition_point(|(a, _)| *a <= address);
        tables.by_address.insert(index, (address, name));
    }

    /// Records that `[start, end)` belongs to the image `name`, for reverse lookups.
    pub fn register_image(&self, name: impl Into<String>, start: Address, end: Address) {
        self.tables.write().images.push(ImageRange {
            name: name.into(),
            start,
            end,
        });
    }

    pub fn lookup(&self, name: &str) -> Option<Address> {
        if let Some(address) = self.tables.read().by_name.get(name) {
            return Some(*address);
        }
        self.lookup_process(name)
    }

    fn lookup_process(&self, name: &str) -> Option<Address> {
        let library = self.process.as_ref()?;
        // SAFETY: the symbol is only used for its address, never called or dereferenced here.
        let symbol = unsafe { library.get::<*const u8>(name.as_bytes()) }.ok()?;
        let address = Address::from_ptr(*symbol);
        (!address.is_null()).then_some(address)
    }

    /// Best-effort reverse lookup. Registered images are searched first, then the libraries
    /// loaded into the process. Anything else comes back as [`SymbolInfo::unknown`].
    pub fn symbol_info(&self, address: Address) -> SymbolInfo {
        self.registered_symbol_info(address)
            .or_else(|| process_symbol_info(address))
            .unwrap_or_else(SymbolInfo::unknown)
    }

    fn registered_symbol_info(&self, address: Address) -> Option<SymbolInfo> {
        let tables = self.tables.read();
        let image = tables
            .images
            .iter()
            .find(|i| i.start <= address && address < i.end)?;

        let index = tables.by_address.partition_point(|(a, _)| *a <= address);
        Some(
            match tables.by_address[..index]
                .iter()
                .rev()
                .find(|(a, _)| *a >= image.start)
            {
                Some((start, name)) => SymbolInfo {
                    symbol: name.clone(),
                    module: image.name.clone(),
                    offset: address.0 - start.0,
                },
                None => SymbolInfo {
                    symbol: UNKNOWN.to_string(),
                    module: image.name.clone(),
                    offset: address.0 - image.start.0,
                },
            },
        )
    }
}

#[cfg(unix)]
fn process_symbol_info(address: Address) -> Option<SymbolInfo> {
    use std::{ffi::CStr, mem::MaybeUninit, os::raw::c_char, path::Path};

    fn owned(name: *const c_char) -> Option<String> {
        // SAFETY: non-null names from dladdr are NUL-terminated and owned by the loader.
        (!name.is_null()).then(|| unsafe { CStr::from_ptr(name) }.to_string_lossy().into_owned())
    }

    if address.is_null() {
        return None;
    }
    let mut info = MaybeUninit::<libc::Dl_info>::zeroed();
    // SAFETY: dladdr only consults the loader's tables; `address` is never dereferenced.
    if unsafe { libc::dladdr(address.as_ptr(), info.as_mut_ptr()) } == 0 {
        return None;
    }
    // SAFETY: a successful dladdr filled every field, and the buffer started zeroed.
    let info = unsafe { info.assume_init() };

    let module = owned(info.dli_fname)
        .map(|path| {
            Path::new(&path)
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or(path)
        })
        .unwrap_or_else(|| UNKNOWN.to_string());
    Some(match owned(info.dli_sname) {
        Some(symbol) => SymbolInfo {
            symbol,
            module,
            offset: address.0.wrapping_sub(Address::from_ptr(info.dli_saddr).0),
        },
        None => SymbolInfo {
            symbol: UNKNOWN.to_string(),
            module,
            offset: address.0.wrapping_sub(Address::from_ptr(info.dli_fbase).0),
        },
    })
}

#[cfg(not(unix))]
fn process_symbol_info(_address: Address) -> Option<SymbolInfo> {
    None
}

#[cfg(unix)]
fn open_running_process() -> Option<libloading::Library> {
    Some(libloading::os::unix::Library::this().into())
}

#[cfg(windows)]
fn open_running_process() -> Option<libloading::Library> {
    libloading::os::windows::Library::this().ok().map(Into::into)
}

#[cfg(not(any(unix, windows)))]
fn open_running_process() -> Option<libloading::Library> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_and_reverse_lookup() {
        let table = SymbolTable::new();
        table.register_image("image", Address(0x1000), Address(0x2000));
        table.register("first", Address(0x1000));
        table.register("second", Address(0x1100));

        assert_eq!(table.lookup("second"), Some(Address(0x1100)));
        assert_eq!(
            table.symbol_info(Address(0x1108)),
            SymbolInfo {
                symbol: "second".into(),
                module: "image".into(),
                offset: 8
            }
        );
        assert_eq!(table.symbol_info(Address(0x1000)).offset, 0);
        assert!(table.symbol_info(Address(0x5000)).is_unknown());
    }

    #[test]
    fn test_reregistering_moves_symbol() {
        let table = SymbolTable::new();
        table.register_image("image", Address(0x1000), Address(0x2000));
        table.register("moved", Address(0x1100));
        table.register("moved", Address(0x1200));
        assert_eq!(table.lookup("moved"), Some(Address(0x1200)));
        assert_eq!(table.symbol_info(Address(0x1180)).symbol, UNKNOWN);
    }

    #[cfg(unix)]
    #[test]
    fn test_reverse_lookup_in_process() {
        let table = SymbolTable::new();
        let malloc = table.lookup("malloc").unwrap();
        let info = table.symbol_info(malloc);
        assert!(!info.is_unknown(), "{info}");
        assert_eq!(info.offset, 0);
        assert!(!info.module.contains('/'), "{info}");
        assert_eq!(table.lookup(&info.symbol), Some(malloc));

        assert!(table.symbol_info(Address::NULL).is_unknown());
    }

    #[test]
    fn test_missing_symbol() {
        let table = SymbolTable::new();
        assert_eq!(table.lookup("genmeta_no_such_symbol_anywhere"), None);
    }
}
