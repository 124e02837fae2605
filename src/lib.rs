//! Builds generic value type metadata records from type descriptors, metadata patterns and
//! generic arguments, either in the current process or inside a snapshot of another one.
#[macro_use]
mod macros;

pub mod abi;
pub mod buffer;
pub mod builder;
pub mod config;
pub mod error;
pub mod image;
pub mod lookup;
pub mod mangling;
pub mod memory;
pub mod pointer;
pub mod reader_writer;
pub mod symbols;
pub mod utils;
pub mod validate;
pub mod witnesses;

pub use builder::{BuiltMetadata, GenericMetadataBuilder, MetadataDump};
pub use config::{BuilderConfig, Verbosity};
pub use error::{BuilderError, BuilderResult, LookupError};
pub use reader_writer::{InProcessReaderWriter, MemoryReader, ReaderWriter, SnapshotReaderWriter};
pub use utils::Address;
pub use validate::{diff_metadata, MetadataDiff, ValidationOutcome};
