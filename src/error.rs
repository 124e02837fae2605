use crate::{memory::AllocationTag, utils::Address};
use thiserror::Error;

pub type BuilderResult<T> = Result<T, BuilderError>;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum BuilderError {
    #[error("invalid metadata pattern: {0}")]
    InvalidPattern(String),

    #[error("failed to allocate {size} bytes for {tag}")]
    AllocationFailed { size: usize, tag: AllocationTag },

    #[error("symbol '{0}' not found")]
    SymbolNotFound(String),

    #[error("type lookup failed for '{name}': {source}")]
    TypeLookupFailed {
        name: String,
        #[source]
        source: LookupError,
    },

    #[error("metadata initialization failed: {0}")]
    InitializationFailed(Box<BuilderError>),

    #[error("cannot read {len} bytes at {address}")]
    MemoryRead { address: Address, len: usize },
}

impl BuilderError {
    pub fn invalid_pattern(message: impl Into<String>) -> Self {
        Self::InvalidPattern(message.into())
    }

    /// Wraps `self` as the first failure of an initialization pass. Errors that already are
    /// initialization failures are not wrapped twice.
    pub fn into_initialization_failure(self) -> Self {
        match self {
            e @ Self::InitializationFailed(_) => e,
            e => Self::InitializationFailed(Box::new(e)),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum LookupError {
    #[error("malformed mangled name '{name}' at position {position}: {message}")]
    Demangle {
        name: String,
        position: usize,
        message: String,
    },

    #[error("no metadata registered for type '{0}'")]
    UnknownType(String),

    #[error("generic parameter (depth {depth}, index {index}) could not be substituted")]
    UnresolvedGenericParam { depth: u32, index: u32 },

    #[error("witness table {index} for type at {type_metadata} could not be substituted")]
    UnresolvedWitnessTable { type_metadata: Address, index: u32 },

    #[error("no associated type {index} registered for witness table at {witness_table}")]
    UnknownAssociatedType { witness_table: Address, index: u32 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initialization_failure_wraps_once() {
        let inner = BuilderError::SymbolNotFound("$sBi64_WV".into());
        let wrapped = inner.clone().into_initialization_failure();
        assert_eq!(wrapped, BuilderError::InitializationFailed(Box::new(inner)));
        assert_eq!(wrapped.clone().into_initialization_failure(), wrapped);
    }

    #[test]
    fn test_type_lookup_message() {
        let error = BuilderError::TypeLookupFailed {
            name: "4main3BoxVyxG".into(),
            source: LookupError::UnresolvedGenericParam { depth: 0, index: 0 },
        };
        assert_eq!(
            error.to_string(),
            "type lookup failed for '4main3BoxVyxG': \
             generic parameter (depth 0, index 0) could not be substituted"
        );
    }
}
