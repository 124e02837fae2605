//! Mangled-name type lookup.
//!
//! A [`TypeLookup`] service maps a mangled name to type metadata. Generic parameters and
//! associated types inside the name are resolved through a [`Substitutions`] callback pair,
//! normally [`SubstGenericParametersFromMetadata`], which reads the generic arguments already
//! installed in the record that contains the reference.
use crate::{
    abi::{descriptor, record, Metadata},
    buffer::Buffer,
    error::{BuilderResult, LookupError},
    mangling::MangledType,
    memory::snapshot::MemorySnapshot,
    reader_writer::MemoryReader,
    utils::Address,
};
use parking_lot::RwLock;
use std::collections::HashMap;

pub trait Substitutions {
    fn generic_param(&self, depth: u32, index: u32) -> Option<Address>;
    fn witness_table(&self, type_metadata: Address, index: u32) -> Option<Address>;
}

/// Substitutions for names that must not reference generic parameters.
pub struct NoSubstitutions;

impl Substitutions for NoSubstitutions {
    fn generic_param(&self, _depth: u32, _index: u32) -> Option<Address> {
        None
    }

    fn witness_table(&self, _type_metadata: Address, _index: u32) -> Option<Address> {
        None
    }
}

pub trait TypeLookup: Send + Sync {
    fn lookup_type(
        &self,
        mangled_name: &str,
        substitutions: &dyn Substitutions,
    ) -> Result<Address, LookupError>;
}

/// The key arguments of a metadata record: type parameters first, then witness tables.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SubstGenericParametersFromMetadata {
    pub params: Vec<Address>,
    pub witness_tables: Vec<Address>,
}

impl SubstGenericParametersFromMetadata {
    /// Reads the arguments installed in `containing`. Only the outermost generic context
    /// (depth 0) is available from a value record.
    pub fn read<R: MemoryReader + ?Sized>(
        reader: &R,
        containing: Buffer<Metadata>,
    ) -> BuilderResult<Self> {
        let w = reader.pointer_size();
        let descriptor = reader.read_word(containing.address + record::descriptor(w))?;
        let descriptor = Address(descriptor);
        let num_params = reader.read_u16(descriptor + descriptor::NUM_PARAMS)? as usize;
        let num_key = reader.read_u16(descriptor + descriptor::NUM_KEY_ARGUMENTS)? as usize;
        let offset = reader.read_u32(descriptor + descriptor::GENERIC_ARGUMENT_OFFSET)? as usize;

        let arguments = containing.address + offset * w;
        let mut params = Vec::with_capacity(num_params);
        let mut witness_tables = Vec::with_capacity(num_key.saturating_sub(num_params));
        for i in 0..num_key.max(num_params) {
            let value = Address(reader.read_word(arguments + i * w)?);
            if i < num_params {
                params.push(value);
            } else {
                witness_tables.push(value);
            }
        }
        Ok(Self {
            params,
            witness_tables,
        })
    }
}

impl Substitutions for SubstGenericParametersFromMetadata {
    fn generic_param(&self, depth: u32, index: u32) -> Option<Address> {
        if depth != 0 {
            return None;
        }
        self.params.get(index as usize).copied()
    }

    fn witness_table(&self, _type_metadata: Address, index: u32) -> Option<Address> {
        self.witness_tables.get(index as usize).copied()
    }
}

#[derive(Default)]
struct Registry {
    types: HashMap<String, Address>,
    instantiations: HashMap<(String, Vec<Address>), Address>,
    associated_types: HashMap<(Address, u32), Address>,
}

/// In-crate lookup service backed by registered metadata.
#[derive(Default)]
pub struct TypeRegistry {
    registry: RwLock<Registry>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry seeded with the type table exported alongside a snapshot.
    pub fn from_snapshot(snapshot: &MemorySnapshot) -> Self {
        let registry = Self::new();
        for entry in snapshot.types() {
            if entry.arguments.is_empty() {
                registry.register_type(&entry.mangled_name, entry.metadata);
            } else {
                registry.register_instantiation(
                    &entry.mangled_name,
                    entry.arguments.clone(),
                    entry.metadata,
                );
            }
        }
        registry
    }

    /// Registers metadata for a non-generic nominal or builtin name.
    pub fn register_type(&self, mangled_name: &str, metadata: Address) {
        self.registry
            .write()
            .types
            .insert(mangled_name.to_string(), metadata);
    }

    /// Registers metadata for the nominal type `name` (without its generic argument list)
    /// applied to `arguments`.
    pub fn register_instantiation(&self, name: &str, arguments: Vec<Address>, metadata: Address) {
        self.registry
            .write()
            .instantiations
            .insert((name.to_string(), arguments), metadata);
    }

    pub fn register_associated_type(&self, witness_table: Address, index: u32, metadata: Address) {
        self.registry
            .write()
            .associated_types
            .insert((witness_table, index), metadata);
    }

    fn resolve(
        &self,
        ty: &MangledType,
        substitutions: &dyn Substitutions,
    ) -> Result<Address, LookupError> {
        match ty {
            MangledType::Builtin(name) => self.named(name),
            MangledType::Nominal { name, arguments } if arguments.is_empty() => self.named(name),
            MangledType::Nominal { name, arguments } => {
                let arguments = arguments
                    .iter()
                    .map(|a| self.resolve(a, substitutions))
                    .collect::<Result<Vec<_>, _>>()?;
                let key = (name.clone(), arguments);
                self.registry
                    .read()
                    .instantiations
                    .get(&key)
                    .copied()
                    .ok_or_else(|| LookupError::UnknownType(ty.to_string()))
            }
            MangledType::GenericParam {
                depth,
                index,
                associated,
            } => {
                let mut current = substitutions.generic_param(*depth, *index).ok_or(
                    LookupError::UnresolvedGenericParam {
                        depth: *depth,
                        index: *index,
                    },
                )?;
                for assoc in associated {
                    let witness_table = substitutions
                        .witness_table(current, assoc.conformance)
                        .ok_or(LookupError::UnresolvedWitnessTable {
                            type_metadata: current,
                            index: assoc.conformance,
                        })?;
                    current = self
                        .registry
                        .read()
                        .associated_types
                        .get(&(witness_table, assoc.index))
                        .copied()
                        .ok_or(LookupError::UnknownAssociatedType {
                            witness_table,
                            index: assoc.index,
                        })?;
                }
                Ok(current)
            }
        }
    }

    fn named(&self, name: &str) -> Result<Address, LookupError> {
        self.registry
            .read()
            .types
            .get(name)
            .copied()
            .ok_or_else(|| LookupError::UnknownType(name.to_string()))
    }
}

impl TypeLookup for TypeRegistry {
    fn lookup_type(
        &self,
        mangled_name: &str,
        substitutions: &dyn Substitutions,
    ) -> Result<Address, LookupError> {
        let ty = MangledType::parse(mangled_name)?;
        self.resolve(&ty, substitutions)
    }
}
