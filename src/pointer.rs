//! Pointer shapes.
//!
//! Every pointer-valued field in a descriptor, pattern or record has one fixed shape, declared
//! next to the field's offset in [`crate::abi`]. Reader/writers resolve a location by shape; the
//! shape is never guessed from the stored bits.
use crate::utils::Address;

/// Shape of a pointer to data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PointerKind {
    /// A pointer-sized word holding the target address.
    Absolute,
    /// A 32-bit signed offset from the field's own address to the target. A nullable field
    /// stores zero for "no target".
    RelativeDirect { nullable: bool },
    /// A 32-bit signed offset from the field's own address to a pointer-sized word holding
    /// the target address.
    RelativeIndirect { nullable: bool },
}

impl PointerKind {
    pub const RELATIVE: Self = PointerKind::RelativeDirect { nullable: false };
    pub const RELATIVE_NULLABLE: Self = PointerKind::RelativeDirect { nullable: true };
    pub const INDIRECT: Self = PointerKind::RelativeIndirect { nullable: false };

    /// Bytes occupied by the field itself.
    pub fn stored_size(self, pointer_size: usize) -> usize {
        match self {
            PointerKind::Absolute => pointer_size,
            PointerKind::RelativeDirect { .. } | PointerKind::RelativeIndirect { .. } => 4,
        }
    }

    pub fn is_nullable(self) -> bool {
        match self {
            PointerKind::Absolute => true,
            PointerKind::RelativeDirect { nullable }
            | PointerKind::RelativeIndirect { nullable } => nullable,
        }
    }
}

/// Shape of a pointer to executable code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FunctionPointerKind {
    /// A pointer-sized word holding the code address.
    Absolute,
    /// A 32-bit signed offset from the field's own address to the code.
    Compact { nullable: bool },
}

impl FunctionPointerKind {
    pub fn stored_size(self, pointer_size: usize) -> usize {
        match self {
            FunctionPointerKind::Absolute => pointer_size,
            FunctionPointerKind::Compact { .. } => 4,
        }
    }
}

/// A pointer field at a fixed offset inside some structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PointerField {
    pub offset: usize,
    pub kind: PointerKind,
}

impl PointerField {
    pub const fn new(offset: usize, kind: PointerKind) -> Self {
        Self { offset, kind }
    }
}

/// Target of a relative offset stored at `location`, or `None` for a nullable zero.
pub fn relative_target(location: Address, offset: i32, nullable: bool) -> Option<Address> {
    if offset == 0 && nullable {
        None
    } else {
        Some(location.offset(offset as i64))
    }
}

/// The 32-bit offset that makes a relative pointer at `location` refer to `target`, if it fits.
pub fn relative_offset(location: Address, target: Address) -> Option<i32> {
    let delta = (target.0 as i128) - (location.0 as i128);
    i32::try_from(delta).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_target() {
        let at = Address(0x2000);
        assert_eq!(relative_target(at, -0x100, false), Some(Address(0x1f00)));
        assert_eq!(relative_target(at, 0, true), None);
        // A non-nullable zero offset points at the field itself.
        assert_eq!(relative_target(at, 0, false), Some(at));
    }

    #[test]
    fn test_relative_offset_range() {
        let at = Address(0x1_0000_0000);
        assert_eq!(relative_offset(at, Address(0x1_0000_0010)), Some(0x10));
        assert_eq!(relative_offset(at, Address(0xffff_fff0)), Some(-0x10));
        assert_eq!(relative_offset(at, Address(0x3_0000_0000)), None);
    }

    #[test]
    fn test_stored_sizes() {
        assert_eq!(PointerKind::Absolute.stored_size(8), 8);
        assert_eq!(PointerKind::INDIRECT.stored_size(8), 4);
        assert_eq!(FunctionPointerKind::Compact { nullable: false }.stored_size(8), 4);
        assert!(PointerKind::RELATIVE_NULLABLE.is_nullable());
        assert!(!PointerKind::RELATIVE.is_nullable());
    }
}
