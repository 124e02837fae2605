use serde::{Deserialize, Serialize};
use std::{
    fmt::{self, Debug, Display, Formatter},
    ops::{Add, Sub},
};

/// An address in the address space a reader/writer operates on. In-process this is a
/// plain pointer value; for a memory snapshot it is an address in the inspected process.
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(pub u64);

impl Address {
    pub const NULL: Self = Address(0);

    pub fn from_ptr<T: ?Sized>(ptr: *const T) -> Self {
        Address(ptr as *const u8 as usize as u64)
    }

    pub fn as_ptr<T>(self) -> *const T {
        self.0 as usize as *const T
    }

    pub fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as usize as *mut T
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Applies a signed byte offset, as stored by relative pointers.
    pub fn offset(self, bytes: i64) -> Self {
        Address(self.0.wrapping_add_signed(bytes))
    }

    pub fn checked_sub(self, other: Address) -> Option<u64> {
        self.0.checked_sub(other.0)
    }

    pub fn is_aligned(self, align: usize) -> bool {
        self.0 % align as u64 == 0
    }
}

impl Add<usize> for Address {
    type Output = Self;
    fn add(self, rhs: usize) -> Self {
        Address(self.0.wrapping_add(rhs as u64))
    }
}

impl Sub<usize> for Address {
    type Output = Self;
    fn sub(self, rhs: usize) -> Self {
        Address(self.0.wrapping_sub(rhs as u64))
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl Debug for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Address({:#x})", self.0)
    }
}

impl From<u64> for Address {
    fn from(value: u64) -> Self {
        Address(value)
    }
}

pub fn align_up(value: usize, align: usize) -> usize {
    let misalignment = value % align;
    if misalignment == 0 {
        value
    } else {
        value + align - misalignment
    }
}

/// Renders bytes as space-separated hex words of `word_size` bytes, little-endian.
pub fn hex_words(bytes: &[u8], word_size: usize) -> String {
    bytes
        .chunks(word_size)
        .map(|chunk| {
            chunk
                .iter()
                .rev()
                .map(|b| format!("{b:02x}"))
                .collect::<String>()
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 8), 0);
        assert_eq!(align_up(1, 8), 8);
        assert_eq!(align_up(8, 8), 8);
        assert_eq!(align_up(13, 4), 16);
    }

    #[test]
    fn test_address_offset() {
        let base = Address(0x1000);
        assert_eq!(base.offset(-0x10), Address(0xff0));
        assert_eq!(base.offset(0x24), Address(0x1024));
        assert_eq!((base + 8).checked_sub(base), Some(8));
        assert_eq!(base.checked_sub(base + 1), None);
    }

    #[test]
    fn test_hex_words() {
        let bytes = [0x01, 0x02, 0x03, 0x04, 0xaa, 0xbb, 0xcc, 0xdd];
        assert_eq!(hex_words(&bytes, 4), "04030201 ddccbbaa");
    }
}
