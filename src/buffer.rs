use crate::{memory::AllocationTag, utils::Address};
use std::{
    fmt::{self, Debug, Formatter},
    marker::PhantomData,
};

/// Marker for buffers that point at executable code.
pub enum Code {}

/// A non-owning, typed view of memory in whichever address space a reader/writer works on.
/// `T` only records how the memory is meant to be interpreted; a buffer carries no size.
pub struct Buffer<T> {
    pub address: Address,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Buffer<T> {
    pub fn new(address: Address) -> Self {
        Self {
            address,
            _marker: PhantomData,
        }
    }

    pub fn null() -> Self {
        Self::new(Address::NULL)
    }

    pub fn is_null(&self) -> bool {
        self.address.is_null()
    }

    pub fn cast<U>(self) -> Buffer<U> {
        Buffer::new(self.address)
    }

    /// A view `bytes` past the start of this one.
    pub fn at<U>(&self, bytes: usize) -> Buffer<U> {
        Buffer::new(self.address + bytes)
    }
}

impl<T> Clone for Buffer<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Buffer<T> {}

impl<T> PartialEq for Buffer<T> {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl<T> Eq for Buffer<T> {}

impl<T> Debug for Buffer<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Buffer<{}>({})", short_type_name::<T>(), self.address)
    }
}

fn short_type_name<T>() -> &'static str {
    let name = std::any::type_name::<T>();
    name.rsplit("::").next().unwrap_or(name)
}

/// An owned allocation of known size. Reader/writers only write into a region through
/// offsets, and every write is checked against the region's bounds first.
#[derive(Debug)]
pub struct WritableRegion {
    base: Address,
    size: usize,
    tag: AllocationTag,
    written: usize,
}

impl WritableRegion {
    /// Wraps freshly allocated memory. Only reader/writers create regions.
    pub fn new(base: Address, size: usize, tag: AllocationTag) -> Self {
        Self {
            base,
            size,
            tag,
            written: 0,
        }
    }

    pub fn base(&self) -> Address {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn tag(&self) -> AllocationTag {
        self.tag
    }

    pub fn buffer<T>(&self) -> Buffer<T> {
        Buffer::new(self.base)
    }

    /// Total number of bytes written so far, counting rewrites of the same bytes again.
    pub fn bytes_written(&self) -> usize {
        self.written
    }

    /// Checks that `len` bytes at `offset` lie inside the region and records the write.
    ///
    /// A write outside the region means the builder computed a wrong offset, which would
    /// corrupt unrelated memory, so this panics instead of returning an error.
    pub fn check_write(&mut self, offset: usize, len: usize) -> Address {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => {}
            _ => panic!(
                "write of {} bytes at offset {} is outside the {} region of {} bytes at {}",
                len, offset, self.tag, self.size, self.base
            ),
        }
        self.written += len;
        self.base + offset
    }
}
