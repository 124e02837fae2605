use bumpalo::Bump;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    alloc::Layout,
    collections::HashMap,
    fmt::{self, Display, Formatter},
    mem::align_of,
    ptr::NonNull,
};

pub mod snapshot;

/// What an allocation is for. Tags exist so allocations can be attributed when inspecting
/// memory use or a snapshot of another process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AllocationTag {
    GenericValueMetadata,
    ValueWitnessTable,
}

impl AllocationTag {
    pub fn name(self) -> &'static str {
        match self {
            AllocationTag::GenericValueMetadata => "generic value metadata",
            AllocationTag::ValueWitnessTable => "value witness table",
        }
    }
}

impl Display for AllocationTag {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TagStats {
    pub allocations: usize,
    pub bytes: usize,
}

struct ArenaState {
    bump: Bump,
    stats: HashMap<AllocationTag, TagStats>,
}

/// Arena allocator for metadata. Memory is never freed individually; everything handed out
/// stays valid until the allocator is dropped, which is what lets built records outlive the
/// reader/writer that produced them.
pub struct MetadataAllocator {
    state: Mutex<ArenaState>,
}

impl Default for MetadataAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl MetadataAllocator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ArenaState {
                bump: Bump::new(),
                stats: HashMap::new(),
            }),
        }
    }

    /// Caps the total number of bytes the arena may obtain from the system.
    pub fn with_limit(limit: usize) -> Self {
        let allocator = Self::new();
        allocator.state.lock().bump.set_allocation_limit(Some(limit));
        allocator
    }

    /// Allocates `size` zeroed, pointer-aligned bytes. Returns `None` when the arena is
    /// exhausted.
    pub fn allocate(&self, size: usize, tag: AllocationTag) -> Option<NonNull<u8>> {
        let layout = Layout::from_size_align(size.max(1), align_of::<usize>()).ok()?;
        let mut state = self.state.lock();
        let ptr = state.bump.try_alloc_layout(layout).ok()?;
        // SAFETY: `ptr` was just allocated with room for `layout.size()` bytes.
        unsafe { ptr.as_ptr().write_bytes(0, layout.size()) };

        let stats = state.stats.entry(tag).or_default();
        stats.allocations += 1;
        stats.bytes += size;
        Some(ptr)
    }

    pub fn stats(&self, tag: AllocationTag) -> TagStats {
        self.state
            .lock()
            .stats
            .get(&tag)
            .copied()
            .unwrap_or_default()
    }

    pub fn allocated_bytes(&self) -> usize {
        self.state.lock().bump.allocated_bytes()
    }
}
