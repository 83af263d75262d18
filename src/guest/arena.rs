//! Scoped bump allocation inside guest memory.
//!
//! Everything the host needs to place in the guest's address space, from
//! strings and scratch structs to audio buffers and host tables, comes out of an
//! [`Arena`]: a region obtained once via the guest's `malloc` and then carved
//! up with cheap watermark bumps. Reservations are made through a
//! [`ArenaScope`]; dropping the scope reclaims them, committing it freezes
//! them until the arena goes back to its [`ArenaPool`].

use std::sync::Arc;

use super::pointer::{GuestPtr, GuestValue};
use super::GuestInstance;

/// Default size of a freshly malloc'd arena block.
pub const DEFAULT_BLOCK_BYTES: u32 = 64 * 1024;

/// A position inside an arena: which block, and the watermark within it. Ordered by allocation
/// time, so a later mark always compares greater.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Mark {
    block: usize,
    offset: u32,
}

const MARK_ZERO: Mark = Mark {
    block: 0,
    offset: 0,
};

#[derive(Debug)]
struct Block {
    base: u32,
    capacity: u32,
}

/// Owns a set of arenas so that guest-side regions are recycled instead of leaked: guest `malloc`
/// has no matching `free`, so blocks live for the lifetime of the module and the pool hands them
/// from one owner to the next.
#[derive(Debug)]
pub struct ArenaPool {
    instance: Arc<GuestInstance>,
    unused: Vec<Arena>,
}

impl ArenaPool {
    pub fn new(instance: Arc<GuestInstance>) -> Self {
        ArenaPool {
            instance,
            unused: Vec::new(),
        }
    }

    /// Take an unused arena, or create a fresh one. The caller owns it until it is
    /// [`reclaim()`][Self::reclaim()]ed.
    pub fn get_or_create(&mut self) -> Arena {
        self.unused
            .pop()
            .unwrap_or_else(|| Arena::new(self.instance.clone()))
    }

    /// Reset an arena (dropping every commitment) and park it for reuse.
    pub fn reclaim(&mut self, mut arena: Arena) {
        arena.reset();
        self.unused.push(arena);
    }

    /// How many arenas are currently parked.
    pub fn idle_count(&self) -> usize {
        self.unused.len()
    }
}

/// A bump allocator over one or more guest-memory blocks. Blocks are only added when a
/// reservation doesn't fit the current one; they stay allocated (and get reused) for the arena's
/// lifetime.
#[derive(Debug)]
pub struct Arena {
    instance: Arc<GuestInstance>,
    blocks: Vec<Block>,
    mark: Mark,
    /// Stack of committed watermarks. The top is the floor no rewind may cross; entries below it
    /// record the commit depths callers can later reset to.
    committed: Vec<Mark>,
}

impl Arena {
    fn new(instance: Arc<GuestInstance>) -> Self {
        Arena {
            instance,
            blocks: Vec::new(),
            mark: MARK_ZERO,
            committed: Vec::new(),
        }
    }

    pub fn instance(&self) -> &Arc<GuestInstance> {
        &self.instance
    }

    /// Open a scope. Reservations made through it are reclaimed when it drops, unless it is
    /// committed first.
    pub fn scoped(&mut self) -> ArenaScope<'_> {
        ArenaScope {
            base: self.mark,
            arena: self,
            committed: false,
        }
    }

    /// The number of commits currently frozen in this arena.
    pub fn commit_depth(&self) -> usize {
        self.committed.len()
    }

    /// Drop every commitment above `depth` and rewind the watermark to the remaining top. Used to
    /// throw away a previous `start()` generation while keeping the per-plugin tables committed
    /// at creation time.
    pub fn reset_to_commit(&mut self, depth: usize) {
        self.committed.truncate(depth);
        self.mark = self.committed.last().copied().unwrap_or(MARK_ZERO);
    }

    /// Back to completely empty (all commitments dropped, blocks kept for reuse).
    pub fn reset(&mut self) {
        self.reset_to_commit(0);
    }

    fn floor(&self) -> Mark {
        self.committed.last().copied().unwrap_or(MARK_ZERO)
    }

    fn rewind(&mut self, to: Mark) {
        self.mark = to.max(self.floor()).min(self.mark);
    }

    /// Advance the watermark by an aligned `size` bytes, growing into a new block when needed.
    /// Returns null when the guest is out of memory.
    fn reserve(&mut self, size: u32, align: u32) -> GuestPtr<u8> {
        let align = align.max(1);

        // Try the current block, then any later blocks left over from a previous generation
        while self.mark.block < self.blocks.len() {
            let block = &self.blocks[self.mark.block];
            let address = (block.base + self.mark.offset + (align - 1)) & !(align - 1);
            let offset = address - block.base;
            if offset + size <= block.capacity {
                self.mark.offset = offset + size;
                return GuestPtr::from_address(address);
            }
            self.mark = Mark {
                block: self.mark.block + 1,
                offset: 0,
            };
        }

        // A new block, at least twice the previous one so repeated overflows settle quickly
        let previous = self.blocks.last().map(|block| block.capacity).unwrap_or(0);
        let capacity = (previous * 2).max(DEFAULT_BLOCK_BYTES).max(size + align);
        let base = self.instance.malloc(capacity).address();
        if base == 0 {
            log::error!("Guest malloc({capacity}) failed, arena reservation dropped");
            return GuestPtr::null();
        }

        self.blocks.push(Block { base, capacity });
        self.mark = Mark {
            block: self.blocks.len() - 1,
            offset: 0,
        };

        let address = (base + (align - 1)) & !(align - 1);
        self.mark.offset = (address - base) + size;
        GuestPtr::from_address(address)
    }
}

/// A scoped view of an [`Arena`]. Scopes nest strictly: an inner scope borrows the outer one, so
/// the type system enforces the LIFO discipline.
#[derive(Debug)]
pub struct ArenaScope<'a> {
    arena: &'a mut Arena,
    base: Mark,
    committed: bool,
}

impl Drop for ArenaScope<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.arena.rewind(self.base);
        }
    }
}

impl ArenaScope<'_> {
    pub fn instance(&self) -> &Arc<GuestInstance> {
        &self.arena.instance
    }

    /// Reserve `size` bytes aligned to `align`.
    pub fn reserve(&mut self, size: u32, align: u32) -> GuestPtr<u8> {
        self.arena.reserve(size, align)
    }

    /// Reserve an array of `count` elements of `T`, aligned for `T`.
    pub fn array<T: GuestValue>(&mut self, count: u32) -> GuestPtr<T> {
        self.reserve(
            count.wrapping_mul(std::mem::size_of::<T>() as u32),
            std::mem::align_of::<T>() as u32,
        )
        .cast()
    }

    /// Copy `bytes` into guest memory.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> GuestPtr<u8> {
        let ptr = self.reserve(bytes.len() as u32, 1);
        if !ptr.is_null() {
            self.arena.instance.set_array(ptr, bytes);
        }
        ptr
    }

    /// Copy a string into guest memory as a NUL-terminated C string.
    pub fn write_str(&mut self, string: &str) -> GuestPtr<u8> {
        let ptr = self.reserve(string.len() as u32 + 1, 1);
        if !ptr.is_null() {
            self.arena.instance.set_array(ptr, string.as_bytes());
            self.arena.instance.set_at(ptr, 0u8, string.len() as u32);
        }
        ptr
    }

    /// Copy a C string (NUL included) into guest memory.
    pub fn write_cstr(&mut self, string: &std::ffi::CStr) -> GuestPtr<u8> {
        self.write_bytes(string.to_bytes_with_nul())
    }

    /// Serialize one `T` into guest memory, aligned for `T`.
    pub fn copy_across<T: GuestValue>(&mut self, value: &T) -> GuestPtr<T> {
        let ptr = self
            .reserve(
                std::mem::size_of::<T>() as u32,
                std::mem::align_of::<T>() as u32,
            )
            .cast::<T>();
        if !ptr.is_null() {
            self.arena.instance.set(ptr, *value);
        }
        ptr
    }

    /// Open a nested scope.
    pub fn scoped(&mut self) -> ArenaScope<'_> {
        self.arena.scoped()
    }

    /// Freeze everything reserved up to this point. The region stays reserved until the arena is
    /// reset or returned to its pool; the commit also shields it from any enclosing scope's
    /// rewind.
    pub fn commit(mut self) {
        self.arena.committed.push(self.arena.mark);
        self.committed = true;
    }
}
