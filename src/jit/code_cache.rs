//! Code cache: one executable mapping shared by every target method.
//!
//! Keeping all compiled code inside a single reservation keeps every direct
//! call within rel32 range. The first bytes hold the resolution trampoline
//! that unlinked call sites point at.

use std::fmt;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use super::HostAssembler;
use super::masm::MachineAssembler;
use super::memory::{ExecutableMemory, MemoryError};
use super::runtime_calls::{RuntimeCall, RuntimeCallTable};
use crate::error::CompileError;

/// Allocation granularity; also the alignment of every chunk.
pub const CHUNK_ALIGNMENT: usize = 16;

/// Bytes reserved at the start of the cache for the trampoline.
const TRAMPOLINE_RESERVE: usize = 64;

fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

#[derive(Debug)]
struct CacheState {
    /// Free `(offset, len)` chunks sorted by offset and coalesced.
    free: Vec<(usize, usize)>,
    used: usize,
}

pub struct CodeCache {
    memory: ExecutableMemory,
    state: Mutex<CacheState>,
}

impl CodeCache {
    /// Map a cache of at least `capacity` bytes and install the trampoline.
    pub fn new(capacity: usize, runtime: &RuntimeCallTable) -> Result<Arc<Self>, CompileError> {
        let memory = ExecutableMemory::new(capacity.max(TRAMPOLINE_RESERVE * 2))?;

        let mut asm = HostAssembler::default();
        asm.emit_trampoline(runtime.address(RuntimeCall::UnresolvedCall));
        let trampoline = asm.finish()?.code;
        debug_assert!(trampoline.len() <= TRAMPOLINE_RESERVE);
        // The mapping is not shared with anyone yet.
        unsafe { memory.write(0, &trampoline)? };

        let size = memory.size();
        debug!(capacity = size, "code cache mapped at {:#x}", memory.as_ptr() as usize);
        Ok(Arc::new(CodeCache {
            memory,
            state: Mutex::new(CacheState {
                free: vec![(TRAMPOLINE_RESERVE, size - TRAMPOLINE_RESERVE)],
                used: TRAMPOLINE_RESERVE,
            }),
        }))
    }

    pub fn base_address(&self) -> usize {
        self.memory.as_ptr() as usize
    }

    pub fn trampoline_address(&self) -> usize {
        self.base_address()
    }

    pub fn capacity(&self) -> usize {
        self.memory.size()
    }

    pub fn used(&self) -> usize {
        self.lock_state().used
    }

    pub fn available(&self) -> usize {
        self.capacity() - self.used()
    }

    pub fn contains(&self, address: usize) -> bool {
        address >= self.base_address() && address < self.base_address() + self.capacity()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, CacheState> {
        // A panic while holding this lock cannot leave the free list torn:
        // every update is a single Vec operation.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Carve a chunk of at least `size` bytes (first fit).
    pub fn allocate(self: &Arc<Self>, size: usize) -> Result<CodeRegion, CompileError> {
        let len = align_up(size.max(1), CHUNK_ALIGNMENT);
        let mut state = self.lock_state();

        let Some(slot) = state.free.iter().position(|&(_, free_len)| free_len >= len) else {
            let available = self.memory.size() - state.used;
            warn!(requested = len, available, "code cache exhausted");
            return Err(CompileError::CodeCacheFull {
                requested: len,
                available,
            });
        };

        let (offset, free_len) = state.free[slot];
        if free_len == len {
            state.free.remove(slot);
        } else {
            state.free[slot] = (offset + len, free_len - len);
        }
        state.used += len;

        Ok(CodeRegion {
            cache: Arc::clone(self),
            offset,
            len,
        })
    }

    fn release(&self, offset: usize, len: usize) {
        let mut state = self.lock_state();
        state.used -= len;

        let at = state.free.partition_point(|&(free_offset, _)| free_offset < offset);
        state.free.insert(at, (offset, len));

        // Coalesce with the following chunk, then with the preceding one.
        if at + 1 < state.free.len() && state.free[at].0 + state.free[at].1 == state.free[at + 1].0 {
            state.free[at].1 += state.free[at + 1].1;
            state.free.remove(at + 1);
        }
        if at > 0 && state.free[at - 1].0 + state.free[at - 1].1 == state.free[at].0 {
            state.free[at - 1].1 += state.free[at].1;
            state.free.remove(at);
        }
    }
}

impl fmt::Debug for CodeCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodeCache")
            .field("base", &format_args!("{:#x}", self.base_address()))
            .field("capacity", &self.capacity())
            .field("used", &self.used())
            .finish()
    }
}

/// A chunk of the code cache owned by one target method; returned to the
/// cache on drop.
pub struct CodeRegion {
    cache: Arc<CodeCache>,
    offset: usize,
    len: usize,
}

impl CodeRegion {
    pub fn address(&self) -> usize {
        self.cache.base_address() + self.offset
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn cache(&self) -> &Arc<CodeCache> {
        &self.cache
    }

    /// Copy bytes into the region before it is published.
    pub fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), MemoryError> {
        if offset + data.len() > self.len {
            return Err(MemoryError::InvalidSize);
        }
        // `&mut self` means nobody else can reach this chunk yet.
        unsafe { self.cache.memory.write(self.offset + offset, data) }
    }

    /// Current contents, including any patches applied since publication.
    pub fn bytes(&self) -> &[u8] {
        self.cache
            .memory
            .read(self.offset, self.len)
            .unwrap_or_default()
    }
}

impl Drop for CodeRegion {
    fn drop(&mut self) {
        self.cache.release(self.offset, self.len);
    }
}

impl fmt::Debug for CodeRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CodeRegion({:#x}, {} bytes)", self.address(), self.len)
    }
}
