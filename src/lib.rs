//! Fixed-capacity buddy allocator over a caller-supplied arena.
//!
//! A [`Heap`] carves one contiguous byte region into power-of-two blocks
//! tracked by an implicit complete binary tree. The tree's per-node state
//! lives inside the arena itself, so the allocator needs no memory beyond
//! what the caller hands it.
//!
//! ```rust,ignore
//! let arena = geminus::MmapArena::new(4 << 20).unwrap();
//! let mut heap = unsafe { geminus::Heap::init(arena.as_ptr(), 2_097_152) }?;
//! let p = heap.alloc(4096).unwrap();
//! heap.free(p.as_ptr())?;
//! assert_eq!(heap.teardown(), 0);
//! ```

#![allow(clippy::missing_safety_doc)]

use core::{
  fmt,
  mem::size_of,
  ptr::{self, NonNull},
  sync::atomic::{AtomicU64, Ordering},
};

use bitflags::bitflags;
use log::{debug, trace, warn};

// =============================================================================
// Constants
// =============================================================================

/// Granularity of the buddy tree. Leaf blocks are exactly this large.
const SMALLEST_BLOCK: usize = 64;

/// Bytes prefixed to every user allocation.
const HEADER_SIZE: usize = size_of::<BlockHeader>();

/// Base value for header stamps ("GEMINUS!"). Each `init` mixes in a fresh
/// epoch so pointers from a torn-down heap never validate against a new one.
const STAMP_SEED: u64 = 0x4745_4D49_4E55_5321;

/// Monotonic counter of `Heap::init` calls, mixed into every stamp.
static INIT_EPOCH: AtomicU64 = AtomicU64::new(0);

// =============================================================================
// Compile-Time Assertions
// =============================================================================

const _: () = assert!(SMALLEST_BLOCK.is_power_of_two());
const _: () = assert!(HEADER_SIZE == 16);
const _: () = assert!(HEADER_SIZE * 2 <= SMALLEST_BLOCK);
const _: () = assert!(size_of::<NodeFlags>() == 1);

// =============================================================================
// Types
// =============================================================================

bitflags! {
  /// State of one tree node. A node with neither flag set is partially used:
  /// at least one descendant is claimed and at least one still has room.
  #[derive(Clone, Copy, PartialEq, Eq, Debug)]
  struct NodeFlags: u8 {
    /// The node's entire subtree is unclaimed.
    const FREE = 1 << 0;
    /// The node's subtree has no remaining capacity. Exact, leaf to root.
    const FULL = 1 << 1;
  }
}

/// In-band record at the start of every user block.
#[repr(C)]
#[derive(Clone, Copy)]
struct BlockHeader {
  /// `STAMP_SEED ^ epoch` of the owning heap.
  stamp: u64,
  /// Index of the tree node this block was claimed from.
  node: u64,
}

/// Whether a claim carries a user header or is an internal reservation.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Claim {
  Internal,
  User,
}

/// Failures reported by [`Heap::init`] and [`Heap::free`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum HeapError {
  /// The arena cannot host its own bookkeeping and padding reservations.
  ArenaTooSmall,
  /// The pointer does not reference the data segment.
  OutOfRange,
  /// The bytes preceding the pointer are not a live allocation header.
  BadHeader,
}

impl fmt::Display for HeapError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      HeapError::ArenaTooSmall => write!(f, "arena cannot host allocator bookkeeping"),
      HeapError::OutOfRange => write!(f, "pointer does not reference the data segment"),
      HeapError::BadHeader => write!(f, "pointer is not preceded by a live allocation header"),
    }
  }
}

impl std::error::Error for HeapError {}

// =============================================================================
// Platform
// =============================================================================

unsafe fn os_mmap(size: usize) -> *mut u8 {
  let ptr = unsafe {
    libc::mmap(
      ptr::null_mut(),
      size,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
      -1,
      0,
    )
  };

  if ptr == libc::MAP_FAILED {
    ptr::null_mut()
  } else {
    ptr as *mut u8
  }
}

unsafe fn os_munmap(ptr: *mut u8, size: usize) {
  unsafe { libc::munmap(ptr.cast(), size) };
}

/// Owned, page-aligned memory region suitable as a [`Heap`] arena.
pub struct MmapArena {
  base: *mut u8,
  len: usize,
}

impl MmapArena {
  /// Maps `len` zeroed bytes. Returns `None` when the mapping fails.
  pub fn new(len: usize) -> Option<MmapArena> {
    if len == 0 {
      return None;
    }
    let base = unsafe { os_mmap(len) };
    if base.is_null() {
      None
    } else {
      Some(MmapArena { base, len })
    }
  }

  pub fn as_ptr(&self) -> *mut u8 {
    self.base
  }

  pub fn len(&self) -> usize {
    self.len
  }

  pub fn is_empty(&self) -> bool {
    self.len == 0
  }
}

impl Drop for MmapArena {
  fn drop(&mut self) {
    unsafe { os_munmap(self.base, self.len) };
  }
}

unsafe impl Send for MmapArena {}

// =============================================================================
// Heap
// =============================================================================

/// Buddy allocator over one caller-owned arena.
///
/// The data segment is the capacity rounded up to a power of two; the bytes
/// the rounding invented are pinned by permanent internal reservations, and
/// the node-state table is claimed out of the same tree, so every address the
/// heap ever returns lies inside `[arena, arena + capacity)`.
pub struct Heap {
  /// Arena origin, owned by the caller for the heap's whole lifetime.
  base: *mut u8,
  /// Node-state table, one byte per tree node, resident inside the arena.
  meta: *mut u8,
  /// Power-of-two size of the virtual data segment.
  data_size: usize,
  /// Bytes of the data segment pinned below `base` by padding reservations.
  shift: usize,
  /// Total tree nodes: `2 * leaf_count - 1`.
  node_count: usize,
  /// Bytes occupied by the node-state table.
  meta_size: usize,
  /// Outstanding user allocations.
  live: usize,
  /// Stamp written into every header issued by this heap instance.
  stamp: u64,
}

unsafe impl Send for Heap {}

impl Heap {
  /// Builds a heap managing `capacity` bytes starting at `base`.
  ///
  /// # Safety
  ///
  /// `base` must point to at least `capacity` bytes of readable, writable
  /// memory that nothing else touches until the heap is torn down or dropped.
  pub unsafe fn init(base: *mut u8, capacity: usize) -> Result<Heap, HeapError> {
    if base.is_null() || capacity == 0 {
      return Err(HeapError::ArenaTooSmall);
    }
    let data_size = capacity
      .checked_next_power_of_two()
      .ok_or(HeapError::ArenaTooSmall)?;
    if data_size < SMALLEST_BLOCK {
      return Err(HeapError::ArenaTooSmall);
    }

    let leaf_count = data_size / SMALLEST_BLOCK;
    let node_count = 2 * leaf_count - 1;
    let epoch = INIT_EPOCH.fetch_add(1, Ordering::Relaxed);

    // The node table is built at the arena origin and relocated once it has
    // claimed its own block out of the tree.
    let mut heap = Heap {
      base,
      meta: base,
      data_size,
      shift: 0,
      node_count,
      meta_size: node_count * size_of::<NodeFlags>(),
      live: 0,
      stamp: STAMP_SEED ^ epoch,
    };
    unsafe { ptr::write_bytes(heap.meta, 0, heap.meta_size) };
    heap.set_flags(0, NodeFlags::FREE);

    heap.reserve_padding(data_size - capacity)?;
    heap.claim_metadata()?;

    debug!(
      "heap up: capacity={} data_size={} shift={} nodes={} meta={}B",
      capacity, heap.data_size, heap.shift, heap.node_count, heap.meta_size,
    );
    Ok(heap)
  }

  /// Returns a block usable for at least `size` bytes, or `None` when the
  /// request is empty, oversized, or no block can currently satisfy it.
  pub fn alloc(&mut self, size: usize) -> Option<NonNull<u8>> {
    if size == 0 || size > self.data_size {
      return None;
    }
    let index = self.claim(0, size, Claim::User)?;
    let offset = self.node_offset(index);
    debug_assert!(offset >= self.shift);

    let block = unsafe { self.base.add(offset - self.shift) };
    let header = BlockHeader {
      stamp: self.stamp,
      node: index as u64,
    };
    unsafe { block.cast::<BlockHeader>().write_unaligned(header) };

    trace!("alloc {} -> node {}", size, index);
    NonNull::new(unsafe { block.add(HEADER_SIZE) })
  }

  /// Releases a block previously returned by [`alloc`](Heap::alloc).
  ///
  /// Anything else (including offset pointers and pointers whose block was
  /// already freed) is rejected without mutating allocator state.
  pub fn free(&mut self, ptr: *mut u8) -> Result<(), HeapError> {
    let addr = ptr as usize;
    let base = self.base as usize;
    if addr < base + HEADER_SIZE || addr >= base + (self.data_size - self.shift) {
      return Err(HeapError::OutOfRange);
    }

    // Re-derive the header location from our own base so the read stays
    // inside the arena regardless of what `ptr` is.
    let header = unsafe {
      self
        .base
        .add(addr - base - HEADER_SIZE)
        .cast::<BlockHeader>()
        .read_unaligned()
    };
    if header.stamp != self.stamp {
      return Err(HeapError::BadHeader);
    }
    let index = header.node as usize;
    if index >= self.node_count || !self.is_full(index) || self.is_free(index) {
      return Err(HeapError::BadHeader);
    }
    // The named node must map back to exactly this pointer.
    let offset = self.node_offset(index);
    if offset < self.shift || base + (offset - self.shift) + HEADER_SIZE != addr {
      return Err(HeapError::BadHeader);
    }

    self.live -= 1;
    self.release(index);
    trace!("free node {}", index);
    Ok(())
  }

  /// Consumes the heap and reports how many allocations were never freed.
  /// Outstanding pointers stay in the caller's arena but must not be used.
  pub fn teardown(mut self) -> usize {
    let pending = self.live;
    self.live = 0;
    pending
  }

  /// Outstanding user allocations.
  pub fn live(&self) -> usize {
    self.live
  }

  /// Size of the power-of-two data segment the tree subdivides.
  pub fn data_segment_size(&self) -> usize {
    self.data_size
  }

  /// Whether `ptr` lies inside the addressable part of the data segment.
  pub fn contains(&self, ptr: *const u8) -> bool {
    let addr = ptr as usize;
    let base = self.base as usize;
    addr >= base && addr < base + (self.data_size - self.shift)
  }
}

// Bootstrap.
impl Heap {
  /// Pins the bytes invented by rounding the capacity up to a power of two.
  ///
  /// Claims the largest power-of-two chunk that still fits the remainder,
  /// repeatedly, until the whole surplus is reserved. Each claimed chunk
  /// moves the logical start of the data segment one chunk below the arena
  /// origin, so usable addresses begin exactly at `base`.
  fn reserve_padding(&mut self, extra: usize) -> Result<(), HeapError> {
    let mut remaining = extra;
    while remaining > 0 {
      let chunk = prev_power_of_two(remaining);
      if self.claim(0, chunk, Claim::Internal).is_none() {
        return Err(HeapError::ArenaTooSmall);
      }
      remaining -= chunk;
      self.shift += chunk;
    }
    Ok(())
  }

  /// Claims a block for the node table and moves the table into it.
  ///
  /// Padding chunks smaller than a leaf still consume whole leaf blocks, so
  /// the claimed block can start past the arena origin where the table was
  /// bootstrapped; the copy must tolerate overlap.
  fn claim_metadata(&mut self) -> Result<(), HeapError> {
    let index = self
      .claim(0, self.meta_size, Claim::Internal)
      .ok_or(HeapError::ArenaTooSmall)?;
    let offset = self.node_offset(index);
    debug_assert!(offset >= self.shift);

    let target = unsafe { self.base.add(offset - self.shift) };
    if target != self.meta {
      unsafe { ptr::copy(self.meta, target, self.meta_size) };
      self.meta = target;
    }
    Ok(())
  }
}

// Claim path: recursive descent with left-first splitting.
impl Heap {
  /// Finds and claims a block of at least `size` bytes under `index`.
  /// Returns the claimed node, or `None` when the subtree has no room.
  fn claim(&mut self, index: usize, size: usize, kind: Claim) -> Option<usize> {
    if self.is_full(index) {
      return None;
    }

    let block = self.node_block_size(index);
    let overhead = match kind {
      Claim::User => HEADER_SIZE,
      Claim::Internal => 0,
    };
    let usable_half = block / 2 - overhead / 2;
    let need = size + overhead;

    // Take this block whole when splitting is impossible or could not help.
    if need > usable_half || block <= SMALLEST_BLOCK {
      if !self.is_free(index) {
        return None;
      }
      self.set_flags(index, NodeFlags::FULL);
      if block > SMALLEST_BLOCK {
        // Children are consumed as part of the whole claim.
        self.set_flags(2 * index + 1, NodeFlags::empty());
        self.set_flags(2 * index + 2, NodeFlags::empty());
      }
      if kind == Claim::User {
        self.live += 1;
      }
      return Some(index);
    }

    let left = 2 * index + 1;
    let right = left + 1;

    // First carve out of a wholly free block materializes the split.
    if self.is_free(index) {
      self.set_flags(left, NodeFlags::FREE);
      self.set_flags(right, NodeFlags::FREE);
    }

    let claimed = match self.claim(left, size, kind) {
      Some(node) => Some(node),
      None => self.claim(right, size, kind),
    };

    if claimed.is_some() {
      let mut state = NodeFlags::empty();
      if self.is_full(left) && self.is_full(right) {
        state |= NodeFlags::FULL;
      }
      self.set_flags(index, state);
    }
    claimed
  }
}

// Release path: sibling coalescing, then ancestor capacity repair.
impl Heap {
  fn release(&mut self, mut index: usize) {
    while index != 0 {
      let parent = (index - 1) / 2;
      let sibling = if index % 2 == 0 { index - 1 } else { index + 1 };

      if self.is_free(sibling) {
        // Both halves unclaimed: fold them back into the parent block.
        self.set_flags(index, NodeFlags::empty());
        self.set_flags(sibling, NodeFlags::empty());
        self.set_flags(parent, NodeFlags::FREE);
        index = parent;
        continue;
      }

      // Sibling still holds allocations. This block becomes free on its own,
      // and every ancestor regains capacity without becoming wholly free.
      self.set_flags(index, NodeFlags::FREE);
      self.clear_full_to_root(parent);
      return;
    }
  }

  fn clear_full_to_root(&mut self, mut index: usize) {
    loop {
      let state = self.flags(index);
      self.set_flags(index, state - NodeFlags::FULL);
      if index == 0 {
        return;
      }
      index = (index - 1) / 2;
    }
  }
}

// Node-state table and tree geometry.
impl Heap {
  #[inline]
  fn flags(&self, index: usize) -> NodeFlags {
    assert!(index < self.node_count);
    NodeFlags::from_bits_truncate(unsafe { self.meta.add(index).read() })
  }

  #[inline]
  fn set_flags(&mut self, index: usize, state: NodeFlags) {
    assert!(index < self.node_count);
    unsafe { self.meta.add(index).write(state.bits()) };
  }

  #[inline]
  fn is_free(&self, index: usize) -> bool {
    self.flags(index).contains(NodeFlags::FREE)
  }

  #[inline]
  fn is_full(&self, index: usize) -> bool {
    self.flags(index).contains(NodeFlags::FULL)
  }

  /// Byte size of the block a node represents.
  #[inline]
  fn node_block_size(&self, index: usize) -> usize {
    self.data_size >> depth_of(index)
  }

  /// Byte offset of a node's block within the virtual data segment.
  #[inline]
  fn node_offset(&self, index: usize) -> usize {
    let depth = depth_of(index);
    ((index + 1) - (1usize << depth)) * (self.data_size >> depth)
  }
}

impl Drop for Heap {
  fn drop(&mut self) {
    if self.live > 0 {
      warn!("heap dropped with {} live allocation(s)", self.live);
    }
  }
}

impl fmt::Debug for Heap {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Heap")
      .field("data_size", &self.data_size)
      .field("shift", &self.shift)
      .field("nodes", &self.node_count)
      .field("live", &self.live)
      .finish()
  }
}

// =============================================================================
// C API (enabled with --features c_api)
// =============================================================================

#[cfg(feature = "c_api")]
static ACTIVE: std::sync::Mutex<Option<Heap>> = std::sync::Mutex::new(None);

#[cfg(feature = "c_api")]
fn active() -> std::sync::MutexGuard<'static, Option<Heap>> {
  ACTIVE.lock().unwrap_or_else(|e| e.into_inner())
}

/// Establishes the process-wide heap over `pool`.
#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn heap_init(pool: *mut u8, size: usize) -> bool {
  match unsafe { Heap::init(pool, size) } {
    Ok(heap) => {
      *active() = Some(heap);
      true
    }
    Err(_) => false,
  }
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn heap_alloc(size: usize) -> *mut u8 {
  match active().as_mut().and_then(|heap| heap.alloc(size)) {
    Some(ptr) => ptr.as_ptr(),
    None => ptr::null_mut(),
  }
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn heap_free(ptr: *mut u8) -> bool {
  active().as_mut().is_some_and(|heap| heap.free(ptr).is_ok())
}

/// Tears down the process-wide heap, writing the count of never-freed
/// allocations through `pending` when it is non-null.
#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn heap_done(pending: *mut usize) {
  let count = active().take().map(Heap::teardown).unwrap_or(0);
  if !pending.is_null() {
    unsafe { *pending = count };
  }
}

// =============================================================================
// Utils
// =============================================================================

/// Largest power of two that is `<= x`. `x` must be nonzero.
#[inline(always)]
const fn prev_power_of_two(x: usize) -> usize {
  1 << (usize::BITS - 1 - x.leading_zeros())
}

/// Depth of a node in the implicit tree; the root sits at depth 0.
#[inline(always)]
fn depth_of(index: usize) -> u32 {
  (index + 1).ilog2()
}

// =============================================================================
// Tests
// =============================================================================


#[cfg(all(test, feature = "c_api"))]
mod c_api_tests {
  use super::*;

  // The C surface shares one process-wide heap; keep it to a single test.
  #[test]
  fn c_surface_round_trip() {
    let arena = MmapArena::new(3 << 20).unwrap();
    unsafe {
      assert!(heap_init(arena.as_ptr(), 2_097_152));

      let p = heap_alloc(100_000);
      assert!(!p.is_null());
      let q = heap_alloc(50_000);
      assert!(!q.is_null());

      assert!(heap_free(p));
      assert!(!heap_free(p));

      let mut pending = usize::MAX;
      heap_done(&mut pending);
      assert_eq!(pending, 1);

      // Torn down: calls fail cleanly until the next init.
      assert!(heap_alloc(64).is_null());
      assert!(!heap_free(q));
    }
  }
}
