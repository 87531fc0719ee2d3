//! A segregated-fit heap allocator.
//!
//! One contiguous arena is carved into variable-sized blocks framed by
//! boundary tags: a header word and an identical footer word carrying the
//! block size and an in-use bit. Free blocks are threaded onto one of ten
//! size-class lists through links embedded in their own payload bytes.
//! Allocation runs a bounded first-fit scan over the size classes and splits
//! oversized blocks, freeing merges adjacent free blocks in one of four
//! boundary-tag cases, and resizing tries four in-place strategies before
//! falling back to allocate-copy-free.

use core::{
  fmt,
  mem::size_of,
  ptr::{self, NonNull, null_mut},
};

// =============================================================================
// Constants
// =============================================================================

/// Word size in bytes; one word holds one boundary tag.
const WSIZE: usize = size_of::<Tag>();

/// Alignment guaranteed for every payload address.
const ALIGNMENT: usize = 16;

/// Words per alignment unit. Every block size is a multiple of this, which
/// keeps every block at the same 12-mod-16 phase and every payload 16-aligned.
const ALIGN_WORDS: usize = ALIGNMENT / WSIZE;

/// Smallest legal block, in words: header + footer + an embedded free-list
/// link, rounded up to the alignment phase.
const MIN_BLOCK_WORDS: usize = 8;

/// Number of segregated size classes.
const NUM_SIZE_CLASSES: usize = 10;

/// Upper bound (in words) of the smallest size class; doubles per class,
/// with the last class catching everything larger.
const SMALLEST_CLASS_WORDS: usize = 128;

/// Largest block size a boundary tag can carry.
const TAG_MAX_WORDS: usize = (u32::MAX >> 1) as usize;

/// Default heap extension granularity, in words.
const DEFAULT_CHUNK_WORDS: usize = 1 << 7;

/// Default per-bucket candidate cap for the bounded first-fit scan.
const DEFAULT_FIT_SCAN_LIMIT: usize = 5;

/// Default arena capacity in bytes. `MAP_NORESERVE` keeps the untouched
/// remainder cheap.
const DEFAULT_CAPACITY: usize = 1 << 26;

// =============================================================================
// Compile-Time Assertions
// =============================================================================

const _: () = assert!(WSIZE == 4);
const _: () = assert!(ALIGNMENT.is_power_of_two());
const _: () = assert!(ALIGNMENT % WSIZE == 0);
const _: () = assert!(MIN_BLOCK_WORDS % ALIGN_WORDS == 0);
const _: () = assert!(MIN_BLOCK_WORDS * WSIZE >= 2 * WSIZE + size_of::<FreeLink>());
const _: () = assert!(DEFAULT_CHUNK_WORDS % ALIGN_WORDS == 0);
const _: () = assert!(DEFAULT_CHUNK_WORDS >= MIN_BLOCK_WORDS);
const _: () = assert!(SMALLEST_CLASS_WORDS.is_power_of_two());
const _: () = assert!(NUM_SIZE_CLASSES >= 2);

// =============================================================================
// Errors
// =============================================================================

/// Construction failures. Exhaustion and overflow during normal operation
/// surface as `None` from the allocation entry points instead.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeapError {
  /// The backing segment could not be mapped from the OS.
  Map,
  /// The configured capacity cannot hold the fences plus one chunk.
  Capacity,
}

impl fmt::Display for HeapError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Map => write!(f, "backing segment mapping failed"),
      Self::Capacity => write!(f, "configured capacity cannot hold the initial heap"),
    }
  }
}

impl std::error::Error for HeapError {}

// =============================================================================
// Config
// =============================================================================

/// Tuning knobs for a [`Heap`].
#[derive(Clone, Copy, Debug)]
pub struct HeapConfig {
  /// Byte capacity of the arena mapping. Growth beyond this fails.
  pub capacity: usize,
  /// Heap extension granularity, in words. Rounded up at construction to
  /// the alignment phase and the minimum block size.
  pub chunk_words: usize,
  /// Candidates examined per size class before the fit search abandons the
  /// bucket. Raising it trades latency for fit quality.
  pub fit_scan_limit: usize,
  /// Literal request-size remaps applied before normalization.
  ///
  /// A workload whose fragmentation hinges on a handful of exact request
  /// sizes can widen those requests here, e.g. `&[(448, 512)]` to round one
  /// hot size up to the next class. Empty by default; this is a policy hook
  /// for the caller, not something the allocator guesses at.
  pub size_remaps: &'static [(usize, usize)],
}

impl Default for HeapConfig {
  fn default() -> Self {
    Self {
      capacity: DEFAULT_CAPACITY,
      chunk_words: DEFAULT_CHUNK_WORDS,
      fit_scan_limit: DEFAULT_FIT_SCAN_LIMIT,
      size_remaps: &[],
    }
  }
}

// =============================================================================
// Boundary Tags
// =============================================================================

/// Boundary tag: the low bit is the in-use flag, the remaining bits the
/// block size in words. Stored identically in a block's header and footer.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
struct Tag(u32);

/// Zero-size, permanently in-use sentinel bounding the arena on both ends.
const FENCE: Tag = Tag(1);

impl Tag {
  #[inline(always)]
  fn new(words: usize, used: bool) -> Self {
    debug_assert!(words <= TAG_MAX_WORDS, "block size overflows the tag");
    Tag(((words as u32) << 1) | used as u32)
  }

  #[inline(always)]
  fn words(self) -> usize {
    (self.0 >> 1) as usize
  }

  #[inline(always)]
  fn used(self) -> bool {
    self.0 & 1 != 0
  }
}

// =============================================================================
// Block Layout
// =============================================================================

/// Handle to a block, addressed by its header word. All block-relative
/// offset arithmetic lives here; nothing else computes payload, footer, or
/// neighbor addresses.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
struct BlockPtr(*mut Tag);

impl BlockPtr {
  /// Recover the owning block from a payload pointer.
  #[inline(always)]
  unsafe fn from_payload(payload: *mut u8) -> Self {
    BlockPtr(unsafe { payload.cast::<Tag>().sub(1) })
  }

  #[inline(always)]
  unsafe fn header(self) -> Tag {
    unsafe { self.0.read() }
  }

  #[inline(always)]
  unsafe fn words(self) -> usize {
    unsafe { self.header().words() }
  }

  #[inline(always)]
  unsafe fn is_free(self) -> bool {
    unsafe { !self.header().used() }
  }

  /// Caller-visible byte capacity: everything between header and footer.
  #[inline(always)]
  unsafe fn payload_bytes(self) -> usize {
    unsafe { self.words() * WSIZE - 2 * WSIZE }
  }

  #[inline(always)]
  unsafe fn payload(self) -> *mut u8 {
    unsafe { self.0.add(1).cast() }
  }

  #[inline(always)]
  unsafe fn footer(self) -> *mut Tag {
    unsafe { self.0.add(self.words()).sub(1) }
  }

  /// Successor block. Valid for every real block; lands on the epilogue
  /// fence for the right-most one.
  #[inline(always)]
  unsafe fn next(self) -> BlockPtr {
    unsafe { BlockPtr(self.0.add(self.words())) }
  }

  /// Footer of the block immediately to the left. Valid even for the
  /// left-most real block, where it reads the prologue fence.
  #[inline(always)]
  unsafe fn prev_footer(self) -> Tag {
    unsafe { self.0.sub(1).read() }
  }

  /// Predecessor block. Must not be called when the left neighbor is the
  /// prologue fence.
  #[inline(always)]
  unsafe fn prev(self) -> BlockPtr {
    let footer = unsafe { self.prev_footer() };
    debug_assert!(footer.words() != 0, "walked past the left arena fence");
    unsafe { BlockPtr(self.0.sub(footer.words())) }
  }

  /// The single invariant-preserving write path: header and footer are
  /// rewritten together, never individually.
  #[inline(always)]
  unsafe fn set(self, words: usize, used: bool) {
    let tag = Tag::new(words, used);
    unsafe {
      self.0.write(tag);
      self.footer().write(tag);
    }
  }

  /// Fences are single-word sentinels; they bypass [`BlockPtr::set`].
  #[inline(always)]
  unsafe fn write_fence(self) {
    unsafe { self.0.write(FENCE) }
  }

  /// Embedded free-list link, living in the first payload bytes. Only
  /// meaningful while the block is free; the storage is reclaimed as
  /// ordinary payload the instant the block is marked used.
  #[inline(always)]
  unsafe fn link(self) -> *mut FreeLink {
    unsafe { self.payload().cast() }
  }

  #[inline(always)]
  unsafe fn from_link(link: *mut FreeLink) -> BlockPtr {
    unsafe { BlockPtr::from_payload(link.cast()) }
  }
}

// =============================================================================
// Intrusive Free List
// =============================================================================

/// Link embedded in a free block's payload. Never read through an
/// allocated block.
#[repr(C)]
struct FreeLink {
  prev: *mut FreeLink,
  next: *mut FreeLink,
}

/// Intrusive doubly linked list of free blocks. Owns none of the linked
/// data; push and removal are O(1).
struct FreeList {
  head: *mut FreeLink,
}

impl FreeList {
  const fn new() -> Self {
    Self { head: null_mut() }
  }

  unsafe fn push_front(&mut self, link: *mut FreeLink) {
    unsafe {
      (*link).prev = null_mut();
      (*link).next = self.head;
      if !self.head.is_null() {
        (*self.head).prev = link;
      }
    }
    self.head = link;
  }

  unsafe fn remove(&mut self, link: *mut FreeLink) {
    unsafe {
      let prev = (*link).prev;
      let next = (*link).next;
      if prev.is_null() {
        debug_assert!(self.head == link, "unlinking from the wrong bucket");
        self.head = next;
      } else {
        (*prev).next = next;
      }
      if !next.is_null() {
        (*next).prev = prev;
      }
    }
  }

  fn iter(&self) -> FreeListIter {
    FreeListIter { cur: self.head }
  }
}

struct FreeListIter {
  cur: *mut FreeLink,
}

impl Iterator for FreeListIter {
  type Item = *mut FreeLink;

  fn next(&mut self) -> Option<*mut FreeLink> {
    let link = self.cur;
    if link.is_null() {
      return None;
    }
    self.cur = unsafe { (*link).next };
    Some(link)
  }
}

// =============================================================================
// Size Classes
// =============================================================================

/// Bucket index for a block of `words` words. Class 0 holds blocks up to
/// `SMALLEST_CLASS_WORDS`; each class doubles the bound and the last class
/// catches everything larger.
#[inline(always)]
fn class_for(words: usize) -> usize {
  if words <= SMALLEST_CLASS_WORDS {
    return 0;
  }
  let log2 = usize::BITS as usize - 1 - (words - 1).leading_zeros() as usize;
  (log2 - SMALLEST_CLASS_WORDS.trailing_zeros() as usize + 1).min(NUM_SIZE_CLASSES - 1)
}

// =============================================================================
// Mapped Segment
// =============================================================================

/// Fixed-capacity anonymous mapping backing the arena, with a monotonic
/// break. Nothing is returned to the OS until the mapping is dropped.
struct Segment {
  base: *mut u8,
  len: usize,
  capacity: usize,
}

impl Segment {
  fn map(capacity: usize) -> Result<Self, HeapError> {
    let base = unsafe {
      libc::mmap(
        null_mut(),
        capacity,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
        -1,
        0,
      )
    };
    if base == libc::MAP_FAILED {
      return Err(HeapError::Map);
    }
    Ok(Self {
      base: base.cast(),
      len: 0,
      capacity,
    })
  }

  /// Expose `bytes` more of the mapping, returning the start of the new
  /// region, or `None` once the capacity is exhausted. Never shrinks,
  /// never relocates.
  fn grow(&mut self, bytes: usize) -> Option<*mut u8> {
    if bytes > self.capacity - self.len {
      return None;
    }
    let brk = unsafe { self.base.add(self.len) };
    self.len += bytes;
    Some(brk)
  }

  #[inline]
  fn base(&self) -> *mut u8 {
    self.base
  }

  #[inline]
  fn len(&self) -> usize {
    self.len
  }

  #[inline]
  fn contains(&self, ptr: *mut u8) -> bool {
    let addr = ptr as usize;
    let base = self.base as usize;
    addr >= base && addr < base + self.len
  }
}

impl Drop for Segment {
  fn drop(&mut self) {
    unsafe { libc::munmap(self.base.cast(), self.capacity) };
  }
}

// =============================================================================
// Heap
// =============================================================================

/// A single-arena allocator instance: the mapped segment, the segregated
/// free lists, and the policy knobs. All operations run to completion with
/// no internal synchronization; the type holds raw pointers and is neither
/// `Send` nor `Sync`, so concurrent callers must serialize access
/// externally.
pub struct Heap {
  seg: Segment,
  buckets: [FreeList; NUM_SIZE_CLASSES],
  chunk_words: usize,
  fit_scan_limit: usize,
  size_remaps: &'static [(usize, usize)],
}

impl Heap {
  /// Map the arena, lay down the boundary fences, and perform the initial
  /// extension of one chunk.
  pub fn new(config: HeapConfig) -> Result<Self, HeapError> {
    let chunk_words = align_words(config.chunk_words.max(MIN_BLOCK_WORDS));
    if chunk_words > TAG_MAX_WORDS {
      return Err(HeapError::Capacity);
    }
    let required = chunk_words
      .checked_add(4)
      .and_then(|words| words.checked_mul(WSIZE))
      .ok_or(HeapError::Capacity)?;
    if config.capacity < required {
      return Err(HeapError::Capacity);
    }

    const EMPTY: FreeList = FreeList::new();
    let mut heap = Self {
      seg: Segment::map(config.capacity)?,
      buckets: [EMPTY; NUM_SIZE_CLASSES],
      chunk_words,
      fit_scan_limit: config.fit_scan_limit.max(1),
      size_remaps: config.size_remaps,
    };

    // Bootstrap: two padding words, then the prologue footer fence, then
    // the epilogue header fence. The first real block lands at word 3,
    // which is 12 mod 16, putting its payload at 0 mod 16.
    let start = heap.seg.grow(4 * WSIZE).ok_or(HeapError::Capacity)?;
    unsafe {
      let words = start.cast::<Tag>();
      BlockPtr(words.add(2)).write_fence();
      BlockPtr(words.add(3)).write_fence();
    }

    if heap.extend(chunk_words).is_none() {
      return Err(HeapError::Capacity);
    }
    Ok(heap)
  }

  /// A heap with the default configuration.
  pub fn with_defaults() -> Result<Self, HeapError> {
    Self::new(HeapConfig::default())
  }

  /// Allocate `size` bytes, 16-byte aligned. Returns `None` for a zero
  /// size, on size overflow, or when the arena is exhausted; the heap is
  /// left consistent in every failure case.
  pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
    if size == 0 {
      return None;
    }
    let awords = self.normalize(size)?;

    let block = match self.find_fit(awords) {
      Some(block) => block,
      None => self.extend(awords.max(self.chunk_words))?,
    };
    self.place(block, awords);
    self.tripwire();
    NonNull::new(unsafe { block.payload() })
  }

  /// Allocate `size` bytes and zero them.
  pub fn allocate_zeroed(&mut self, size: usize) -> Option<NonNull<u8>> {
    let payload = self.allocate(size)?;
    unsafe { ptr::write_bytes(payload.as_ptr(), 0, size) };
    Some(payload)
  }

  /// Return `ptr`'s block to the free pool, merging with any free
  /// neighbors. `None` is a no-op.
  ///
  /// # Safety
  ///
  /// A `Some` pointer must have come from this heap's allocate or resize
  /// and must not have been freed since.
  pub unsafe fn free(&mut self, ptr: Option<NonNull<u8>>) {
    let Some(payload) = ptr else { return };
    unsafe {
      debug_assert!(
        self.seg.contains(payload.as_ptr()),
        "freeing a pointer from outside the arena"
      );
      let block = BlockPtr::from_payload(payload.as_ptr());
      debug_assert!(!block.is_free(), "double free at {:p}", payload.as_ptr());
      block.set(block.words(), false);
      self.coalesce(block);
    }
    self.tripwire();
  }

  /// Resize the allocation at `ptr` to `size` bytes, preferring in-place
  /// strategies over relocation.
  ///
  /// A zero `size` behaves exactly as [`Heap::free`] and returns `None`;
  /// a `None` pointer behaves exactly as [`Heap::allocate`]. When every
  /// in-place strategy and the fallback allocation fail, the original
  /// block is left untouched and `None` is returned.
  ///
  /// # Safety
  ///
  /// As for [`Heap::free`].
  pub unsafe fn resize(&mut self, ptr: Option<NonNull<u8>>, size: usize) -> Option<NonNull<u8>> {
    if size == 0 {
      unsafe { self.free(ptr) };
      return None;
    }
    let Some(payload) = ptr else {
      return self.allocate(size);
    };

    let awords = self.normalize(size)?;

    unsafe {
      let block = BlockPtr::from_payload(payload.as_ptr());
      debug_assert!(!block.is_free(), "resizing a freed block");
      let words = block.words();
      let old_payload = block.payload_bytes();
      let prev_used = block.prev_footer().used();
      let next = block.next();
      let next_used = !next.is_free();

      // Absorb a free predecessor; the payload slides left.
      if !prev_used && next_used {
        let prev = block.prev();
        if prev.words() + words >= awords {
          self.detach(prev);
          prev.set(prev.words() + words, true);
          ptr::copy(payload.as_ptr(), prev.payload(), old_payload);
          self.tripwire();
          return NonNull::new(prev.payload());
        }
      }

      // Absorb a free successor; the address stays put.
      if !next_used && words + next.words() >= awords {
        self.detach(next);
        block.set(words + next.words(), true);
        self.tripwire();
        return Some(payload);
      }

      // Absorb both free neighbors; the payload slides left.
      if !prev_used && !next_used {
        let prev = block.prev();
        if prev.words() + words + next.words() >= awords {
          self.detach(prev);
          self.detach(next);
          prev.set(prev.words() + words + next.words(), true);
          ptr::copy(payload.as_ptr(), prev.payload(), old_payload);
          self.tripwire();
          return NonNull::new(prev.payload());
        }
      }

      // Right arena edge: grow by one chunk, then retry the successor
      // absorb against the fresh tail. A failed or insufficient extension
      // falls through to the general case.
      if prev_used && next.words() == 0 && self.extend(self.chunk_words).is_some() {
        let tail = block.next();
        if tail.is_free() && words + tail.words() >= awords {
          self.detach(tail);
          block.set(words + tail.words(), true);
          self.tripwire();
          return Some(payload);
        }
      }

      // General case: relocate. A failed allocation leaves the original
      // block untouched.
      let new_payload = self.allocate(size)?;
      ptr::copy_nonoverlapping(payload.as_ptr(), new_payload.as_ptr(), old_payload.min(size));
      self.free(Some(payload));
      Some(new_payload)
    }
  }

  /// Payload capacity of the block owning `ptr`: at least the requested
  /// size, possibly more after rounding or an in-place merge.
  ///
  /// # Safety
  ///
  /// As for [`Heap::free`], except the block stays allocated.
  pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize {
    unsafe { BlockPtr::from_payload(ptr.as_ptr()).payload_bytes() }
  }

  /// Current arena extent in bytes. Monotonic.
  pub fn heap_size(&self) -> usize {
    self.seg.len()
  }

  /// Validate the whole heap: header/footer agreement, fence integrity,
  /// size and alignment invariants, no two adjacent free blocks, and
  /// free-list membership consistent with the block walk. Aborts on the
  /// first violation. With `verbose`, prints a block walk to stderr.
  pub fn check(&self, verbose: bool) {
    unsafe {
      let base = self.seg.base();
      let end: *mut Tag = base.add(self.seg.len()).cast();
      let prologue = base.cast::<Tag>().add(2).read();
      assert!(
        prologue.used() && prologue.words() == 0,
        "prologue fence clobbered"
      );

      let mut block = self.first_block();
      let mut walked_blocks = 0usize;
      let mut walked_free = 0usize;
      let mut prev_free = false;
      loop {
        assert!(block.0 < end, "block walk ran past the arena end");
        let header = block.header();
        if header.words() == 0 {
          break;
        }
        let footer = block.footer().read();
        assert!(header == footer, "header/footer mismatch at {:p}", block.0);
        assert!(
          header.words() >= MIN_BLOCK_WORDS,
          "undersized block at {:p}",
          block.0
        );
        assert!(
          header.words() % ALIGN_WORDS == 0,
          "block size off the alignment phase at {:p}",
          block.0
        );
        assert!(
          block.payload() as usize % ALIGNMENT == 0,
          "misaligned payload at {:p}",
          block.0
        );
        if !header.used() {
          assert!(!prev_free, "adjacent free blocks at {:p}", block.0);
          walked_free += 1;
        }
        if verbose {
          eprintln!(
            "  {:p} {:>8} words {}",
            block.0,
            header.words(),
            if header.used() { "used" } else { "free" }
          );
        }
        prev_free = !header.used();
        walked_blocks += 1;
        block = block.next();
      }

      assert!(block.0 == end.sub(1), "epilogue fence not at the arena end");
      assert!(block.header().used(), "epilogue fence clobbered");

      let mut listed_free = 0usize;
      for (class, bucket) in self.buckets.iter().enumerate() {
        for link in bucket.iter() {
          assert!(
            self.seg.contains(link.cast()),
            "free list {class} points outside the arena"
          );
          let blk = BlockPtr::from_link(link);
          assert!(blk.is_free(), "allocated block on free list {class}");
          assert!(
            class_for(blk.words()) == class,
            "block of {} words filed in bucket {class}",
            blk.words()
          );
          listed_free += 1;
        }
      }
      assert!(
        listed_free == walked_free,
        "free lists hold {listed_free} blocks, block walk found {walked_free}"
      );

      if verbose {
        eprintln!(
          "heap: {} bytes, {} blocks, {} free",
          self.seg.len(),
          walked_blocks,
          walked_free
        );
      }
    }
  }

  // --- internals ---

  /// Normalize a request to a block size in words: apply the remap table,
  /// account for both boundary tags, round up to the alignment unit, and
  /// clamp to the minimum block size. `None` on arithmetic overflow.
  fn normalize(&self, size: usize) -> Option<usize> {
    let size = self
      .size_remaps
      .iter()
      .find(|&&(from, _)| from == size)
      .map_or(size, |&(_, to)| to);
    let bytes = checked_align(size.checked_add(2 * WSIZE)?)?;
    let words = bytes / WSIZE;
    if words > TAG_MAX_WORDS {
      return None;
    }
    Some(words.max(MIN_BLOCK_WORDS))
  }

  /// Bounded first-fit: scan the buckets that can hold `awords` in
  /// ascending order, examining at most `fit_scan_limit` candidates per
  /// bucket before abandoning it for the next one.
  fn find_fit(&self, awords: usize) -> Option<BlockPtr> {
    for bucket in &self.buckets[class_for(awords)..] {
      for link in bucket.iter().take(self.fit_scan_limit) {
        let block = unsafe { BlockPtr::from_link(link) };
        debug_assert!(unsafe { block.is_free() }, "allocated block on a free list");
        if unsafe { block.words() } >= awords {
          return Some(block);
        }
      }
    }
    None
  }

  /// Carve `awords` out of `block`, a free block large enough to hold
  /// them. The remainder becomes a new free block when it can stand on its
  /// own; otherwise the whole block is handed out.
  fn place(&mut self, block: BlockPtr, awords: usize) {
    unsafe {
      let cwords = block.words();
      debug_assert!(cwords >= awords, "placing into an undersized block");
      self.detach(block);
      if cwords - awords >= MIN_BLOCK_WORDS {
        block.set(awords, true);
        let rest = block.next();
        rest.set(cwords - awords, false);
        self.insert(rest);
      } else {
        block.set(cwords, true);
      }
    }
  }

  /// Merge a free block with any free immediate neighbors. Neighbor state
  /// is read from the boundary tags, detachments happen first, and exactly
  /// one final tag write establishes the merged size. The merged block
  /// adopts the left-most surviving address and lands in its bucket.
  fn coalesce(&mut self, block: BlockPtr) -> BlockPtr {
    unsafe {
      let prev_used = block.prev_footer().used();
      let next = block.next();
      let next_used = !next.is_free();
      let words = block.words();
      debug_assert!(words > 0, "coalescing a fence");

      let merged = match (prev_used, next_used) {
        (true, true) => block,
        (true, false) => {
          self.detach(next);
          block.set(words + next.words(), false);
          block
        }
        (false, true) => {
          let prev = block.prev();
          self.detach(prev);
          prev.set(words + prev.words(), false);
          prev
        }
        (false, false) => {
          let prev = block.prev();
          self.detach(prev);
          self.detach(next);
          prev.set(words + prev.words() + next.words(), false);
          prev
        }
      };
      self.insert(merged);
      merged
    }
  }

  /// Grow the arena by `words`, recycling the old epilogue fence into the
  /// new block's header and writing a fresh fence after it. The new block
  /// is routed through the coalescer, absorbing a free tail left over from
  /// an earlier extension.
  fn extend(&mut self, words: usize) -> Option<BlockPtr> {
    debug_assert!(words % ALIGN_WORDS == 0, "extension off the alignment phase");
    let bytes = words.checked_mul(WSIZE)?;
    let brk = self.seg.grow(bytes)?;
    unsafe {
      let block = BlockPtr(brk.cast::<Tag>().sub(1));
      block.set(words, false);
      block.next().write_fence();
      Some(self.coalesce(block))
    }
  }

  /// Push a free block onto the bucket its size selects.
  fn insert(&mut self, block: BlockPtr) {
    unsafe {
      let class = class_for(block.words());
      self.buckets[class].push_front(block.link());
    }
  }

  /// Unlink a free block from the bucket its size selects.
  fn detach(&mut self, block: BlockPtr) {
    unsafe {
      let class = class_for(block.words());
      self.buckets[class].remove(block.link());
    }
  }

  fn first_block(&self) -> BlockPtr {
    BlockPtr(unsafe { self.seg.base().cast::<Tag>().add(3) })
  }

  #[inline]
  fn tripwire(&self) {
    #[cfg(feature = "tripwire")]
    self.check(false);
  }
}

// =============================================================================
// Utils
// =============================================================================

/// Round `bytes` up to the payload alignment, or `None` on overflow.
#[inline(always)]
const fn checked_align(bytes: usize) -> Option<usize> {
  match bytes.checked_add(ALIGNMENT - 1) {
    Some(padded) => Some(padded & !(ALIGNMENT - 1)),
    None => None,
  }
}

/// Round a word count up to the alignment phase every block must keep.
#[inline(always)]
const fn align_words(words: usize) -> usize {
  (words + (ALIGN_WORDS - 1)) & !(ALIGN_WORDS - 1)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
  use super::*;
  use proptest::prelude::*;

  /// Bytes the bootstrap consumes: padding + fences + one default chunk.
  const INITIAL_BYTES: usize = (4 + DEFAULT_CHUNK_WORDS) * WSIZE;

  fn heap() -> Heap {
    Heap::with_defaults().expect("mapping the test arena")
  }

  fn small_heap(capacity: usize) -> Heap {
    Heap::new(HeapConfig {
      capacity,
      ..HeapConfig::default()
    })
    .expect("mapping the test arena")
  }

  fn fill(ptr: NonNull<u8>, len: usize, seed: u8) {
    for i in 0..len {
      unsafe { ptr.as_ptr().add(i).write(seed.wrapping_add(i as u8)) };
    }
  }

  fn holds(ptr: NonNull<u8>, len: usize, seed: u8) -> bool {
    (0..len).all(|i| unsafe { ptr.as_ptr().add(i).read() } == seed.wrapping_add(i as u8))
  }

  #[test]
  fn fresh_heap_is_consistent() {
    let heap = heap();
    assert_eq!(heap.heap_size(), INITIAL_BYTES);
    heap.check(false);
  }

  #[test]
  fn zero_size_is_refused() {
    let mut heap = heap();
    assert!(heap.allocate(0).is_none());
    assert_eq!(heap.heap_size(), INITIAL_BYTES);
    heap.check(false);
  }

  #[test]
  fn overflow_is_refused() {
    let mut heap = heap();
    assert!(heap.allocate(usize::MAX).is_none());
    assert!(heap.allocate(usize::MAX - ALIGNMENT).is_none());
    assert_eq!(heap.heap_size(), INITIAL_BYTES);
    heap.check(false);
  }

  #[test]
  fn payloads_are_aligned_and_disjoint() {
    let mut heap = heap();
    let sizes = [1usize, 2, 15, 16, 17, 100, 257, 1000, 5000];
    let mut live = Vec::new();
    for (i, &size) in sizes.iter().enumerate() {
      let ptr = heap.allocate(size).expect("allocation");
      assert_eq!(ptr.as_ptr() as usize % ALIGNMENT, 0);
      fill(ptr, size, i as u8);
      live.push((ptr, size));
    }
    for (i, &(ptr, size)) in live.iter().enumerate() {
      assert!(holds(ptr, size, i as u8), "payload {i} was clobbered");
    }
    heap.check(false);
  }

  #[test]
  fn freed_block_is_reused() {
    let mut heap = heap();
    let a = heap.allocate(100).expect("allocation");
    unsafe { heap.free(Some(a)) };
    let before = heap.heap_size();
    let b = heap.allocate(64).expect("allocation");
    assert_eq!(b, a);
    assert_eq!(heap.heap_size(), before);
    heap.check(false);
  }

  #[test]
  fn free_none_is_a_noop() {
    let mut heap = heap();
    unsafe { heap.free(None) };
    assert_eq!(heap.heap_size(), INITIAL_BYTES);
    heap.check(false);
  }

  #[test]
  fn adjacent_frees_coalesce() {
    let mut heap = heap();
    let a = heap.allocate(100).expect("allocation");
    let b = heap.allocate(100).expect("allocation");
    let _guard = heap.allocate(100).expect("allocation");
    unsafe {
      let span = heap.usable_size(a) + heap.usable_size(b) + 2 * WSIZE;
      heap.free(Some(a));
      heap.free(Some(b));
      heap.check(false);
      // One region now covers both old payloads plus b's freed tags.
      let before = heap.heap_size();
      let merged = heap.allocate(span).expect("allocation");
      assert_eq!(merged, a);
      assert_eq!(heap.heap_size(), before);
    }
    heap.check(false);
  }

  #[test]
  fn resize_zero_frees() {
    let mut heap = heap();
    let p = heap.allocate(100).expect("allocation");
    unsafe {
      assert!(heap.resize(Some(p), 0).is_none());
      // The freed block is immediately reusable at the same address.
      assert_eq!(heap.allocate(100).expect("allocation"), p);
    }
    heap.check(false);
  }

  #[test]
  fn resize_none_allocates() {
    let mut heap = heap();
    let p = unsafe { heap.resize(None, 100) }.expect("allocation");
    assert_eq!(p.as_ptr() as usize % ALIGNMENT, 0);
    assert!(unsafe { heap.usable_size(p) } >= 100);
    heap.check(false);
  }

  #[test]
  fn resize_absorbs_free_successor_in_place() {
    let mut heap = heap();
    let p = heap.allocate(64).expect("allocation");
    let q = heap.allocate(64).expect("allocation");
    fill(p, 64, 7);
    unsafe {
      heap.free(Some(q));
      let before = heap.heap_size();
      let p2 = heap.resize(Some(p), 128).expect("resize");
      assert_eq!(p2, p);
      assert_eq!(heap.heap_size(), before);
      assert!(holds(p, 64, 7));
    }
    heap.check(false);
  }

  #[test]
  fn resize_merges_into_free_predecessor() {
    let mut heap = heap();
    let a = heap.allocate(64).expect("allocation");
    let b = heap.allocate(64).expect("allocation");
    let _guard = heap.allocate(64).expect("allocation");
    let b_payload = unsafe { heap.usable_size(b) };
    fill(b, b_payload, 3);
    unsafe {
      heap.free(Some(a));
      let before = heap.heap_size();
      let b2 = heap.resize(Some(b), 128).expect("resize");
      assert_eq!(b2, a, "the merged block keeps the left-most address");
      assert_eq!(heap.heap_size(), before);
      assert!(holds(b2, b_payload, 3), "payload lost in the leftward move");
    }
    heap.check(false);
  }

  #[test]
  fn resize_merges_both_free_neighbors() {
    let mut heap = heap();
    let a = heap.allocate(64).expect("allocation");
    let b = heap.allocate(64).expect("allocation");
    let c = heap.allocate(64).expect("allocation");
    let _guard = heap.allocate(64).expect("allocation");
    let b_payload = unsafe { heap.usable_size(b) };
    fill(b, b_payload, 11);
    unsafe {
      heap.free(Some(a));
      heap.free(Some(c));
      let before = heap.heap_size();
      let b2 = heap.resize(Some(b), 192).expect("resize");
      assert_eq!(b2, a);
      assert_eq!(heap.heap_size(), before);
      assert!(holds(b2, b_payload, 11));
    }
    heap.check(false);
  }

  #[test]
  fn resize_extends_at_the_arena_edge() {
    let mut heap = heap();
    // Consume the initial chunk exactly: the block's successor is the
    // epilogue fence and its predecessor the prologue fence.
    let whole = DEFAULT_CHUNK_WORDS * WSIZE - 2 * WSIZE;
    let p = heap.allocate(whole).expect("allocation");
    fill(p, whole, 42);
    unsafe {
      let before = heap.heap_size();
      let p2 = heap.resize(Some(p), whole + 64).expect("resize");
      assert_eq!(p2, p, "edge growth must not relocate");
      assert_eq!(heap.heap_size(), before + DEFAULT_CHUNK_WORDS * WSIZE);
      assert!(holds(p, whole, 42));
    }
    heap.check(false);
  }

  #[test]
  fn resize_relocates_and_preserves_data() {
    let mut heap = heap();
    let p = heap.allocate(40).expect("allocation");
    let _guard = heap.allocate(16).expect("allocation");
    fill(p, 40, 99);
    unsafe {
      let p2 = heap.resize(Some(p), 4000).expect("resize");
      assert_ne!(p2, p);
      assert!(holds(p2, 40, 99), "bytes lost in relocation");
      // The old block was freed and is reusable.
      assert_eq!(heap.allocate(40).expect("allocation"), p);
    }
    heap.check(false);
  }

  #[test]
  fn resize_shrink_keeps_prefix() {
    let mut heap = heap();
    let p = heap.allocate(1000).expect("allocation");
    fill(p, 1000, 5);
    unsafe {
      let p2 = heap.resize(Some(p), 100).expect("resize");
      assert!(holds(p2, 100, 5));
    }
    heap.check(false);
  }

  #[test]
  fn resize_fallback_failure_leaves_block_intact() {
    // Room for the bootstrap and nothing more.
    let mut heap = small_heap((4 + DEFAULT_CHUNK_WORDS) * WSIZE);
    let p = heap.allocate(100).expect("allocation");
    fill(p, 100, 23);
    unsafe {
      let size_before = heap.usable_size(p);
      assert!(heap.resize(Some(p), 4000).is_none());
      assert_eq!(heap.usable_size(p), size_before);
      assert!(holds(p, 100, 23), "failed resize touched the payload");
    }
    heap.check(false);
  }

  #[test]
  fn exhaustion_returns_none_and_stays_consistent() {
    let mut heap = small_heap((4 + DEFAULT_CHUNK_WORDS) * WSIZE);
    let mut live = Vec::new();
    loop {
      match heap.allocate(100) {
        Some(ptr) => live.push(ptr),
        None => break,
      }
      assert!(live.len() < 100, "tiny arena should exhaust quickly");
    }
    assert!(!live.is_empty());
    heap.check(false);
    for ptr in live {
      unsafe { heap.free(Some(ptr)) };
    }
    heap.check(false);
  }

  #[test]
  fn allocate_zeroed_zeroes() {
    let mut heap = heap();
    let junk = heap.allocate(256).expect("allocation");
    fill(junk, 256, 77);
    unsafe { heap.free(Some(junk)) };
    let p = heap.allocate_zeroed(256).expect("allocation");
    assert!((0..256).all(|i| unsafe { p.as_ptr().add(i).read() } == 0));
    heap.check(false);
  }

  #[test]
  fn usable_size_covers_the_request() {
    let mut heap = heap();
    let p = heap.allocate(100).expect("allocation");
    let usable = unsafe { heap.usable_size(p) };
    assert!(usable >= 100);
    // 100 + 8 tag bytes rounds to 112; 28 words less the tags.
    assert_eq!(usable, 104);
    let q = heap.allocate(1).expect("allocation");
    assert_eq!(unsafe { heap.usable_size(q) }, MIN_BLOCK_WORDS * WSIZE - 2 * WSIZE);
  }

  #[test]
  fn size_remaps_widen_exact_requests() {
    static REMAPS: &[(usize, usize)] = &[(448, 512)];
    let mut plain = heap();
    let mut remapped = Heap::new(HeapConfig {
      size_remaps: REMAPS,
      ..HeapConfig::default()
    })
    .expect("mapping the test arena");

    let p = plain.allocate(448).expect("allocation");
    let q = remapped.allocate(448).expect("allocation");
    unsafe {
      assert_eq!(plain.usable_size(p), 456);
      assert_eq!(remapped.usable_size(q), 520);
    }
    // Only the exact size is remapped; 449 still rounds into the 464-byte
    // block a plain 448 would get.
    let r = remapped.allocate(449).expect("allocation");
    assert_eq!(unsafe { remapped.usable_size(r) }, 456);
  }

  #[test]
  fn verbose_check_reports() {
    let mut heap = heap();
    let p = heap.allocate(100).expect("allocation");
    let _q = heap.allocate(200).expect("allocation");
    unsafe { heap.free(Some(p)) };
    heap.check(true);
  }

  // --- property tests ---

  #[derive(Clone, Debug)]
  enum Op {
    Alloc(usize),
    Free(usize),
    Resize(usize, usize),
  }

  fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
      (1usize..2048).prop_map(Op::Alloc),
      (0usize..64).prop_map(Op::Free),
      ((0usize..64), (0usize..2048)).prop_map(|(i, s)| Op::Resize(i, s)),
    ]
  }

  fn assert_disjoint(live: &[(NonNull<u8>, usize, u8)]) {
    let mut spans: Vec<(usize, usize)> = live
      .iter()
      .map(|&(ptr, len, _)| (ptr.as_ptr() as usize, ptr.as_ptr() as usize + len))
      .collect();
    spans.sort_unstable();
    for pair in spans.windows(2) {
      assert!(pair[0].1 <= pair[1].0, "live payloads overlap");
    }
  }

  proptest! {
    #[test]
    fn random_workload_stays_consistent(ops in prop::collection::vec(arb_op(), 1..200)) {
      let mut heap = small_heap(1 << 22);
      let mut live: Vec<(NonNull<u8>, usize, u8)> = Vec::new();
      let mut seed = 0u8;
      let mut last_size = heap.heap_size();

      for op in ops {
        match op {
          Op::Alloc(size) => {
            if let Some(ptr) = heap.allocate(size) {
              prop_assert_eq!(ptr.as_ptr() as usize % ALIGNMENT, 0);
              seed = seed.wrapping_add(1);
              fill(ptr, size, seed);
              live.push((ptr, size, seed));
            }
          }
          Op::Free(index) => {
            if !live.is_empty() {
              let (ptr, size, pattern) = live.swap_remove(index % live.len());
              prop_assert!(holds(ptr, size, pattern));
              unsafe { heap.free(Some(ptr)) };
            }
          }
          Op::Resize(index, new_size) => {
            if !live.is_empty() {
              let index = index % live.len();
              let (ptr, size, pattern) = live[index];
              match unsafe { heap.resize(Some(ptr), new_size) } {
                Some(moved) => {
                  prop_assert!(holds(moved, size.min(new_size), pattern));
                  seed = seed.wrapping_add(1);
                  fill(moved, new_size, seed);
                  live[index] = (moved, new_size, seed);
                }
                None => {
                  if new_size == 0 {
                    live.swap_remove(index);
                  } else {
                    // Failed resize must leave the block untouched.
                    prop_assert!(holds(ptr, size, pattern));
                  }
                }
              }
            }
          }
        }
        prop_assert!(heap.heap_size() >= last_size, "arena shrank");
        last_size = heap.heap_size();
        assert_disjoint(&live);
        heap.check(false);
      }

      for &(ptr, size, pattern) in &live {
        prop_assert!(holds(ptr, size, pattern));
      }
      for (ptr, _, _) in live {
        unsafe { heap.free(Some(ptr)) };
      }
      heap.check(false);
    }
  }
}
