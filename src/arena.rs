use std::alloc::{Allocator, Layout};
use std::ptr;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

// Arena allocates memory for protobuf objects. Which can be freed all at once.
// This is useful for short lived objects that are created and destroyed together.
// We need arena to be a non-generic type to avoid code bloat, but at the same time
// we want users to have full control over the allocator used by the arena. Because
// arena is batching small allocations into sporadic large allocations, we can
// allocate large blocks using the dyn Allocator trait object without too much
// overhead.
pub struct Arena<'a> {
    current: *mut MemBlock,
    cursor: *mut u8,
    end: *mut u8,
    allocator: &'a dyn std::alloc::Allocator,
    cleanup_head: *mut CleanupNode,
    group: *const FusionGroup,
}

// Mem block is a block of contiguous memory allocated from the allocator
struct MemBlock {
    prev: *mut MemBlock,
    layout: Layout,             // Layout of the entire block including header
    allocator: *const dyn Allocator, // allocator that produced this block
}

// A cleanup record, allocated from the arena it's registered on. Cleanups
// run in LIFO order at free time, so the list is simply pushed-to-front.
struct CleanupNode {
    next: *mut CleanupNode,
    func: unsafe fn(*mut ()),
    data: *mut (),
}

/// Union-find group root. Arenas that have been fused share a group; the
/// group is only actually torn down (blocks deallocated) when the last
/// member arena drops, tracked by `refcount`.
///
/// Path compression walks `parent` until it finds a node whose `parent`
/// points at itself (the root). `refcount` and `pending` are meaningful
/// only on the root.
struct FusionGroup {
    parent: AtomicPtr<FusionGroup>,
    refcount: AtomicUsize,
    // Blocks (and their cleanups) belonging to member arenas that have
    // already dropped, waiting on the last member to actually free them.
    pending: AtomicPtr<MemBlock>,
}

impl FusionGroup {
    fn new_root() -> Box<FusionGroup> {
        Box::new(FusionGroup {
            parent: AtomicPtr::new(ptr::null_mut()),
            refcount: AtomicUsize::new(1),
            pending: AtomicPtr::new(ptr::null_mut()),
        })
    }

    /// Finds the current root of `group`, path-compressing along the way.
    unsafe fn find_root(mut group: *const FusionGroup) -> *const FusionGroup {
        loop {
            let parent = unsafe { (*group).parent.load(Ordering::Acquire) };
            if parent.is_null() {
                return group;
            }
            let grandparent = unsafe { (*parent).parent.load(Ordering::Acquire) };
            if !grandparent.is_null() {
                unsafe { (*group as *mut FusionGroup) }
                    .parent
                    .store(grandparent, Ordering::Release);
            }
            group = parent;
        }
    }
}

const DEFAULT_BLOCK_SIZE: usize = 8 * 1024; // 8KB initial block
const MAX_BLOCK_SIZE: usize = 1024 * 1024; // 1MB max block

impl<'a> Arena<'a> {
    /// Create a new arena with the given allocator
    pub fn new(allocator: &'a dyn Allocator) -> Self {
        let group = Box::into_raw(FusionGroup::new_root());
        Self {
            current: ptr::null_mut(),
            cursor: ptr::null_mut(),
            end: ptr::null_mut(),
            allocator,
            cleanup_head: ptr::null_mut(),
            group,
        }
    }

    /// Registers a cleanup callback, run (LIFO with other cleanups on this
    /// arena or its fused group) when the arena's lifetime ends.
    pub fn add_cleanup(&mut self, data: *mut (), func: unsafe fn(*mut ())) {
        let node_ptr: *mut CleanupNode = self.alloc();
        unsafe {
            node_ptr.write(CleanupNode {
                next: self.cleanup_head,
                func,
                data,
            });
        }
        self.cleanup_head = node_ptr;
    }

    /// Merges the lifetime groups of `self` and `other` so that neither's
    /// blocks are freed until both (and any other fused members) have
    /// dropped. Implemented as union-by-attaching-root union-find.
    pub fn fuse(&self, other: &Arena<'_>) {
        unsafe {
            let mut a = FusionGroup::find_root(self.group);
            let mut b = FusionGroup::find_root(other.group);
            if ptr::eq(a, b) {
                return;
            }
            // Always attach the numerically larger pointer under the
            // smaller one to obtain a consistent lock-free ordering and
            // avoid the A-fuses-B / B-fuses-A race forming a cycle.
            if a as usize > b as usize {
                core::mem::swap(&mut a, &mut b);
            }
            let a_mut = a as *mut FusionGroup;
            (*a_mut)
                .refcount
                .fetch_add((*b).refcount.load(Ordering::Relaxed), Ordering::AcqRel);
            (*(b as *mut FusionGroup))
                .parent
                .store(a_mut, Ordering::Release);
        }
    }

    /// Allocate uninitialized memory for type T, returning a raw pointer
    pub fn alloc<T>(&mut self) -> *mut T {
        let layout = Layout::new::<T>();
        let ptr = self.alloc_raw(layout);
        ptr.as_ptr() as *mut T
    }

    /// Allocate an uninitialized slice of T with given length
    pub fn alloc_slice<T>(&mut self, len: usize) -> *mut [T] {
        let layout = Layout::array::<T>(len).expect("Layout overflow");
        let ptr = self.alloc_raw(layout);

        ptr::slice_from_raw_parts_mut(ptr.as_ptr() as *mut T, len)
    }

    /// Allocate raw memory with given size and alignment (uninitialized)
    #[inline]
    pub fn alloc_raw(&mut self, layout: Layout) -> NonNull<u8> {
        let size = layout.size();
        let align = layout.align();

        // Align the cursor to the required alignment
        let cursor_addr = self.cursor as usize;
        let aligned_addr = (cursor_addr + align - 1) & !(align - 1);
        let aligned_cursor = aligned_addr as *mut u8;

        // Check if we have enough space: end - aligned_cursor >= size
        let available = self.end as usize - aligned_cursor as usize;
        if std::hint::likely(available >= size) {
            // Fits in current block - use it regardless of size
            self.cursor = unsafe { aligned_cursor.add(size) };
            return unsafe { NonNull::new_unchecked(aligned_cursor) };
        }

        // Doesn't fit - need new allocation strategy
        self.alloc_outlined(layout, available)
    }

    /// Grows (or shrinks) a previous allocation. If `old_ptr` is the most
    /// recent allocation and the new size still fits in the current block,
    /// grows in place by bumping the cursor; otherwise allocates fresh and
    /// copies `old_size` bytes over. The old allocation, if not grown in
    /// place, is simply abandoned (arenas never reclaim individual frees).
    pub fn realloc(&mut self, old_ptr: NonNull<u8>, old_size: usize, new_size: usize) -> NonNull<u8> {
        let is_last_alloc = unsafe { old_ptr.as_ptr().add(old_size) == self.cursor };
        if is_last_alloc {
            let grown_end = unsafe { old_ptr.as_ptr().add(new_size) };
            if grown_end <= self.end {
                self.cursor = grown_end;
                return old_ptr;
            }
        }
        let layout = Layout::from_size_align(new_size, 8).expect("layout overflow");
        let new_ptr = self.alloc_raw(layout);
        unsafe {
            ptr::copy_nonoverlapping(old_ptr.as_ptr(), new_ptr.as_ptr(), old_size.min(new_size));
        }
        new_ptr
    }

    /// Get total bytes allocated by this arena
    pub fn bytes_allocated(&self) -> usize {
        let mut total = 0;
        let mut current = self.current;

        unsafe {
            while !current.is_null() {
                total += (*current).layout.size();
                current = (*current).prev;
            }
        }

        total
    }

    /// Allocate a new memory block - never inlined to keep fast path small
    #[inline(never)]
    fn alloc_outlined(&mut self, layout: Layout, available: usize) -> NonNull<u8> {
        const SIGNIFICANT_SPACE_THRESHOLD: usize = 512; // 512 bytes is "significant"

        if available >= SIGNIFICANT_SPACE_THRESHOLD {
            // Significant free space left, which implies this is a large allocation
            // Keep the free space and just allocate a dedicated block for this allocation
            // and keep the current block for future allocations.
            self.alloc_dedicated(layout)
        } else {
            // Little space left - allocate new block sized for this allocation + future allocations
            self.allocate_new_block(layout)
        }
    }

    /// Allocate a new memory block
    fn allocate_new_block(&mut self, alloc_layout: Layout) -> NonNull<u8> {
        // Calculate block size - grow exponentially but respect min_size

        let (layout, offset) = Layout::new::<MemBlock>()
            .extend(alloc_layout)
            .expect("Layout overflow");
        let layout = layout.pad_to_align();

        let new_block_size = if self.current.is_null() {
            DEFAULT_BLOCK_SIZE
        } else {
            let current_block_size = unsafe { (*self.current).layout.size() };
            (current_block_size * 2).min(MAX_BLOCK_SIZE)
        };

        let (layout, block_start) = layout
            .extend(Layout::array::<u8>(new_block_size).expect("Layout overflow"))
            .expect("Layout overflow");
        let layout = layout.pad_to_align();

        let ptr = self
            .allocator
            .allocate(layout)
            .expect("Allocation failed")
            .as_ptr() as *mut MemBlock;

        unsafe {
            // Initialize the MemBlock header
            (*ptr).prev = self.current;
            (*ptr).layout = layout;
            (*ptr).allocator = self.allocator as *const dyn Allocator;

            // Update arena state - this becomes the new active block
            self.current = ptr;
            self.cursor = (ptr as *mut u8).add(block_start);
            self.end = (ptr as *mut u8).add(layout.size());
            NonNull::new_unchecked((ptr as *mut u8).add(offset))
        }
    }

    /// Allocate a dedicated (large) memory directly from allocator (dedicated block)
    fn alloc_dedicated(&mut self, layout: Layout) -> NonNull<u8> {
        // Use layout extend for proper alignment
        let memblock_layout = Layout::new::<MemBlock>();
        let (extended_layout, data_offset) =
            memblock_layout.extend(layout).expect("Layout overflow");
        let final_layout = extended_layout.pad_to_align();

        let ptr = self
            .allocator
            .allocate(final_layout)
            .expect("Allocation failed")
            .as_ptr() as *mut MemBlock;

        unsafe {
            (*ptr).layout = final_layout;
            (*ptr).allocator = self.allocator as *const dyn Allocator;

            // Insert just after current head, keeping current as head
            if !self.current.is_null() {
                // Insert between current and current.prev
                (*ptr).prev = (*self.current).prev;
                (*self.current).prev = ptr;
            } else {
                // No blocks yet, this becomes the only block
                (*ptr).prev = ptr::null_mut();
                self.current = ptr;
                // Still no active bump allocation (cursor/end remain null)
            }

            // Return aligned data pointer after header
            let data_ptr = (ptr as *mut u8).add(data_offset);
            NonNull::new_unchecked(data_ptr)
        }
    }
}

impl<'a> Drop for Arena<'a> {
    fn drop(&mut self) {
        unsafe {
            run_cleanups(self.cleanup_head);

            let root = FusionGroup::find_root(self.group) as *mut FusionGroup;
            let prev_count = (*root).refcount.fetch_sub(1, Ordering::AcqRel);
            if prev_count > 1 {
                // Other members of the fusion group are still alive; hand
                // our blocks to the group instead of freeing them.
                let mut tail = self.current;
                if !tail.is_null() {
                    loop {
                        let next_tail = (*tail).prev;
                        if next_tail.is_null() {
                            break;
                        }
                        tail = next_tail;
                    }
                    let mut pending = root.as_ref().unwrap().pending.load(Ordering::Acquire);
                    loop {
                        (*tail).prev = pending;
                        match (*root).pending.compare_exchange_weak(
                            pending,
                            self.current,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        ) {
                            Ok(_) => break,
                            Err(actual) => pending = actual,
                        }
                    }
                }
                return;
            }

            // Last member standing: free our own blocks plus whatever the
            // group accumulated from earlier members.
            free_block_list(self.current);
            free_block_list((*root).pending.load(Ordering::Acquire));
            drop(Box::from_raw(root));
        }
    }
}

unsafe fn run_cleanups(mut node: *mut CleanupNode) {
    while !node.is_null() {
        unsafe {
            let next = (*node).next;
            ((*node).func)((*node).data);
            node = next;
        }
    }
}

unsafe fn free_block_list(mut current: *mut MemBlock) {
    while !current.is_null() {
        unsafe {
            let prev = (*current).prev;
            let layout = (*current).layout;
            let allocator = &*(*current).allocator;
            let ptr = NonNull::new_unchecked(current as *mut u8);
            allocator.deallocate(ptr, layout);
            current = prev;
        }
    }
}

// Safety: Arena can be sent between threads if the allocator supports it
unsafe impl<'a> Send for Arena<'a> where &'a dyn Allocator: Send {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::alloc::Global;

    #[test]
    fn test_basic_allocation() {
        let mut arena = Arena::new(&Global);

        let ptr1: *mut u32 = arena.alloc();
        let ptr2: *mut u64 = arena.alloc();

        unsafe {
            *ptr1 = 42;
            *ptr2 = 1337;

            assert_eq!(*ptr1, 42);
            assert_eq!(*ptr2, 1337);
        }
    }

    #[test]
    fn test_slice_allocation() {
        let mut arena = Arena::new(&Global);

        let slice_ptr: *mut [u32] = arena.alloc_slice(100);

        unsafe {
            let slice = &mut *slice_ptr;
            slice[0] = 1;
            slice[99] = 2;

            assert_eq!(slice.len(), 100);
            assert_eq!(slice[0], 1);
            assert_eq!(slice[99], 2);
        }
    }

    #[test]
    fn test_alignment() {
        let mut arena = Arena::new(&Global);

        // Allocate types with different alignment requirements
        let _u8_ptr: *mut u8 = arena.alloc();
        let u64_ptr: *mut u64 = arena.alloc();

        // Check that u64 is properly aligned
        assert_eq!(u64_ptr as usize % std::mem::align_of::<u64>(), 0);
    }

    #[test]
    fn test_large_allocation() {
        let mut arena = Arena::new(&Global);

        // Allocate something larger than default block size
        let large_slice_ptr: *mut [u8] = arena.alloc_slice(DEFAULT_BLOCK_SIZE * 2);

        unsafe {
            let large_slice = &mut *large_slice_ptr;
            large_slice[0] = 1;
            large_slice[large_slice.len() - 1] = 2;

            assert_eq!(large_slice[0], 1);
            assert_eq!(large_slice[large_slice.len() - 1], 2);
        }
    }

    #[test]
    fn test_realloc_copies_contents_when_not_last_alloc() {
        let mut arena = Arena::new(&Global);
        let first: *mut u64 = arena.alloc();
        unsafe { *first = 1 };
        let second: *mut u64 = arena.alloc();
        unsafe { *second = 2 };

        let grown = arena.realloc(NonNull::new(first as *mut u8).unwrap(), 8, 16);
        unsafe {
            assert_eq!(*(grown.as_ptr() as *const u64), 1);
        }
    }

    #[test]
    fn test_cleanup_runs_lifo() {
        use std::sync::Mutex;

        static ORDER: Mutex<Vec<u32>> = Mutex::new(Vec::new());

        unsafe fn record(data: *mut ()) {
            ORDER.lock().unwrap().push(data as usize as u32);
        }

        {
            let mut arena = Arena::new(&Global);
            arena.add_cleanup(1 as *mut (), record);
            arena.add_cleanup(2 as *mut (), record);
            arena.add_cleanup(3 as *mut (), record);
        }

        assert_eq!(*ORDER.lock().unwrap(), vec![3, 2, 1]);
    }

    #[test]
    fn test_fuse_keeps_both_alive_until_last_drop() {
        static FREED: AtomicUsize = AtomicUsize::new(0);

        unsafe fn mark_freed(_data: *mut ()) {
            FREED.fetch_add(1, Ordering::SeqCst);
        }

        let mut a = Arena::new(&Global);
        let mut b = Arena::new(&Global);
        a.add_cleanup(ptr::null_mut(), mark_freed);
        b.add_cleanup(ptr::null_mut(), mark_freed);
        a.fuse(&b);

        drop(a);
        assert_eq!(FREED.load(Ordering::SeqCst), 1, "only one member dropped so far");
        drop(b);
        assert_eq!(FREED.load(Ordering::SeqCst), 2, "both cleanups ran by the last drop");
    }
}
