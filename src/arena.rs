//! A concurrent, append-only arena with stable element addresses.
//!
//! Elements live in fixed-size pages that are allocated on demand and never move. The
//! pages are reachable through a page table which is itself grown by allocating a larger
//! table, copying the page pointers and publishing it atomically. Old tables are kept
//! around until the arena is dropped, so a thread that loaded a table pointer before a
//! growth keeps reading valid memory.
//!
//! Appending within the current capacity only touches an atomic counter. Allocating a
//! new page (and possibly a new table) happens under a lock.
//!
//! The scheduler stores its job records here, which is what lets worker threads hold
//! plain references to in-flight jobs while other threads keep submitting.

use crate::sync::{Ordering, AtomicBool, AtomicPtr, AtomicUsize, Mutex};

use aliasable::boxed::AliasableBox;
use crossbeam_utils::Backoff;

use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::ptr;

pub const DEFAULT_PAGE_SIZE: usize = 256;
const INITIAL_TABLE_LEN: usize = 8;

struct Slot<T> {
    value: UnsafeCell<MaybeUninit<T>>,
    // Set once the value has been written. A slot can be claimed but not written yet
    // while its emplacing thread is between the two steps.
    written: AtomicBool,
}

impl<T> Slot<T> {
    fn empty() -> Self {
        Slot {
            value: UnsafeCell::new(MaybeUninit::uninit()),
            written: AtomicBool::new(false),
        }
    }

    #[inline]
    fn is_written(&self) -> bool {
        self.written.load(Ordering::Acquire)
    }

    /// Safety: the value must have been written.
    #[inline]
    unsafe fn get_ref(&self) -> &T {
        (*self.value.get()).assume_init_ref()
    }
}

impl<T> Drop for Slot<T> {
    fn drop(&mut self) {
        if self.is_written() {
            unsafe {
                (*self.value.get()).assume_init_drop();
            }
        }
    }
}

struct PageTable<T> {
    pages: Box<[AtomicPtr<Slot<T>>]>,
}

impl<T> PageTable<T> {
    fn with_len(len: usize) -> Self {
        PageTable {
            pages: (0..len).map(|_| AtomicPtr::new(ptr::null_mut())).collect(),
        }
    }

    /// A table twice as large containing the same page pointers.
    fn grow_from(previous: &Self) -> Self {
        let table = PageTable::with_len(previous.pages.len() * 2);
        for (dst, src) in table.pages.iter().zip(previous.pages.iter()) {
            dst.store(src.load(Ordering::Relaxed), Ordering::Relaxed);
        }

        table
    }
}

// Owns the memory. Only touched under the growth lock.
struct Storage<T> {
    pages: Vec<AliasableBox<[Slot<T>]>>,
    // All tables ever published, the current one included.
    tables: Vec<AliasableBox<PageTable<T>>>,
}

/// A concurrent append-only collection of `T` with stable addresses.
pub struct Arena<T> {
    // Number of claimed slots.
    len: AtomicUsize,
    // Number of slots backed by a published page.
    capacity: AtomicUsize,
    table: AtomicPtr<PageTable<T>>,
    storage: Mutex<Storage<T>>,
    page_size: usize,
    _marker: PhantomData<T>,
}

unsafe impl<T: Send> Send for Arena<T> {}
unsafe impl<T: Send + Sync> Sync for Arena<T> {}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Self::with_page_size(DEFAULT_PAGE_SIZE)
    }

    pub fn with_page_size(page_size: usize) -> Self {
        Self::with_layout(page_size, INITIAL_TABLE_LEN)
    }

    pub(crate) fn with_layout(page_size: usize, table_len: usize) -> Self {
        assert!(page_size > 0, "arena pages must hold at least one element");
        assert!(table_len > 0);

        let table = AliasableBox::from_unique(Box::new(PageTable::with_len(table_len)));
        let table_ptr = &*table as *const PageTable<T> as *mut PageTable<T>;

        Arena {
            len: AtomicUsize::new(0),
            capacity: AtomicUsize::new(0),
            table: AtomicPtr::new(table_ptr),
            storage: Mutex::new(Storage {
                pages: Vec::new(),
                tables: vec![table],
            }),
            page_size,
            _marker: PhantomData,
        }
    }

    /// Append an element and return its index along with a reference to it.
    ///
    /// Both remain valid until the arena is dropped.
    pub fn emplace(&self, value: T) -> (usize, &T) {
        let index = self.claim();
        let slot = self.slot(index);

        unsafe {
            (*slot.value.get()).write(value);
        }
        slot.written.store(true, Ordering::Release);

        (index, unsafe { slot.get_ref() })
    }

    /// Look up an element by index.
    ///
    /// Panics if the index was never returned by `emplace`, or if its value is still
    /// being written.
    pub fn get(&self, index: usize) -> &T {
        match self.try_get(index) {
            Some(value) => value,
            None => panic!(
                "arena index {} is not populated (len: {})",
                index, self.len(),
            ),
        }
    }

    pub fn try_get(&self, index: usize) -> Option<&T> {
        if index >= self.capacity.load(Ordering::Acquire) {
            return None;
        }

        let slot = self.slot(index);
        if !slot.is_written() {
            return None;
        }

        Some(unsafe { slot.get_ref() })
    }

    /// Call `f` on every populated element, in index order.
    ///
    /// Slots claimed by a concurrent `emplace` that has not written its value yet are
    /// skipped.
    pub fn for_each(&self, mut f: impl FnMut(usize, &T)) {
        let len = self.len();
        for index in 0..len {
            if let Some(value) = self.try_get(index) {
                f(index, value);
            }
        }
    }

    /// Number of claimed slots.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Acquire)
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    // Must only be called with an index below `capacity`.
    #[inline]
    fn slot(&self, index: usize) -> &Slot<T> {
        // The table is loaded after the index was claimed (or observed below capacity),
        // so it contains the page: pages are published before capacity is bumped.
        let table = unsafe { &*self.table.load(Ordering::Acquire) };
        let page = table.pages[index / self.page_size].load(Ordering::Acquire);
        debug_assert!(!page.is_null());

        unsafe { &*page.add(index % self.page_size) }
    }

    fn claim(&self) -> usize {
        let backoff = Backoff::new();
        let mut len = self.len.load(Ordering::Relaxed);
        loop {
            if len < self.capacity.load(Ordering::Acquire) {
                let res = self.len.compare_exchange_weak(
                    len,
                    len + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                );
                match res {
                    Ok(_) => {
                        return len;
                    }
                    Err(actual) => {
                        len = actual;
                        backoff.spin();
                        continue;
                    }
                }
            }

            if let Some(index) = self.grow() {
                return index;
            }

            len = self.len.load(Ordering::Relaxed);
        }
    }

    /// Slow path: allocate a page and claim its first slot.
    ///
    /// Returns None if another thread grew the arena while we were waiting for the lock,
    /// in which case the caller goes back to the fast path.
    #[cold]
    fn grow(&self) -> Option<usize> {
        let mut storage = self.storage.lock().unwrap();

        // Only modified under the lock.
        let capacity = self.capacity.load(Ordering::Relaxed);
        if self.len.load(Ordering::Relaxed) < capacity {
            return None;
        }

        profiling::scope!("arena::grow");

        // Nobody can claim past capacity, so all slots are taken.
        debug_assert_eq!(self.len.load(Ordering::Relaxed), capacity);

        let page_index = capacity / self.page_size;
        let page: Box<[Slot<T>]> = (0..self.page_size).map(|_| Slot::empty()).collect();
        let page = AliasableBox::from_unique(page);
        let page_ptr = page.as_ptr() as *mut Slot<T>;
        storage.pages.push(page);

        let mut table = unsafe { &*self.table.load(Ordering::Relaxed) };
        if page_index == table.pages.len() {
            let bigger = AliasableBox::from_unique(Box::new(PageTable::grow_from(table)));
            let bigger_ptr = &*bigger as *const PageTable<T> as *mut PageTable<T>;
            // The previous table stays alive in `storage.tables`.
            storage.tables.push(bigger);
            self.table.store(bigger_ptr, Ordering::Release);
            table = unsafe { &*bigger_ptr };
        }

        table.pages[page_index].store(page_ptr, Ordering::Release);

        // Claim the first slot of the new page before making it visible to the fast path.
        self.len.store(capacity + 1, Ordering::Relaxed);
        self.capacity.store(capacity + self.page_size, Ordering::Release);

        Some(capacity)
    }
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[test]
fn test_emplace_and_get() {
    let arena = Arena::with_page_size(4);
    assert!(arena.is_empty());

    for i in 0..100u32 {
        let (index, value) = arena.emplace(i * 10);
        assert_eq!(index, i as usize);
        assert_eq!(*value, i * 10);
    }

    assert_eq!(arena.len(), 100);
    assert_eq!(arena.capacity(), 100);
    assert_eq!(*arena.get(42), 420);

    let mut visited = 0;
    arena.for_each(|index, value| {
        assert_eq!(*value, index as u32 * 10);
        visited += 1;
    });
    assert_eq!(visited, 100);
}

#[test]
fn test_try_get_out_of_bounds() {
    let arena = Arena::with_page_size(8);
    arena.emplace(1u8);

    assert!(arena.try_get(0).is_some());
    // Within the first page but never claimed.
    assert!(arena.try_get(1).is_none());
    assert!(arena.try_get(1000).is_none());
}

#[test]
#[should_panic]
fn test_get_unpopulated() {
    let arena: Arena<u32> = Arena::new();
    arena.get(3);
}

#[test]
fn test_concurrent_emplace() {
    const THREADS: usize = 8;
    const PER_THREAD: usize = 2000;

    // A small page size forces lots of page allocations and several table growths.
    let arena = Arena::with_page_size(7);

    let results: Vec<Vec<(usize, &u64, u64)>> = std::thread::scope(|s| {
        let workers: Vec<_> = (0..THREADS).map(|t| {
            let arena = &arena;
            s.spawn(move || {
                let mut refs = Vec::with_capacity(PER_THREAD);
                for i in 0..PER_THREAD {
                    let value = (t * PER_THREAD + i) as u64;
                    let (index, r) = arena.emplace(value);
                    refs.push((index, r, value));
                }
                refs
            })
        }).collect();

        workers.into_iter().map(|w| w.join().unwrap()).collect()
    });

    assert_eq!(arena.len(), THREADS * PER_THREAD);

    let mut indices = Vec::new();
    for refs in &results {
        for &(index, r, value) in refs {
            // References handed out early are still valid after all the growth.
            assert_eq!(*r, value);
            assert!(std::ptr::eq(arena.get(index), r));
            indices.push(index);
        }
    }

    indices.sort_unstable();
    indices.dedup();
    assert_eq!(indices.len(), THREADS * PER_THREAD);
    assert_eq!(indices.last().copied(), Some(THREADS * PER_THREAD - 1));
}

#[test]
fn test_drops_elements() {
    use std::sync::Arc;

    let counter = Arc::new(());
    {
        let arena = Arena::with_page_size(3);
        for _ in 0..10 {
            arena.emplace(counter.clone());
        }
        assert_eq!(Arc::strong_count(&counter), 11);
    }

    assert_eq!(Arc::strong_count(&counter), 1);
}

#[cfg(loom)]
#[test]
fn test_loom_concurrent_growth() {
    loom::model(|| {
        // One slot per page and a single-entry table: every emplace grows a page and
        // the second page also grows the table.
        let arena = std::sync::Arc::new(Arena::with_layout(1, 1));

        let other = arena.clone();
        let t = loom::thread::spawn(move || {
            let (index, value) = other.emplace(1u32);
            assert_eq!(*value, 1);
            index
        });

        let (a, _) = arena.emplace(0u32);
        let b = t.join().unwrap();

        assert_ne!(a, b);
        assert_eq!(*arena.get(a), 0);
        assert_eq!(*arena.get(b), 1);
        assert_eq!(arena.len(), 2);
    });
}
