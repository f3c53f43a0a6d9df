use std::cell::{Cell, UnsafeCell};
use std::fmt;
use std::mem::size_of;
use std::ops::{Deref, Drop};

use crate::{Error, Link, Linked, Links, Release};

/// Called with the payload once the last reference to a block is released.
pub type Destructor<T> = fn(&T);

/// A fixed capacity pool of reference counted blocks.
///
/// Every block carries a reference count and an optional [`Destructor`]. The destructor runs when
/// the count reaches zero, before the payload is dropped and the slot returned to the free list.
///
/// The pool is the allocator context: it tracks its own live blocks, so independent pools can
/// coexist. It is single-threaded; wrap it in a [`crate::Mutex`] to share it.
#[repr(C)]
pub struct Pool<const N: usize, T> {
    head: Cell<Option<usize>>,
    stats: Cell<Stats>,
    slots: [Slot<T>; N],
}

impl<const N: usize, T> Pool<N, T> {
    #[must_use]
    pub fn new() -> Self {
        #[cfg(feature = "log")]
        log::trace!("Pool::new");

        Self {
            head: Cell::new(if N > 0 { Some(0) } else { None }),
            stats: Cell::new(Stats::default()),
            slots: std::array::from_fn(|i| Slot {
                refs: Cell::new(0),
                generation: Cell::new(0),
                next: Cell::new(if i + 1 < N { Some(i + 1) } else { None }),
                destructor: Cell::new(None),
                value: UnsafeCell::new(None),
            }),
        }
    }

    /// Allocates a block holding `value` with a reference count of 1.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfMemory`] when every slot is live.
    pub fn alloc(&self, value: T, destructor: Option<Destructor<T>>) -> Result<Mem<N, T>, Error> {
        let Some(index) = self.head.get() else {
            #[cfg(feature = "log")]
            log::trace!("Pool::alloc out of memory capacity={}", N);

            return Err(Error::OutOfMemory { capacity: N });
        };

        let slot = &self.slots[index];
        self.head.set(slot.next.take());
        // SAFETY: A free slot has no handles, so nothing borrows its value.
        unsafe {
            *slot.value.get() = Some(value);
        }
        slot.refs.set(1);
        slot.destructor.set(destructor);
        self.stats.set(self.stats.get().allocated(size_of::<T>()));

        #[cfg(feature = "log")]
        log::trace!("Pool::alloc index={index}");

        Ok(Mem {
            pool: self,
            index,
            generation: slot.generation.get(),
        })
    }

    /// Allocates a zero initialised block, that is one holding `T::default()`.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfMemory`] when every slot is live.
    pub fn zalloc(&self, destructor: Option<Destructor<T>>) -> Result<Mem<N, T>, Error>
    where
        T: Default,
    {
        self.alloc(T::default(), destructor)
    }

    /// Rebuilds a handle from an index returned by [`Mem::into_raw`].
    ///
    /// # Safety
    ///
    /// `index` must come from [`Mem::into_raw`] on this pool and the reference it stands for must
    /// not have been released or rebuilt since.
    ///
    /// # Panics
    ///
    /// When the block at `index` is free.
    pub unsafe fn from_raw(&self, index: usize) -> Mem<N, T> {
        let slot = &self.slots[index];
        assert!(slot.refs.get() > 0, "block {index} is free");
        Mem {
            pool: self,
            index,
            generation: slot.generation.get(),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        N
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.head.get().is_none()
    }

    #[must_use]
    pub fn stats(&self) -> Stats {
        self.stats.get()
    }

    /// Lists every block that still holds at least one reference.
    #[must_use]
    pub fn live_blocks(&self) -> Vec<LiveBlock> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.refs.get() > 0)
            .map(|(index, slot)| LiveBlock {
                index,
                size: size_of::<T>(),
                refs: slot.refs.get(),
            })
            .collect()
    }

    /// Logs every live block and returns how many there are.
    ///
    /// Meant to be called when all references should have been released, a non-zero return is a
    /// leak.
    pub fn debug(&self) -> usize {
        let live = self.live_blocks();

        #[cfg(feature = "log")]
        for block in &live {
            log::warn!(
                "Pool::debug live block index={} size={} refs={}",
                block.index,
                block.size,
                block.refs
            );
        }

        live.len()
    }

    fn acquire_index(&self, index: usize) {
        let slot = &self.slots[index];
        let refs = slot.refs.get();
        assert!(refs > 0, "acquire of free block {index}");
        slot.refs.set(refs + 1);

        #[cfg(feature = "log")]
        log::trace!("Pool::acquire index={index} refs={}", refs + 1);
    }

    fn release_index(&self, index: usize) {
        let slot = &self.slots[index];
        let refs = slot.refs.get();
        assert!(refs > 0, "release of free block {index}");
        slot.refs.set(refs - 1);

        #[cfg(feature = "log")]
        log::trace!("Pool::release index={index} refs={}", refs - 1);

        if refs > 1 {
            return;
        }

        // Frees the slot even when the destructor panics.
        let reclaim = Reclaim { pool: self, index };
        if let Some(destructor) = slot.destructor.take() {
            // SAFETY: The value stays in place until the destructor returns.
            destructor(unsafe { self.value(index) });
        }
        drop(reclaim);
    }

    fn reclaim(&self, index: usize) {
        let slot = &self.slots[index];
        // SAFETY: The count is zero, no handle can reach the value any more.
        let value = unsafe { (*slot.value.get()).take() };
        slot.generation.set(slot.generation.get().wrapping_add(1));
        slot.next.set(self.head.get());
        self.head.set(Some(index));
        self.stats.set(self.stats.get().freed(size_of::<T>()));

        // Dropped last so a payload holding handles into other pools may release them.
        drop(value);
    }

    /// # Safety
    ///
    /// The returned reference must not outlive the block.
    unsafe fn value(&self, index: usize) -> &T {
        match &*self.slots[index].value.get() {
            Some(value) => value,
            None => panic!("block {index} is free"),
        }
    }
}

impl<const N: usize, T> Default for Pool<N, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize, T> fmt::Debug for Pool<N, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("capacity", &N)
            .field("head", &self.head.get())
            .field("stats", &self.stats.get())
            .finish_non_exhaustive()
    }
}

impl<'a, const N: usize, T> Links<'a> for Pool<N, T>
where
    T: 'a + Linked<'a, Pool<N, T>>,
{
    unsafe fn link(&self, index: usize) -> &Link<'a, Self> {
        // SAFETY: The caller keeps the block in place while the link is used.
        unsafe { self.value(index) }.link()
    }
}

impl<'a, const N: usize, T> Release<'a> for Pool<N, T>
where
    T: 'a + Linked<'a, Pool<N, T>>,
{
    type Handle = Mem<'a, N, T>;

    fn index(&self, handle: &Self::Handle) -> usize {
        assert!(
            std::ptr::eq(handle.pool, self),
            "handle belongs to another pool"
        );
        handle.index
    }

    fn into_raw(&self, handle: Self::Handle) -> usize {
        let index = self.index(&handle);
        std::mem::forget(handle);
        index
    }

    unsafe fn from_raw(&'a self, index: usize) -> Self::Handle {
        unsafe { Pool::from_raw(self, index) }
    }

    unsafe fn release(&self, index: usize) {
        self.release_index(index);
    }
}

// Returns a released slot to the free list when dropped.
struct Reclaim<'p, const N: usize, T> {
    pool: &'p Pool<N, T>,
    index: usize,
}

impl<'p, const N: usize, T> Drop for Reclaim<'p, N, T> {
    fn drop(&mut self) {
        self.pool.reclaim(self.index);
    }
}

#[repr(C)]
struct Slot<T> {
    refs: Cell<usize>,
    generation: Cell<u32>,
    next: Cell<Option<usize>>,
    destructor: Cell<Option<Destructor<T>>>,
    value: UnsafeCell<Option<T>>,
}

/// Allocation counters, current and peak.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    pub blocks_cur: usize,
    pub blocks_max: usize,
    pub size_cur: usize,
    pub size_max: usize,
}

impl Stats {
    fn allocated(self, size: usize) -> Self {
        let blocks_cur = self.blocks_cur + 1;
        let size_cur = self.size_cur + size;
        Self {
            blocks_cur,
            blocks_max: self.blocks_max.max(blocks_cur),
            size_cur,
            size_max: self.size_max.max(size_cur),
        }
    }

    fn freed(self, size: usize) -> Self {
        Self {
            blocks_cur: self.blocks_cur - 1,
            size_cur: self.size_cur - size,
            ..self
        }
    }
}

/// An entry of the leak report returned by [`Pool::live_blocks`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveBlock {
    pub index: usize,
    pub size: usize,
    pub refs: usize,
}

/// A counted reference to a block in a [`Pool`].
///
/// Cloning acquires a reference, dropping releases one.
#[repr(C)]
pub struct Mem<'a, const N: usize, T> {
    pool: &'a Pool<N, T>,
    index: usize,
    generation: u32,
}

impl<'a, const N: usize, T> Mem<'a, N, T> {
    #[must_use]
    pub fn pool(&self) -> &'a Pool<N, T> {
        self.pool
    }

    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// The current reference count of the block.
    #[must_use]
    pub fn refs(&self) -> usize {
        self.pool.slots[self.index].refs.get()
    }

    /// Gives up the handle without releasing its reference, see [`Pool::from_raw`].
    #[must_use]
    pub fn into_raw(self) -> usize {
        let index = self.index;
        std::mem::forget(self);
        index
    }

    #[must_use]
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        std::ptr::eq(this.pool, other.pool) && this.index == other.index
    }

    fn check(&self) {
        debug_assert_eq!(
            self.pool.slots[self.index].generation.get(),
            self.generation,
            "stale handle to block {}",
            self.index
        );
    }
}

impl<'a, const N: usize, T> Clone for Mem<'a, N, T> {
    fn clone(&self) -> Self {
        self.check();
        self.pool.acquire_index(self.index);
        Self {
            pool: self.pool,
            index: self.index,
            generation: self.generation,
        }
    }
}

impl<'a, const N: usize, T> Drop for Mem<'a, N, T> {
    fn drop(&mut self) {
        self.check();
        self.pool.release_index(self.index);
    }
}

impl<'a, const N: usize, T> Deref for Mem<'a, N, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        self.check();
        // SAFETY: The handle holds a reference, the block outlives the borrow of `self`.
        unsafe { self.pool.value(self.index) }
    }
}

impl<'a, const N: usize, T> fmt::Debug for Mem<'a, N, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mem")
            .field("index", &self.index)
            .field("generation", &self.generation)
            .field("refs", &self.refs())
            .finish()
    }
}
