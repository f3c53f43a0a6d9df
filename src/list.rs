//! An intrusive doubly linked list.
//!
//! The list never owns the objects it links. Each object embeds a [`Link`] and lives in a store, a
//! slice of caller objects or a [`crate::Pool`], and links address their neighbours by the index
//! of the containing object within that store. Every [`Link`] also keeps a reference to the
//! [`List`] it belongs to, so it can be unlinked on its own, for example from a release callback.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::iter::FusedIterator;

/// Gives access to the [`Link`] an object embeds.
pub trait Linked<'a, S: ?Sized + 'a> {
    fn link(&self) -> &Link<'a, S>;
}

/// A store of linked objects, addressed by index.
///
/// Resolving a link is `unsafe` since the returned reference borrows the store rather than the
/// object, which a counted store may free and reuse:
///
/// ```compile_fail
/// use counted_lists::{Link, Linked, Links, Pool};
///
/// #[derive(Default)]
/// struct Node<'a> {
///     le: Link<'a, Pool<1, Node<'a>>>,
/// }
///
/// impl<'a> Linked<'a, Pool<1, Node<'a>>> for Node<'a> {
///     fn link(&self) -> &Link<'a, Pool<1, Node<'a>>> {
///         &self.le
///     }
/// }
///
/// let pool = Pool::<1, Node>::new();
/// let node = pool.zalloc(None).unwrap();
/// let link = pool.link(node.index());
/// ```
pub trait Links<'a>: 'a {
    /// # Safety
    ///
    /// The object at `index` must stay in place while the returned reference is used.
    ///
    /// # Panics
    ///
    /// When `index` does not address an object of the store.
    unsafe fn link(&self, index: usize) -> &Link<'a, Self>;
}

/// A store whose objects are reference counted, so list membership may hold a reference.
pub trait Release<'a>: Links<'a> {
    /// A counted reference to an object of the store.
    type Handle;

    /// The index of the object `handle` refers to.
    ///
    /// # Panics
    ///
    /// When `handle` refers to an object of another store.
    fn index(&self, handle: &Self::Handle) -> usize;

    /// Gives up `handle` without releasing its reference, returning the index of its object.
    fn into_raw(&self, handle: Self::Handle) -> usize;

    /// Rebuilds a handle given up with [`Release::into_raw`].
    ///
    /// # Safety
    ///
    /// The caller must own the reference given up for `index`, which is passed on to the handle.
    unsafe fn from_raw(&'a self, index: usize) -> Self::Handle;

    /// Releases one reference on the object at `index`.
    ///
    /// # Safety
    ///
    /// The caller must own a reference on the object previously given up with
    /// [`Release::into_raw`].
    unsafe fn release(&self, index: usize);
}

impl<'a, T> Links<'a> for [T]
where
    T: 'a + Linked<'a, [T]>,
{
    unsafe fn link(&self, index: usize) -> &Link<'a, Self> {
        self[index].link()
    }
}

/// The linkage embedded in a caller object.
pub struct Link<'a, S: ?Sized> {
    prev: Cell<Option<usize>>,
    next: Cell<Option<usize>>,
    list: Cell<Option<&'a List<'a, S>>>,
    data: Cell<Option<usize>>,
    owned: Cell<bool>,
}

impl<'a, S: Links<'a> + ?Sized> Link<'a, S> {
    /// Removes the link from the list it belongs to.
    ///
    /// Does nothing when the link is not in a list. Never releases the containing object: when
    /// list membership held a reference on it, the list keeps that reference until
    /// [`List::flush`] or [`List::remove`].
    pub fn unlink(&self) {
        let index = self.data.get();
        let Some((list, owned)) = self.detach() else {
            return;
        };

        #[cfg(feature = "log")]
        log::trace!("Link::unlink data={index:?} owned={owned}");

        if let (true, Some(index)) = (owned, index) {
            list.detached.borrow_mut().push(index);
        }
    }

    /// Unlinks without touching the reference membership may hold, returning the list it was in
    /// and whether membership held a reference.
    fn detach(&self) -> Option<(&'a List<'a, S>, bool)> {
        let list = self.list.take()?;

        let prev = self.prev.take();
        let next = self.next.take();
        self.data.set(None);
        let owned = self.owned.replace(false);

        match prev {
            Some(prev) => list.link(prev).next.set(next),
            None => list.head.set(next),
        }
        match next {
            Some(next) => list.link(next).prev.set(prev),
            None => list.tail.set(prev),
        }
        list.len.set(list.len.get() - 1);

        Some((list, owned))
    }
}

impl<'a, S: ?Sized> Link<'a, S> {
    #[must_use]
    pub fn is_linked(&self) -> bool {
        self.list.get().is_some()
    }

    /// Whether the link is a member of `list`.
    #[must_use]
    pub fn list_is(&self, list: &List<'a, S>) -> bool {
        matches!(self.list.get(), Some(current) if std::ptr::eq(current, list))
    }

    #[must_use]
    pub fn prev(&self) -> Option<usize> {
        self.prev.get()
    }

    #[must_use]
    pub fn next(&self) -> Option<usize> {
        self.next.get()
    }

    /// Index of the containing object, set while linked.
    #[must_use]
    pub fn data(&self) -> Option<usize> {
        self.data.get()
    }

    /// Whether list membership holds a reference on the containing object.
    #[must_use]
    pub fn is_owned(&self) -> bool {
        self.owned.get()
    }
}

impl<'a, S: ?Sized> Default for Link<'a, S> {
    fn default() -> Self {
        Self {
            prev: Cell::new(None),
            next: Cell::new(None),
            list: Cell::new(None),
            data: Cell::new(None),
            owned: Cell::new(false),
        }
    }
}

impl<'a, S: ?Sized> fmt::Debug for Link<'a, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("prev", &self.prev.get())
            .field("next", &self.next.get())
            .field("list", &self.list.get().map(|list| list as *const List<'a, S>))
            .field("data", &self.data.get())
            .field("owned", &self.owned.get())
            .finish()
    }
}

/// The header of an intrusive list over the objects of a store.
pub struct List<'a, S: ?Sized> {
    store: &'a S,
    head: Cell<Option<usize>>,
    tail: Cell<Option<usize>>,
    len: Cell<usize>,
    // Objects whose membership held a reference and that were unlinked on their own.
    detached: RefCell<Vec<usize>>,
}

impl<'a, S: Links<'a> + ?Sized> List<'a, S> {
    #[must_use]
    pub fn new(store: &'a S) -> Self {
        Self {
            store,
            head: Cell::new(None),
            tail: Cell::new(None),
            len: Cell::new(0),
            detached: RefCell::new(Vec::new()),
        }
    }

    /// Resets the header to empty.
    ///
    /// # Panics
    ///
    /// When the list still has members, their links would be left pointing at it, or still holds
    /// references on objects unlinked on their own.
    pub fn init(&self) {
        assert_eq!(self.len.get(), 0, "init of a list with members");
        assert!(
            self.detached.borrow().is_empty(),
            "init of a list holding references"
        );
        self.head.set(None);
        self.tail.set(None);
    }

    #[must_use]
    pub fn store(&self) -> &'a S {
        self.store
    }

    /// Links the object at `index` after the tail.
    ///
    /// # Panics
    ///
    /// When the object's link is already in a list.
    pub fn append(&'a self, index: usize) {
        self.splice(index, self.tail.get(), None, false);
    }

    /// Links the object at `index` before the head.
    ///
    /// # Panics
    ///
    /// When the object's link is already in a list.
    pub fn prepend(&'a self, index: usize) {
        self.splice(index, None, self.head.get(), false);
    }

    /// Links the object at `index` directly before `existing`.
    ///
    /// # Panics
    ///
    /// When the object's link is already in a list or `existing` is not a member of this list.
    pub fn insert_before(&'a self, index: usize, existing: usize) {
        let prev = self.member(existing).prev.get();
        self.splice(index, prev, Some(existing), false);
    }

    /// Links the object at `index` directly after `existing`.
    ///
    /// # Panics
    ///
    /// When the object's link is already in a list or `existing` is not a member of this list.
    pub fn insert_after(&'a self, index: usize, existing: usize) {
        let next = self.member(existing).next.get();
        self.splice(index, Some(existing), next, false);
    }

    /// Unlinks every member. References held through membership stay with the list until
    /// [`List::flush`].
    pub fn clear(&self) {
        while let Some(head) = self.head.get() {
            self.link(head).unlink();
        }
    }

    #[must_use]
    pub fn head(&self) -> Option<usize> {
        self.head.get()
    }

    #[must_use]
    pub fn tail(&self) -> Option<usize> {
        self.tail.get()
    }

    /// The member count, maintained as members are linked and unlinked.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len.get()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.head.get().is_none()
    }

    /// Counts the members by walking from head to tail.
    #[must_use]
    pub fn count(&self) -> usize {
        let mut count = 0;
        let mut current = self.head.get();
        while let Some(index) = current {
            count += 1;
            current = self.link(index).next.get();
        }
        count
    }

    #[must_use]
    pub fn contains(&self, index: usize) -> bool {
        self.link(index).list_is(self)
    }

    /// Calls `f` with each member index, front to back when `forward` and back to front
    /// otherwise, stopping at the first member for which `f` returns `true`.
    ///
    /// `f` may unlink the member it is given.
    pub fn apply(&self, forward: bool, mut f: impl FnMut(usize) -> bool) -> Option<usize> {
        let mut current = if forward {
            self.head.get()
        } else {
            self.tail.get()
        };
        while let Some(index) = current {
            let link = self.link(index);
            current = if forward {
                link.next.get()
            } else {
                link.prev.get()
            };
            if f(index) {
                return Some(index);
            }
        }
        None
    }

    /// Iterates over member indices. The list must not change while iterating.
    #[must_use]
    pub fn iter(&self) -> Iter<'_, 'a, S> {
        Iter {
            list: self,
            front: self.head.get(),
            back: self.tail.get(),
            remaining: self.len.get(),
        }
    }

    fn link(&self, index: usize) -> &Link<'a, S> {
        // SAFETY: Links are resolved for the length of one list operation, which releases nothing
        // while the reference is held.
        unsafe { self.store.link(index) }
    }

    fn member(&self, index: usize) -> &Link<'a, S> {
        let link = self.link(index);
        assert!(link.list_is(self), "link {index} is not in this list");
        link
    }

    fn splice(&'a self, index: usize, prev: Option<usize>, next: Option<usize>, owned: bool) {
        #[cfg(feature = "log")]
        log::trace!("List::splice index={index} prev={prev:?} next={next:?} owned={owned}");

        let link = self.link(index);
        assert!(!link.is_linked(), "link {index} is already in a list");

        link.prev.set(prev);
        link.next.set(next);
        link.list.set(Some(self));
        link.data.set(Some(index));
        link.owned.set(owned);

        match prev {
            Some(prev) => self.link(prev).next.set(Some(index)),
            None => self.head.set(Some(index)),
        }
        match next {
            Some(next) => self.link(next).prev.set(Some(index)),
            None => self.tail.set(Some(index)),
        }
        self.len.set(self.len.get() + 1);
    }
}

impl<'a, S: Release<'a> + ?Sized> List<'a, S> {
    /// Links the object of `handle` after the tail, membership keeps its reference.
    ///
    /// # Panics
    ///
    /// When the object's link is already in a list, the handle is dropped as usual.
    pub fn append_owned(&'a self, handle: S::Handle) {
        let index = self.give_up(handle);
        self.splice(index, self.tail.get(), None, true);
    }

    /// Links the object of `handle` before the head, membership keeps its reference.
    ///
    /// # Panics
    ///
    /// When the object's link is already in a list, the handle is dropped as usual.
    pub fn prepend_owned(&'a self, handle: S::Handle) {
        let index = self.give_up(handle);
        self.splice(index, None, self.head.get(), true);
    }

    /// Unlinks the object at `index` from this list and hands back the reference the list held
    /// on it, if any.
    ///
    /// Also hands back the reference kept for an owned member that was unlinked on its own.
    /// Returns `None` when the list holds no reference on the object.
    ///
    /// # Panics
    ///
    /// When `index` does not address an object of the store.
    #[must_use = "dropping the handle releases the reference"]
    pub fn remove(&self, index: usize) -> Option<S::Handle> {
        let owned = if self.contains(index) {
            matches!(self.link(index).detach(), Some((_, true)))
        } else {
            let mut detached = self.detached.borrow_mut();
            match detached.iter().position(|&held| held == index) {
                Some(position) => {
                    detached.swap_remove(position);
                    true
                }
                None => false,
            }
        };

        #[cfg(feature = "log")]
        log::trace!("List::remove index={index} owned={owned}");

        // SAFETY: The list owned the reference given up by `append_owned` or `prepend_owned`.
        owned.then(|| unsafe { self.store.from_raw(index) })
    }

    /// Unlinks every member, head first, releasing the references membership holds, then releases
    /// the references kept for owned members unlinked on their own.
    ///
    /// Each link is fully detached before its reference is released, so a release callback sees
    /// it unlinked.
    pub fn flush(&self) {
        #[cfg(feature = "log")]
        log::trace!("List::flush len={}", self.len.get());

        loop {
            let index = match self.head.get() {
                Some(head) => {
                    if !matches!(self.member(head).detach(), Some((_, true))) {
                        continue;
                    }
                    head
                }
                None => {
                    let held = self.detached.borrow_mut().pop();
                    match held {
                        Some(index) => index,
                        None => break,
                    }
                }
            };
            // SAFETY: The list owned the reference given up by `append_owned` or
            // `prepend_owned`.
            unsafe { self.store.release(index) };
        }
    }

    /// Checks the object of `handle` is free to link, then gives up the handle.
    fn give_up(&self, handle: S::Handle) -> usize {
        let index = self.store.index(&handle);
        assert!(
            !self.link(index).is_linked(),
            "link {index} is already in a list"
        );
        self.store.into_raw(handle)
    }
}

impl<'a, S: ?Sized> fmt::Debug for List<'a, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("List")
            .field("head", &self.head.get())
            .field("tail", &self.tail.get())
            .field("len", &self.len.get())
            .finish_non_exhaustive()
    }
}

/// Iterator over the member indices of a [`List`].
pub struct Iter<'l, 'a, S: ?Sized> {
    list: &'l List<'a, S>,
    front: Option<usize>,
    back: Option<usize>,
    remaining: usize,
}

impl<'l, 'a, S: Links<'a> + ?Sized> Iterator for Iter<'l, 'a, S> {
    type Item = usize;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let index = self.front?;
        self.front = self.list.link(index).next.get();
        self.remaining -= 1;
        Some(index)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<'l, 'a, S: Links<'a> + ?Sized> DoubleEndedIterator for Iter<'l, 'a, S> {
    fn next_back(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let index = self.back?;
        self.back = self.list.link(index).prev.get();
        self.remaining -= 1;
        Some(index)
    }
}

impl<'l, 'a, S: Links<'a> + ?Sized> ExactSizeIterator for Iter<'l, 'a, S> {}
impl<'l, 'a, S: Links<'a> + ?Sized> FusedIterator for Iter<'l, 'a, S> {}
