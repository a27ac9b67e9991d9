//! A weak, many-to-one association between objects of type `O` and a group
//! of type `G`, where either side may be destroyed first.
//!
//! The group keeps an intrusive doubly-linked list of its members, and each
//! member keeps a back-pointer to its group. An object belongs to at most one
//! group at a time. Destroying the group clears every member's back-pointer,
//! and destroying a member unlinks it from the group, so neither side ever
//! sees a dangling pointer.
//!
//! Both sides must be pinned, since the list stores their addresses. In
//! practice they live inside `Rc`s.

use std::cell::Cell;
use std::fmt;
use std::marker::PhantomPinned;
use std::pin::Pin;
use std::ptr::NonNull;

/// Implemented by types which embed a [`LinkedGroup`].
///
/// # Safety
///
/// `linked_group` must return a reference to a field of `self`, so that it
/// is pinned whenever `self` is.
pub unsafe trait HasLinkedGroup<O>: Sized {
    fn linked_group(&self) -> &LinkedGroup<Self, O>;
}

/// Implemented by types which embed a [`LinkedObject`].
///
/// # Safety
///
/// `linked_object` must return a reference to a field of `self`, so that it
/// is pinned whenever `self` is.
pub unsafe trait HasLinkedObject<G>: Sized {
    fn linked_object(&self) -> &LinkedObject<G, Self>;
}

type Link<G, O> = Cell<Option<NonNull<LinkedObject<G, O>>>>;

pub struct LinkedGroup<G, O> {
    head: Link<G, O>,
    len: Cell<usize>,

    // the member for_each visits next. unlink advances it past the member
    // being removed
    cursor: Link<G, O>,
    iterating: Cell<bool>,
    _pin: PhantomPinned,
}

impl<G, O> LinkedGroup<G, O> {
    pub const fn new() -> Self {
        Self {
            head: Cell::new(None),
            len: Cell::new(0),
            cursor: Cell::new(None),
            iterating: Cell::new(false),
            _pin: PhantomPinned,
        }
    }

    pub fn len(&self) -> usize {
        self.len.get()
    }

    pub fn is_empty(&self) -> bool {
        self.head.get().is_none()
    }

    /// Call `f` with each member. `f` may unlink or destroy any member,
    /// including the one it is given. Members linked while iterating are
    /// not visited.
    ///
    /// # Panics
    ///
    /// Panics if `f` calls `for_each` on the same group.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(Pin<&O>),
    {
        struct Iterating<'a>(&'a Cell<bool>);

        impl Drop for Iterating<'_> {
            fn drop(&mut self) {
                self.0.set(false);
            }
        }

        assert!(
            !self.iterating.replace(true),
            "LinkedGroup::for_each() called while already iterating"
        );
        let _iterating = Iterating(&self.iterating);

        let mut cur = self.head.get();

        while let Some(node) = cur {
            // SAFETY: members unlink themselves before they are destroyed,
            // and unlink moves the cursor off of them
            let node = unsafe { node.as_ref() };

            self.cursor.set(node.next.get());

            if let Some(owner) = node.owner.get() {
                // SAFETY: owners are pinned, and outlive their link
                f(unsafe { Pin::new_unchecked(owner.as_ref()) });
            }

            cur = self.cursor.get();
        }

        self.cursor.set(None);
    }

    fn push_front(&self, obj: &LinkedObject<G, O>) {
        let ptr = NonNull::from(obj);

        obj.prev.set(None);
        obj.next.set(self.head.get());

        if let Some(head) = self.head.get() {
            // SAFETY: members unlink themselves before they are destroyed
            unsafe { head.as_ref() }.prev.set(Some(ptr));
        }

        self.head.set(Some(ptr));
        self.len.set(self.len.get() + 1);
    }

    fn unlink(&self, obj: &LinkedObject<G, O>) {
        let prev = obj.prev.take();
        let next = obj.next.take();

        if self.cursor.get() == Some(NonNull::from(obj)) {
            self.cursor.set(next);
        }

        // SAFETY: neighbors are live members of this group
        match prev {
            Some(prev) => unsafe { prev.as_ref() }.next.set(next),
            None => self.head.set(next),
        }

        if let Some(next) = next {
            unsafe { next.as_ref() }.prev.set(prev);
        }

        self.len.set(self.len.get() - 1);
    }
}

impl<G, O> Default for LinkedGroup<G, O> {
    fn default() -> Self {
        Self::new()
    }
}

impl<G, O> Drop for LinkedGroup<G, O> {
    fn drop(&mut self) {
        let mut cur = self.head.take();

        while let Some(node) = cur {
            // SAFETY: members unlink themselves before they are destroyed
            let node = unsafe { node.as_ref() };

            cur = node.next.get();
            node.clear();
        }

        self.cursor.set(None);
        self.len.set(0);
    }
}

impl<G, O> fmt::Debug for LinkedGroup<G, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkedGroup")
            .field("len", &self.len.get())
            .finish()
    }
}

pub struct LinkedObject<G, O> {
    group: Cell<Option<NonNull<LinkedGroup<G, O>>>>,

    // the structs embedding each side
    group_owner: Cell<Option<NonNull<G>>>,
    owner: Cell<Option<NonNull<O>>>,

    prev: Link<G, O>,
    next: Link<G, O>,
    _pin: PhantomPinned,
}

impl<G, O> LinkedObject<G, O> {
    pub const fn new() -> Self {
        Self {
            group: Cell::new(None),
            group_owner: Cell::new(None),
            owner: Cell::new(None),
            prev: Cell::new(None),
            next: Cell::new(None),
            _pin: PhantomPinned,
        }
    }

    /// Make `object` a member of `group`, leaving any previous group.
    /// Linking to the current group again does nothing.
    pub fn link(object: Pin<&O>, group: Pin<&G>)
    where
        O: HasLinkedObject<G>,
        G: HasLinkedGroup<O>,
    {
        let object = object.get_ref();
        let group = group.get_ref();

        let obj = object.linked_object();
        let grp = group.linked_group();

        if obj.group.get() == Some(NonNull::from(grp)) {
            return;
        }

        obj.invalidate();

        obj.owner.set(Some(NonNull::from(object)));
        obj.group_owner.set(Some(NonNull::from(group)));
        obj.group.set(Some(NonNull::from(grp)));

        grp.push_front(obj);
    }

    /// The current group, if any. The reference must not be held across
    /// anything that could destroy the group.
    pub fn try_get(&self) -> Option<Pin<&G>> {
        // SAFETY: the group clears this pointer before it is destroyed, and
        // the group is pinned
        self.group_owner
            .get()
            .map(|g| unsafe { Pin::new_unchecked(g.as_ref()) })
    }

    pub fn is_linked(&self) -> bool {
        self.group.get().is_some()
    }

    /// Leave the current group, if any.
    pub fn invalidate(&self) {
        if let Some(group) = self.group.get() {
            // SAFETY: the group clears our pointer before it is destroyed
            unsafe { group.as_ref() }.unlink(self);
        }

        self.clear();
    }

    fn clear(&self) {
        self.group.set(None);
        self.group_owner.set(None);
        self.owner.set(None);
        self.prev.set(None);
        self.next.set(None);
    }
}

impl<G, O> Default for LinkedObject<G, O> {
    fn default() -> Self {
        Self::new()
    }
}

impl<G, O> Drop for LinkedObject<G, O> {
    fn drop(&mut self) {
        self.invalidate();
    }
}

impl<G, O> fmt::Debug for LinkedObject<G, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkedObject")
            .field("linked", &self.is_linked())
            .finish()
    }
}
