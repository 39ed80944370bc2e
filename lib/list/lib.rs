// Copyright 2025 The Kestrel Authors
//
// Licensed under the Apache License, Version 2.0 (the "License"); you may not
// use this file except in compliance with the License. You may obtain a copy of
// the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS, WITHOUT
// WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied. See the
// License for the specific language governing permissions and limitations under
// the License.

//! # list
//!
//! Intrusive doubly linked lists.  A [`Link`] is embedded in the element
//! type; an [`Adapter`] records the link's byte offset so that one element
//! can participate in several lists through distinct links.  The kernel uses
//! these for its ready queue, the per-primitive waiting lists, and the
//! clock-ordered sleep lists, so insertion supports an arbitrary ordering
//! predicate in addition to plain push operations.
//!
//! All mutating operations are `unsafe`: the caller must guarantee exclusive
//! access (in the kernel, by holding the scheduler lock) and the validity of
//! every element pointer.

#![cfg_attr(not(test), no_std)]

use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::ptr::NonNull;

// Intrusive links are hard to express soundly in Rust because mutable
// references are assumed to be globally unique.  The strategy here follows
// Tokio's linked list (see the writeup at
// https://gist.github.com/Darksonn/1567538f56af1a8038ecc3c664a42462):
//
// * `LinkPointers` carries `PhantomPinned`, which disables the `noalias`
//   annotation on mutable references to the containing structure.
// * The `next`/`prev` fields are only touched through raw pointer arithmetic
//   on the `#[repr(C)]` struct, never through field references.  They are
//   private to the `pointers` module to keep it that way.
mod pointers {
    use core::marker::PhantomPinned;
    use core::mem::offset_of;
    use core::ptr::NonNull;

    use super::Link;

    #[repr(C)]
    pub struct LinkPointers {
        #[allow(dead_code)]
        next: Option<NonNull<Link>>,
        #[allow(dead_code)]
        prev: Option<NonNull<Link>>,
        _pin: PhantomPinned,
    }

    impl LinkPointers {
        pub const NEXT_OFFSET: usize = offset_of!(LinkPointers, next);
        pub const PREV_OFFSET: usize = offset_of!(LinkPointers, prev);

        // A value no valid `Link` can be at, marking a detached link.
        pub const UNLINKED: Option<NonNull<Link>> =
            Some(unsafe { NonNull::new_unchecked(usize::MAX as *mut Link) });

        pub const fn new() -> Self {
            Self {
                next: Self::UNLINKED,
                prev: Self::UNLINKED,
                _pin: PhantomPinned,
            }
        }
    }
}

use pointers::LinkPointers;

/// A list node embedded inside an element.
pub struct Link {
    inner: UnsafeCell<LinkPointers>,
}

#[inline]
unsafe fn read_slot(inner: &UnsafeCell<LinkPointers>, offset: usize) -> Option<NonNull<Link>> {
    let slot = (inner.get() as *const Option<NonNull<Link>>).byte_add(offset);
    core::ptr::read(slot)
}

#[inline]
unsafe fn write_slot(
    inner: &UnsafeCell<LinkPointers>,
    offset: usize,
    value: Option<NonNull<Link>>,
) {
    let slot = (inner.get() as *mut Option<NonNull<Link>>).byte_add(offset);
    core::ptr::write(slot, value);
}

impl Link {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            inner: UnsafeCell::new(LinkPointers::new()),
        }
    }

    #[must_use]
    pub fn is_unlinked(&self) -> bool {
        self.next() == LinkPointers::UNLINKED && self.prev() == LinkPointers::UNLINKED
    }

    #[must_use]
    pub fn is_linked(&self) -> bool {
        !self.is_unlinked()
    }

    fn mark_unlinked(&mut self) {
        self.set_next(LinkPointers::UNLINKED);
        self.set_prev(LinkPointers::UNLINKED);
    }

    #[inline]
    fn next(&self) -> Option<NonNull<Link>> {
        unsafe { read_slot(&self.inner, LinkPointers::NEXT_OFFSET) }
    }

    #[inline]
    fn set_next(&mut self, value: Option<NonNull<Link>>) {
        unsafe { write_slot(&self.inner, LinkPointers::NEXT_OFFSET, value) }
    }

    #[inline]
    fn prev(&self) -> Option<NonNull<Link>> {
        unsafe { read_slot(&self.inner, LinkPointers::PREV_OFFSET) }
    }

    #[inline]
    fn set_prev(&mut self, value: Option<NonNull<Link>>) {
        unsafe { write_slot(&self.inner, LinkPointers::PREV_OFFSET, value) }
    }
}

impl Default for Link {
    fn default() -> Self {
        Self::new()
    }
}

/// Maps an element type to the offset of one of its links.
pub trait Adapter {
    const LINK_OFFSET: usize;
}

/// Defines an adapter type and implements [`Adapter`] for it.
///
/// Two forms are accepted: a plain element type, and an element type generic
/// over a single parameter:
///
/// ```ignore
/// list::define_adapter!(pub ReadyAdapter => Node.link);
/// list::define_adapter!(pub WaitAdapter<K: Kernel> => Thread<K>::wait_link);
/// ```
#[macro_export]
macro_rules! define_adapter {
    ($vis:vis $name:ident => $node:ident . $link:ident) => {
        $vis enum $name {}

        impl $crate::Adapter for $name {
            const LINK_OFFSET: usize = core::mem::offset_of!($node, $link);
        }
    };
    ($vis:vis $name:ident<$param:ident: $bound:path> => $node:ident<$arg:ident>::$link:ident) => {
        $vis struct $name<$param: $bound>(core::marker::PhantomData<$param>);

        impl<$param: $bound> $crate::Adapter for $name<$param> {
            const LINK_OFFSET: usize = core::mem::offset_of!($node<$arg>, $link);
        }
    };
}

/// A doubly linked list of borrowed elements.
///
/// The list stores raw pointers; elements are owned elsewhere (in the kernel,
/// by the code that declared the thread or primitive).  `head`/`tail` are
/// `None` for the empty list, so no sentinel node is needed and the list
/// itself can be moved while empty.
pub struct UnsafeList<T, A: Adapter> {
    head: Option<NonNull<Link>>,
    tail: Option<NonNull<Link>>,
    len: usize,
    _element: PhantomData<T>,
    _adapter: PhantomData<A>,
}

impl<T, A: Adapter> UnsafeList<T, A> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
            _element: PhantomData,
            _adapter: PhantomData,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Number of elements currently linked.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    unsafe fn link_of(element: NonNull<T>) -> NonNull<Link> {
        element.cast::<Link>().byte_add(A::LINK_OFFSET)
    }

    unsafe fn element_of(link: NonNull<Link>) -> *mut T {
        link.byte_sub(A::LINK_OFFSET).cast::<T>().as_ptr()
    }

    /// Returns true if `element` is linked into **any** list using this
    /// adapter.
    ///
    /// # Safety
    /// `element` must be a valid pointer to an instance of `T`.
    pub unsafe fn is_element_linked(element: NonNull<T>) -> bool {
        (*Self::link_of(element).as_ptr()).is_linked()
    }

    /// # Safety
    /// The caller must have exclusive access to the list and its members,
    /// and `element` must be valid and not currently in a list.
    pub unsafe fn push_front_unchecked(&mut self, element: *mut T) {
        let link = Self::link_of(NonNull::new_unchecked(element));

        (*link.as_ptr()).set_next(self.head);
        (*link.as_ptr()).set_prev(None);

        match self.head {
            None => self.tail = Some(link),
            Some(head) => (*head.as_ptr()).set_prev(Some(link)),
        }

        self.head = Some(link);
        self.len += 1;
    }

    /// # Safety
    /// The caller must have exclusive access to the list and its members,
    /// and `element` must be valid and not currently in a list.
    pub unsafe fn push_back_unchecked(&mut self, element: *mut T) {
        let link = Self::link_of(NonNull::new_unchecked(element));

        (*link.as_ptr()).set_next(None);
        (*link.as_ptr()).set_prev(self.tail);

        match self.tail {
            None => self.head = Some(link),
            Some(tail) => (*tail.as_ptr()).set_next(Some(link)),
        }

        self.tail = Some(link);
        self.len += 1;
    }

    /// Links `added` immediately before `at`, which must be in this list.
    unsafe fn insert_before(&mut self, added: NonNull<Link>, at: NonNull<Link>) {
        let prev = (*at.as_ptr()).prev();

        (*added.as_ptr()).set_next(Some(at));
        (*added.as_ptr()).set_prev(prev);
        (*at.as_ptr()).set_prev(Some(added));

        match prev {
            None => self.head = Some(added),
            Some(prev) => (*prev.as_ptr()).set_next(Some(added)),
        }

        self.len += 1;
    }

    /// Inserts `element` before the first member `m` for which
    /// `goes_before(element, m)` is true, or at the tail if there is none.
    ///
    /// With a strict ordering predicate, elements comparing equal keep
    /// insertion order (FIFO within equal keys).
    ///
    /// # Safety
    /// The caller must have exclusive access to the list and its members,
    /// and `element` must be valid and not currently in a list.
    pub unsafe fn insert_sorted_by_unchecked<F>(&mut self, element: *mut T, mut goes_before: F)
    where
        F: FnMut(&T, &T) -> bool,
    {
        let element = NonNull::new_unchecked(element);
        let link = Self::link_of(element);

        let mut cur = self.head;
        while let Some(cur_link) = cur {
            let cur_element = Self::element_of(cur_link);
            if goes_before(&*element.as_ptr(), &*cur_element) {
                self.insert_before(link, cur_link);
                return;
            }
            cur = (*cur_link.as_ptr()).next();
        }

        self.push_back_unchecked(element.as_ptr());
    }

    /// # Safety
    /// The caller must have exclusive access to the list and its members,
    /// and `element` must be valid and a member of this list.
    pub unsafe fn unlink_element_unchecked(&mut self, element: *mut T) {
        let link = Self::link_of(NonNull::new_unchecked(element));

        let prev = (*link.as_ptr()).prev();
        let next = (*link.as_ptr()).next();

        match prev {
            None => self.head = next,
            Some(prev) => (*prev.as_ptr()).set_next(next),
        }

        match next {
            None => self.tail = prev,
            Some(next) => (*next.as_ptr()).set_prev(prev),
        }

        (*link.as_ptr()).mark_unlinked();
        self.len -= 1;
    }

    /// Unlinks `element` if it is linked, returning it.
    ///
    /// # Safety
    /// The caller must have exclusive access to the list and its members,
    /// and `element` must be valid.  If linked, it must be linked into
    /// *this* list.
    pub unsafe fn unlink_element(&mut self, element: NonNull<T>) -> Option<NonNull<T>> {
        if (*Self::link_of(element).as_ptr()).is_linked() {
            self.unlink_element_unchecked(element.as_ptr());
            Some(element)
        } else {
            None
        }
    }

    /// # Safety
    /// The caller must have exclusive access to the list and its members.
    pub unsafe fn peek_head(&self) -> Option<NonNull<T>> {
        self.head
            .map(|link| NonNull::new_unchecked(Self::element_of(link)))
    }

    /// Unlinks and returns the first element.
    ///
    /// # Safety
    /// The caller must have exclusive access to the list and its members.
    pub unsafe fn pop_head(&mut self) -> Option<NonNull<T>> {
        let head = self.head?;
        let element = Self::element_of(head);
        self.unlink_element_unchecked(element);
        Some(NonNull::new_unchecked(element))
    }

    /// # Safety
    /// The caller must have exclusive access to the list and its members.
    pub unsafe fn for_each<E, F: FnMut(&T) -> Result<(), E>>(
        &self,
        mut callback: F,
    ) -> Result<(), E> {
        let mut cur = self.head;
        while let Some(link) = cur {
            callback(&*Self::element_of(link))?;
            cur = (*link.as_ptr()).next();
        }
        Ok(())
    }

    /// Visits every element; members for which `callback` returns false are
    /// unlinked without being otherwise modified.  The callback may link a
    /// removed element into another list.
    ///
    /// # Safety
    /// The caller must have exclusive access to the list and its members.
    pub unsafe fn filter<F: FnMut(&mut T) -> bool>(&mut self, mut callback: F) {
        let mut cur = self.head;
        while let Some(link) = cur {
            let element = Self::element_of(link);
            // Fetch the successor first: the callback may relink `element`.
            let next = (*link.as_ptr()).next();

            if !callback(&mut *element) {
                self.unlink_element_unchecked(element);
            }

            cur = next;
        }
    }
}

impl<T, A: Adapter> Default for UnsafeList<T, A> {
    fn default() -> Self {
        Self::new()
    }
}
