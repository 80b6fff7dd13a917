use std::{marker::PhantomData, ptr::NonNull};

/// Non-null pointer to a [`Node`].
pub(crate) type Link<T> = Option<NonNull<Node<T>>>;

/// Node of an intrusive list. The node lives inside the memory it describes.
#[repr(C)]
pub(crate) struct Node<T> {
    /// Pointer to the next node of the list
    pub next: Link<T>,
    /// Element of the node
    pub data: T,
}

/// Singly linked list whose nodes are written into memory owned by the allocator.
///
/// It is very important for us that, because we are the actual memory allocator,
/// this list can not make allocations itself. Every insertion receives the `addr`
/// where the node has to be written, so nodes end up exactly where we want them:
/// inside the free memory they keep track of.
pub(crate) struct List<T> {
    head: Link<T>,
    len: usize,
    marker: PhantomData<T>,
}

pub(crate) struct Iter<'a, T> {
    current: Link<T>,
    remaining: usize,
    marker: PhantomData<&'a T>,
}

impl<T> List<T> {
    pub const fn new() -> Self {
        Self {
            head: None,
            len: 0,
            marker: PhantomData,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn first(&self) -> Link<T> {
        self.head
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Writes a node holding `data` at `addr` and links it right after `prev`, or at
    /// the head of the list when `prev` is `None`.
    ///
    /// **SAFETY**: Caller (we, as the allocator) must guarantee that `addr` is valid for
    /// writes of a `Node<T>`, properly aligned, and that `prev` is a node of this list.
    pub unsafe fn insert_after(&mut self, prev: Link<T>, data: T, addr: NonNull<u8>) -> NonNull<Node<T>> {
        let node = addr.cast::<Node<T>>();

        unsafe {
            let next = match prev {
                Some(prev) => prev.as_ref().next,
                None => self.head,
            };

            node.write(Node { next, data });

            match prev {
                Some(mut prev) => prev.as_mut().next = Some(node),
                None => self.head = Some(node),
            }
        }

        self.len += 1;

        node
    }

    /// See [`List::insert_after`].
    #[inline]
    pub unsafe fn push_front(&mut self, data: T, addr: NonNull<u8>) -> NonNull<Node<T>> {
        unsafe { self.insert_after(None, data, addr) }
    }

    /// Unlinks and returns the node following `prev` (the head when `prev` is `None`).
    ///
    /// **SAFETY**: `prev` must be a node of this list.
    pub unsafe fn remove_after(&mut self, prev: Link<T>) -> Link<T> {
        let target = match prev {
            Some(prev) => unsafe { prev.as_ref().next },
            None => self.head,
        }?;

        unsafe {
            let next = target.as_ref().next;

            match prev {
                Some(mut prev) => prev.as_mut().next = next,
                None => self.head = next,
            }
        }

        self.len -= 1;

        Some(target)
    }

    #[inline]
    pub fn pop_front(&mut self) -> Link<T> {
        // The head is always a node of this list.
        unsafe { self.remove_after(None) }
    }

    /// Forgets every node. The memory they live in is not touched.
    pub fn clear(&mut self) {
        self.head = None;
        self.len = 0;
    }

    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            current: self.head,
            remaining: self.len,
            marker: PhantomData,
        }
    }
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = NonNull<Node<T>>;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.current?;

        unsafe {
            self.current = node.as_ref().next;
            self.remaining -= 1;
        }

        Some(node)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<'a, T> IntoIterator for &'a List<T> {
    type Item = NonNull<Node<T>>;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
