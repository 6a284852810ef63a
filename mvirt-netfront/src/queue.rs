//! Lock-free submission queue with an embedded owner lock
//!
//! Submitters push onto an intrusive singly linked list with a CAS loop. Bit
//! 0 of the head pointer is the ring owner's lock: whoever sets it runs the
//! ring, everyone else just pushes and leaves. The owner moves submissions
//! into its own FIFO with `swizzle` and can only drop the lock once the list
//! is empty, so a packet pushed while the owner is releasing is never
//! stranded.

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

const LOCKED: usize = 1;

struct Node<T> {
    value: T,
    next: *mut Node<T>,
}

fn is_locked<T>(head: *mut Node<T>) -> bool {
    head.addr() & LOCKED != 0
}

fn strip<T>(head: *mut Node<T>) -> *mut Node<T> {
    head.map_addr(|addr| addr & !LOCKED)
}

fn tagged<T>(head: *mut Node<T>) -> *mut Node<T> {
    head.map_addr(|addr| addr | LOCKED)
}

/// Multi-producer queue whose head word doubles as the owner lock.
pub struct PacketQueue<T> {
    head: AtomicPtr<Node<T>>,
}

// SAFETY: nodes are only reachable through `head`; values move between
// threads by ownership transfer and are never shared.
unsafe impl<T: Send> Send for PacketQueue<T> {}
// SAFETY: see above; all access to `head` is atomic.
unsafe impl<T: Send> Sync for PacketQueue<T> {}

impl<T> Default for PacketQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PacketQueue<T> {
    pub fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Push a submission. Never blocks.
    pub fn push(&self, value: T) {
        let node = Box::into_raw(Box::new(Node {
            value,
            next: ptr::null_mut(),
        }));
        debug_assert!(!is_locked(node));

        let mut old = self.head.load(Ordering::Relaxed);
        loop {
            // Keep the owner's lock bit, link behind the untagged head
            // SAFETY: node is not yet published, so we have exclusive access
            unsafe { (*node).next = strip(old) };
            let new = if is_locked(old) { tagged(node) } else { node };
            match self
                .head
                .compare_exchange_weak(old, new, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(current) => old = current,
            }
        }
    }

    /// Try to become the owner. One CAS.
    ///
    /// Fails if another thread owns the queue; that owner will see anything
    /// pushed before its release.
    pub fn try_acquire(&self) -> bool {
        let head = self.head.load(Ordering::Relaxed);
        if is_locked(head) {
            return false;
        }
        self.head
            .compare_exchange(head, tagged(head), Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub fn is_locked(&self) -> bool {
        is_locked(self.head.load(Ordering::Relaxed))
    }

    /// Take all submissions in push order. Caller must hold the lock.
    pub fn swizzle(&self) -> Vec<T> {
        let head = self.head.swap(tagged(ptr::null_mut()), Ordering::Acquire);
        debug_assert!(is_locked(head), "swizzle without owning the queue");

        let mut values = Vec::new();
        let mut node = strip(head);
        while !node.is_null() {
            // SAFETY: the swap detached the list; every node was created by
            // Box::into_raw in push and is visited exactly once
            let boxed = unsafe { Box::from_raw(node) };
            node = boxed.next;
            values.push(boxed.value);
        }
        // The list is LIFO
        values.reverse();
        values
    }

    /// Drop the lock if no submissions arrived since the last swizzle.
    ///
    /// Returns false (lock still held) if the caller must swizzle again.
    pub fn try_release(&self) -> bool {
        self.head
            .compare_exchange(
                tagged(ptr::null_mut()),
                ptr::null_mut(),
                Ordering::Release,
                Ordering::Relaxed,
            )
            .is_ok()
    }
}

impl<T> Drop for PacketQueue<T> {
    fn drop(&mut self) {
        let mut node = strip(*self.head.get_mut());
        while !node.is_null() {
            // SAFETY: exclusive access in drop; see swizzle
            let boxed = unsafe { Box::from_raw(node) };
            node = boxed.next;
        }
    }
}
