//! Subscription slot primitive.
//!
//! A [`Slot`] is an opaque handle binding one callback to exactly one
//! anchor list. Dropping the slot detaches the callback in O(1) and,
//! for slots created through [`SlotList::subscribe_pending`], cancels
//! whatever in-flight request the slot was tracking.
//!
//! The intrusive doubly-linked list the upstream C code uses is
//! represented here as a typed arena ([`SlotList`]) plus an index
//! carried by the [`Slot`] handle, per the translation rule in the
//! design notes: a slot carries `(anchor, index-in-anchor)`, not a raw
//! pointer into someone else's list.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

struct Inner<E> {
    entries: Vec<Option<Entry<E>>>,
    free: Vec<usize>,
}

struct Entry<E> {
    callback: Box<dyn FnMut(&E)>,
}

impl<E> Inner<E> {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
            free: Vec::new(),
        }
    }

    fn insert(&mut self, callback: Box<dyn FnMut(&E)>) -> usize {
        let entry = Entry { callback };
        if let Some(index) = self.free.pop() {
            self.entries[index] = Some(entry);
            index
        } else {
            self.entries.push(Some(entry));
            self.entries.len() - 1
        }
    }

    fn remove(&mut self, index: usize) {
        if index < self.entries.len() {
            self.entries[index] = None;
            self.free.push(index);
        }
    }
}

/// An anchor for subscriber callbacks of type `E`.
///
/// Cloning a [`SlotList`] clones the handle, not the list: all clones
/// observe the same underlying arena. This mirrors the cache holding
/// the canonical list while subscribers only ever see a [`Slot`].
pub struct SlotList<E> {
    inner: Rc<RefCell<Inner<E>>>,
}

impl<E> Clone for SlotList<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<E> Default for SlotList<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> SlotList<E> {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner::new())),
        }
    }

    /// Attach `callback` to this anchor and return the [`Slot`] that
    /// keeps it attached. Dropping the returned slot detaches it.
    pub fn subscribe<F>(&self, callback: F) -> Slot<E>
    where
        F: FnMut(&E) + 'static,
    {
        let index = self.inner.borrow_mut().insert(Box::new(callback));
        Slot {
            list: Rc::downgrade(&self.inner),
            index,
            pending: None,
        }
    }

    /// Invoke every live callback with `event`. Callbacks that
    /// subscribe or drop slots during the call are allowed; the
    /// snapshot of indices taken up front is not mutated by that, so
    /// a callback added mid-notification is not itself invoked this
    /// round (matching "delivering a callback does not transfer
    /// ownership" — the new subscriber only observes later events).
    pub fn notify(&self, event: &E) {
        let indices: Vec<usize> = {
            let inner = self.inner.borrow();
            inner
                .entries
                .iter()
                .enumerate()
                .filter_map(|(i, e)| e.as_ref().map(|_| i))
                .collect()
        };

        for index in indices {
            // The callback may itself subscribe/unsubscribe, which
            // would panic on a nested borrow_mut if we held the
            // RefCell borrow across the call. We briefly take the
            // callback out, invoke it without holding the borrow, and
            // put it back unless it was removed (slot dropped) in the
            // meantime.
            let mut callback = {
                let mut inner = self.inner.borrow_mut();
                match inner.entries.get_mut(index).and_then(|e| e.take()) {
                    Some(entry) => entry.callback,
                    None => continue,
                }
            };

            callback(event);

            let mut inner = self.inner.borrow_mut();
            if let Some(slot) = inner.entries.get_mut(index) {
                *slot = Some(Entry { callback });
            }
        }
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.borrow();
        inner.entries.len() - inner.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A pending-request anchor. Unlike [`SlotList`], a request is
/// correlated by an external key (e.g. a netlink sequence number)
/// rather than delivered to every subscriber, and firing it consumes
/// the slot (replies are one-shot).
pub struct PendingRequests<K, E> {
    list: SlotList<E>,
    keys: RefCell<std::collections::HashMap<K, usize>>,
}

impl<K, E> Default for PendingRequests<K, E>
where
    K: std::hash::Hash + Eq,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, E> PendingRequests<K, E>
where
    K: std::hash::Hash + Eq + Clone,
{
    pub fn new() -> Self {
        Self {
            list: SlotList::new(),
            keys: RefCell::new(std::collections::HashMap::new()),
        }
    }

    /// Register a pending request under `key`, returning the slot
    /// that owns it. Dropping the slot (without the reply ever
    /// arriving) silently cancels the request: [`Self::fire`] will no
    /// longer find anything for `key`.
    pub fn register<F>(&self, key: K, callback: F) -> Slot<E>
    where
        F: FnMut(&E) + 'static,
    {
        let index = self.list.inner.borrow_mut().insert(Box::new(callback));
        self.keys.borrow_mut().insert(key, index);
        Slot {
            list: Rc::downgrade(&self.list.inner),
            index,
            pending: Some(()),
        }
    }

    /// Correlate an incoming reply with `key` and fire its callback
    /// exactly once. Returns `false` if no slot is registered for
    /// `key` (it may have been dropped, or never existed).
    pub fn fire(&self, key: &K, event: &E) -> bool {
        let index = match self.keys.borrow_mut().remove(key) {
            Some(index) => index,
            None => return false,
        };

        let callback = self.list.inner.borrow_mut().entries.get_mut(index).and_then(|e| e.take());
        if let Some(mut entry) = callback {
            (entry.callback)(event);
        }
        self.list.inner.borrow_mut().remove(index);
        true
    }
}

/// Opaque subscription handle. Exactly one anchor owns this slot.
/// Dropping it detaches the callback (or cancels the pending request)
/// in O(1).
pub struct Slot<E> {
    list: Weak<RefCell<Inner<E>>>,
    index: usize,
    /// Present for slots created through a pending-request anchor;
    /// distinguishes "detach a subscriber" from "cancel a request" at
    /// the type level only for documentation purposes — the removal
    /// itself is identical.
    pending: Option<()>,
}

impl<E> std::fmt::Debug for Slot<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slot")
            .field("index", &self.index)
            .field("pending", &self.pending.is_some())
            .finish()
    }
}

impl<E> Drop for Slot<E> {
    fn drop(&mut self) {
        if let Some(inner) = self.list.upgrade() {
            inner.borrow_mut().remove(self.index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn subscribe_and_notify_invokes_callback() {
        let list: SlotList<u32> = SlotList::new();
        let seen = Rc::new(Cell::new(0));

        let seen2 = seen.clone();
        let _slot = list.subscribe(move |e| seen2.set(*e));

        list.notify(&42);
        assert_eq!(seen.get(), 42);
    }

    #[test]
    fn dropping_slot_detaches_in_o1() {
        let list: SlotList<u32> = SlotList::new();
        let seen = Rc::new(Cell::new(0));

        let seen2 = seen.clone();
        let slot = list.subscribe(move |e| seen2.set(*e));
        assert_eq!(list.len(), 1);

        drop(slot);
        assert_eq!(list.len(), 0);

        list.notify(&1);
        assert_eq!(seen.get(), 0);
    }

    #[test]
    fn multiple_slots_are_independent() {
        let list: SlotList<u32> = SlotList::new();
        let a = Rc::new(Cell::new(0));
        let b = Rc::new(Cell::new(0));

        let a2 = a.clone();
        let slot_a = list.subscribe(move |e| a2.set(*e));
        let b2 = b.clone();
        let _slot_b = list.subscribe(move |e| b2.set(*e));

        drop(slot_a);
        list.notify(&7);

        assert_eq!(a.get(), 0);
        assert_eq!(b.get(), 7);
    }

    #[test]
    fn pending_request_fires_once_and_then_is_gone() {
        let pending: PendingRequests<u32, &'static str> = PendingRequests::new();
        let seen = Rc::new(RefCell::new(Vec::new()));

        let seen2 = seen.clone();
        let _slot = pending.register(7, move |e: &&'static str| seen2.borrow_mut().push(*e));

        assert!(pending.fire(&7, &"ok"));
        assert_eq!(*seen.borrow(), vec!["ok"]);

        // Second reply for the same (by now consumed) key is a no-op.
        assert!(!pending.fire(&7, &"ok-again"));
        assert_eq!(*seen.borrow(), vec!["ok"]);
    }

    #[test]
    fn dropping_slot_cancels_pending_request() {
        let pending: PendingRequests<u32, &'static str> = PendingRequests::new();
        let fired = Rc::new(Cell::new(false));

        let fired2 = fired.clone();
        let slot = pending.register(3, move |_| fired2.set(true));
        drop(slot);

        assert!(!pending.fire(&3, &"late"));
        assert!(!fired.get());
    }

    #[test]
    fn callback_may_subscribe_during_notify_without_panicking() {
        let list: Rc<SlotList<u32>> = Rc::new(SlotList::new());
        let list2 = list.clone();
        let extra: Rc<RefCell<Option<Slot<u32>>>> = Rc::new(RefCell::new(None));
        let extra2 = extra.clone();

        let _slot = list.subscribe(move |_| {
            let s = list2.subscribe(|_| {});
            *extra2.borrow_mut() = Some(s);
        });

        list.notify(&1);
        assert_eq!(list.len(), 2);
    }
}
