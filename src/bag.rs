//! Unordered collections of handles.
//!
//! A bag is a sparse array of slots. Adding an item puts it into the first
//! free slot, removing an item just vacates its slot, so both operations
//! are cheap. The storage doubles when it runs full and is halved again –
//! compacting the live items to the front – once less than a quarter of it
//! is in use. It never shrinks below its initial size or below a size
//! explicitly requested through `reserve`.
//!
//! Because compaction moves items to different slots, a [`Slot`] is only
//! meaningful while an iteration is in progress. Compaction is deferred
//! until the last open iteration has finished, so items can safely be
//! removed while iterating. Items added during an iteration may or may not
//! be visited.
//!
//! There are two flavours. [`Bag`] is meant for use by a single owner and
//! doesn’t do any locking. [`SharedBag`] wraps the same storage in a
//! reader/writer lock and can be shared between threads.

use std::cmp;
use parking_lot::RwLock;
use crate::error::AllocationError;


/// The number of slots allocated initially.
const INITIAL_CAPACITY: usize = 16;


//------------ Slot ----------------------------------------------------------

/// The position of an item in a bag.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Slot(usize);

impl Slot {
    pub fn index(self) -> usize {
        self.0
    }
}


//------------ Bag -----------------------------------------------------------

/// A single-threaded bag.
#[derive(Debug)]
pub struct Bag<T> {
    /// The slots. The vector’s length is the capacity of the bag.
    slots: Vec<Option<T>>,

    /// The number of occupied slots.
    len: usize,

    /// No slot before this index is free.
    free_hint: usize,

    /// The capacity below which the bag will not shrink.
    ///
    /// This is the initial capacity unless `reserve` asked for more.
    floor: usize,

    /// The number of currently open iterations.
    iterating: usize,
}

impl<T> Bag<T> {
    /// Creates a new, empty bag.
    pub fn new() -> Self {
        let mut slots = Vec::new();
        slots.resize_with(INITIAL_CAPACITY, || None);
        Self::from_slots(slots)
    }

    /// Creates a new, empty bag if the storage can be allocated.
    pub fn try_new() -> Result<Self, AllocationError> {
        let mut slots = Vec::new();
        slots.try_reserve_exact(INITIAL_CAPACITY)?;
        slots.resize_with(INITIAL_CAPACITY, || None);
        Ok(Self::from_slots(slots))
    }

    fn from_slots(slots: Vec<Option<T>>) -> Self {
        Bag {
            slots,
            len: 0,
            free_hint: 0,
            floor: INITIAL_CAPACITY,
            iterating: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Adds an item to the first free slot.
    ///
    /// If there is no free slot, the capacity is doubled first. If that
    /// fails, the bag is left unchanged and an error is returned.
    pub fn add(&mut self, item: T) -> Result<Slot, AllocationError> {
        if self.len == self.slots.len() {
            self.grow(self.len + 1)?;
            self.floor = INITIAL_CAPACITY;
        }
        let index = match self.slots[self.free_hint..].iter().position(
            Option::is_none
        ) {
            Some(pos) => self.free_hint + pos,
            None => {
                panic!("bag with {} of {} slots used has no free slot",
                    self.len, self.slots.len()
                )
            }
        };
        self.slots[index] = Some(item);
        self.len += 1;
        self.free_hint = index + 1;
        Ok(Slot(index))
    }

    /// Removes the item in the given slot.
    ///
    /// # Panics
    ///
    /// Removing from a slot that is out of range or vacant is a logic error
    /// and panics.
    pub fn remove(&mut self, slot: Slot) -> T {
        let item = match self.slots.get_mut(slot.0).and_then(Option::take) {
            Some(item) => item,
            None => {
                panic!(
                    "attempt to remove vacant or out-of-range bag slot {} \
                     (capacity {})",
                    slot.0, self.slots.len()
                )
            }
        };
        self.len -= 1;
        self.free_hint = cmp::min(self.free_hint, slot.0);
        self.shrink_if_sparse();
        item
    }

    /// Makes sure the bag has room for at least `count` items.
    ///
    /// The bag will not automatically shrink below the resulting capacity
    /// until it has to grow beyond it again.
    pub fn reserve(&mut self, count: usize) -> Result<(), AllocationError> {
        if count <= self.slots.len() {
            return Ok(())
        }
        self.grow(count)?;
        self.floor = self.slots.len();
        Ok(())
    }

    /// Returns a reference to the item in the given slot.
    pub fn get(&self, slot: Slot) -> Option<&T> {
        self.slots.get(slot.0).and_then(Option::as_ref)
    }

    /// Returns a mutable reference to the item in the given slot.
    pub fn get_mut(&mut self, slot: Slot) -> Option<&mut T> {
        self.slots.get_mut(slot.0).and_then(Option::as_mut)
    }

    /// Returns an iterator over all items and their slots.
    pub fn iter(&self) -> impl Iterator<Item = (Slot, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, item)| {
            item.as_ref().map(|item| (Slot(index), item))
        })
    }

    /// Opens an iteration.
    ///
    /// Until the matching call to `stop_iteration`, items will stay in
    /// their slots even if they are removed.
    pub fn start_iteration(&mut self) {
        self.iterating += 1;
    }

    /// Closes an iteration.
    ///
    /// # Panics
    ///
    /// Panics if there is no open iteration.
    pub fn stop_iteration(&mut self) {
        assert!(self.iterating > 0, "stop_iteration without open iteration");
        self.iterating -= 1;
        self.shrink_if_sparse();
    }

    /// Returns the first occupied slot.
    pub fn first(&self) -> Option<Slot> {
        self.occupied_from(0)
    }

    /// Returns the first occupied slot after `slot`.
    pub fn next_slot(&self, slot: Slot) -> Option<Slot> {
        self.occupied_from(slot.0 + 1)
    }

    fn occupied_from(&self, start: usize) -> Option<Slot> {
        self.slots.get(start..)?.iter().position(Option::is_some).map(|pos| {
            Slot(start + pos)
        })
    }

    /// Doubles the capacity until it is at least `count`.
    fn grow(&mut self, count: usize) -> Result<(), AllocationError> {
        let mut capacity = self.slots.len();
        while capacity < count {
            capacity *= 2;
        }
        self.slots.try_reserve_exact(capacity - self.slots.len())?;
        self.slots.resize_with(capacity, || None);
        Ok(())
    }

    /// Halves the capacity if less than a quarter of it is in use.
    fn shrink_if_sparse(&mut self) {
        let capacity = self.slots.len();
        if self.iterating > 0 || self.len >= capacity / 4 {
            return
        }
        let target = cmp::max(capacity / 2, self.floor);
        if target >= capacity {
            return
        }

        // Move all live items to the front keeping their order.
        let mut write = 0;
        for read in 0..capacity {
            if self.slots[read].is_some() {
                self.slots.swap(write, read);
                write += 1;
            }
        }
        self.slots.truncate(target);
        self.slots.shrink_to_fit();
        self.free_hint = self.len;
    }
}

impl<T> Default for Bag<T> {
    fn default() -> Self {
        Self::new()
    }
}


//------------ SharedBag -----------------------------------------------------

/// A bag that can be shared between threads.
///
/// Reading operations take the read lock, modifications take the write
/// lock. Methods that hand out items clone them, so `T` is typically an
/// `Arc<_>` or some other cheap handle.
#[derive(Debug)]
pub struct SharedBag<T> {
    inner: RwLock<Bag<T>>,
}

impl<T> SharedBag<T> {
    pub fn new() -> Self {
        SharedBag { inner: RwLock::new(Bag::new()) }
    }

    pub fn try_new() -> Result<Self, AllocationError> {
        Bag::try_new().map(|bag| SharedBag { inner: RwLock::new(bag) })
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.read().capacity()
    }

    pub fn add(&self, item: T) -> Result<Slot, AllocationError> {
        self.inner.write().add(item)
    }

    /// Removes the item in the given slot.
    ///
    /// This is only useful during an iteration since slots may change
    /// otherwise. See [`Iteration::remove`].
    pub fn remove(&self, slot: Slot) -> T {
        self.inner.write().remove(slot)
    }

    pub fn reserve(&self, count: usize) -> Result<(), AllocationError> {
        self.inner.write().reserve(count)
    }

    /// Adds `item` unless an item matching `pred` is already present.
    ///
    /// The check and the insertion happen under the same lock. Returns
    /// `Ok(None)` if the item was added or a clone of the present item
    /// otherwise.
    pub fn add_unique<F>(
        &self, item: T, mut pred: F
    ) -> Result<Option<T>, AllocationError>
    where T: Clone, F: FnMut(&T) -> bool {
        let mut bag = self.inner.write();
        if let Some((_, present)) = bag.iter().find(|(_, item)| pred(item)) {
            return Ok(Some(present.clone()))
        }
        bag.add(item).map(|_| None)
    }

    /// Removes the first item matching `pred`.
    pub fn remove_first<F>(&self, mut pred: F) -> Option<T>
    where F: FnMut(&T) -> bool {
        let mut bag = self.inner.write();
        let slot = bag.iter().find(|(_, item)| pred(item))?.0;
        Some(bag.remove(slot))
    }

    /// Returns a clone of the first item matching `pred`.
    pub fn find<F>(&self, mut pred: F) -> Option<T>
    where T: Clone, F: FnMut(&T) -> bool {
        self.inner.read().iter().find(|(_, item)| pred(item)).map(|(_, item)| {
            item.clone()
        })
    }

    /// Returns the number of items matching `pred`.
    pub fn count<F>(&self, mut pred: F) -> usize
    where F: FnMut(&T) -> bool {
        self.inner.read().iter().filter(|(_, item)| pred(item)).count()
    }

    /// Returns clones of all items currently in the bag.
    pub fn snapshot(&self) -> Vec<T>
    where T: Clone {
        self.inner.read().iter().map(|(_, item)| item.clone()).collect()
    }

    /// Opens an iteration over the bag.
    ///
    /// The iteration stays open until the returned value is dropped.
    pub fn start_iteration(&self) -> Iteration<T> {
        self.inner.write().start_iteration();
        Iteration { bag: self, next: 0 }
    }
}

impl<T> Default for SharedBag<T> {
    fn default() -> Self {
        Self::new()
    }
}


//------------ Iteration -----------------------------------------------------

/// An open iteration over a shared bag.
///
/// Each step takes the read lock only briefly, so other threads can keep
/// using the bag while the iteration is open.
pub struct Iteration<'a, T> {
    bag: &'a SharedBag<T>,
    next: usize,
}

impl<'a, T> Iteration<'a, T> {
    /// Removes the item in a slot returned by this iteration.
    pub fn remove(&self, slot: Slot) -> T {
        self.bag.remove(slot)
    }
}

impl<'a, T: Clone> Iterator for Iteration<'a, T> {
    type Item = (Slot, T);

    fn next(&mut self) -> Option<Self::Item> {
        let bag = self.bag.inner.read();
        let slot = bag.occupied_from(self.next)?;
        self.next = slot.0 + 1;
        bag.get(slot).map(|item| (slot, item.clone()))
    }
}

impl<'a, T> Drop for Iteration<'a, T> {
    fn drop(&mut self) {
        self.bag.inner.write().stop_iteration()
    }
}


//============ Testing =======================================================
