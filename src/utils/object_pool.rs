use super::handle::HandleLike;
use super::handle_pool::HandlePool;

/// A named object collection. Every time you create or free a handle, an
/// attached instance `T` is created or freed alongside it.
pub struct ObjectPool<H: HandleLike, T: Sized> {
    handles: HandlePool<H>,
    entries: Vec<Option<T>>,
}

impl<H: HandleLike, T: Sized> Default for ObjectPool<H, T> {
    fn default() -> Self {
        ObjectPool {
            handles: HandlePool::new(),
            entries: Vec::new(),
        }
    }
}

impl<H: HandleLike, T: Sized> ObjectPool<H, T> {
    /// Constructs a new, empty `ObjectPool`.
    pub fn new() -> Self {
        Default::default()
    }

    /// Constructs a new `ObjectPool` with the specified capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        ObjectPool {
            handles: HandlePool::with_capacity(capacity),
            entries: Vec::with_capacity(capacity),
        }
    }

    /// Creates a `T` and names it with a `Handle`.
    pub fn create(&mut self, value: T) -> H {
        let handle = self.handles.create();
        let index = handle.index() as usize;

        if index >= self.entries.len() {
            self.entries.push(Some(value));
        } else {
            debug_assert!(self.entries[index].is_none());
            self.entries[index] = Some(value);
        }

        handle
    }

    /// Returns an immutable reference to the value named by `handle`.
    #[inline]
    pub fn get(&self, handle: H) -> Option<&T> {
        if self.handles.contains(handle) {
            self.entries[handle.index() as usize].as_ref()
        } else {
            None
        }
    }

    /// Returns a mutable reference to the value named by `handle`.
    #[inline]
    pub fn get_mut(&mut self, handle: H) -> Option<&mut T> {
        if self.handles.contains(handle) {
            self.entries[handle.index() as usize].as_mut()
        } else {
            None
        }
    }

    /// Returns true if this `Handle` was created by this `ObjectPool`, and
    /// has not been freed yet.
    #[inline]
    pub fn contains(&self, handle: H) -> bool {
        self.handles.contains(handle)
    }

    /// Recycles the value named by `handle`.
    #[inline]
    pub fn free(&mut self, handle: H) -> Option<T> {
        if self.handles.free(handle) {
            self.entries[handle.index() as usize].take()
        } else {
            None
        }
    }

    /// Returns the total number of alive handles in this `ObjectPool`.
    #[inline]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Checks if the pool is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// An iterator visiting all key-value pairs in index order.
    pub fn iter<'a>(&'a self) -> impl Iterator<Item = (H, &T)> + 'a {
        let entries = &self.entries;
        self.handles
            .iter()
            .filter_map(move |v| entries[v.index() as usize].as_ref().map(|e| (v, e)))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::utils::handle::Handle;

    #[test]
    fn basic() {
        let mut set = ObjectPool::<Handle, i32>::new();

        let e1 = set.create(3);
        assert_eq!(set.get(e1), Some(&3));
        assert_eq!(set.len(), 1);
        assert_eq!(set.free(e1), Some(3));
        assert_eq!(set.len(), 0);
        assert_eq!(set.get(e1), None);
        assert_eq!(set.free(e1), None);
        assert_eq!(set.len(), 0);
    }

    #[test]
    fn stale_handle_after_reuse() {
        let mut set = ObjectPool::<Handle, &'static str>::new();

        let e1 = set.create("first");
        set.free(e1);

        let e2 = set.create("second");
        assert_eq!(e1.index(), e2.index());
        assert_eq!(set.get(e1), None);
        assert_eq!(set.get(e2), Some(&"second"));
    }

    #[test]
    fn iterator() {
        let mut set = ObjectPool::<Handle, i32>::new();
        for i in 0..10 {
            set.create(i);
        }

        assert_eq!(set.iter().count(), 10);
        for (handle, &value) in set.iter() {
            assert_eq!(handle.index() as i32, value);
        }
    }
}
