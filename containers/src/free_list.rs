/// Hands out `u32` indices in `[reserved, capacity)`, recycling released ones.
///
/// Indices below `reserved` are never returned, which lets callers keep
/// permanent sentinel entries at the front of a table.
#[derive(Debug)]
pub struct IndexFreeList {
    next: u32,
    capacity: u32,
    free_list: Vec<u32>,
}

impl IndexFreeList {
    pub fn new(reserved: u32, capacity: u32) -> Self {
        Self {
            next: reserved.min(capacity),
            capacity,
            free_list: Vec::new(),
        }
    }

    /// Returns [`None`] once every index is handed out
    pub fn allocate(&mut self) -> Option<u32> {
        if let Some(index) = self.free_list.pop() {
            return Some(index);
        }
        if self.next >= self.capacity {
            return None;
        }
        let index = self.next;
        self.next += 1;
        Some(index)
    }

    pub fn free(&mut self, index: u32) {
        debug_assert!(index < self.next, "Freeing index {index} that was never allocated");
        debug_assert!(
            !self.free_list.contains(&index),
            "Index {index} freed twice"
        );
        self.free_list.push(index);
    }

    /// Number of indices currently handed out
    pub fn allocated(&self) -> u32 {
        self.next - self.free_list.len() as u32
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_indices_are_skipped() {
        let mut list = IndexFreeList::new(1, 4);
        assert_eq!(list.allocate(), Some(1));
        assert_eq!(list.allocate(), Some(2));
        assert_eq!(list.allocate(), Some(3));
        assert_eq!(list.allocate(), None);
    }

    #[test]
    fn test_freed_index_is_reused() {
        let mut list = IndexFreeList::new(1, 16);
        let a = list.allocate().unwrap();
        let b = list.allocate().unwrap();
        list.free(a);
        assert_eq!(list.allocate(), Some(a));
        assert_ne!(a, b);
    }

    #[test]
    fn test_allocated_count() {
        let mut list = IndexFreeList::new(0, 8);
        let a = list.allocate().unwrap();
        list.allocate().unwrap();
        assert_eq!(list.allocated(), 2);
        list.free(a);
        assert_eq!(list.allocated(), 1);
    }

    #[test]
    fn test_exhausted_list_recovers_after_free() {
        let mut list = IndexFreeList::new(1, 2);
        let a = list.allocate().unwrap();
        assert_eq!(list.allocate(), None);
        list.free(a);
        assert_eq!(list.allocate(), Some(a));
    }
}
