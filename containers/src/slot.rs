use derivative::Derivative;
use std::marker::PhantomData;

/// Generation-checked handle into a [`crate::slot_map::SlotMap`]
#[derive(Derivative)]
#[derivative(Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Slot<T> {
    id: u64,
    generation: u64,
    #[derivative(
        Debug = "ignore",
        PartialEq = "ignore",
        Hash = "ignore",
        PartialOrd = "ignore",
        Ord = "ignore"
    )]
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Slot<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Slot<T> {}

impl<T> Slot<T> {
    pub fn new(id: u64, generation: u64) -> Self {
        Self {
            id,
            generation,
            _marker: PhantomData,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    struct NotCopy;

    #[test]
    fn test_slot_is_copy_for_any_payload() {
        let slot: Slot<NotCopy> = Slot::new(3, 1);
        let copy = slot;
        assert_eq!(slot, copy);
        assert_eq!(copy.id(), 3);
        assert_eq!(copy.generation(), 1);
    }

    #[test]
    fn test_generation_distinguishes_slots() {
        let mut set = HashSet::new();
        set.insert(Slot::<u32>::new(0, 0));
        set.insert(Slot::<u32>::new(0, 1));
        set.insert(Slot::<u32>::new(0, 0));
        assert_eq!(set.len(), 2);
    }
}
