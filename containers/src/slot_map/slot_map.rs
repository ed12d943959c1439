use crate::error::ContainerErrors;
use crate::slot::Slot;

/// Dense generational slot map.
///
/// Values are packed contiguously and reached through a proxy slot table, so
/// removal is a swap-remove and stale handles fail the generation check.
#[derive(Debug)]
pub struct SlotMap<T> {
    // second field is the proxy slot index owning the value
    pub(crate) data: Vec<(T, u64)>,
    pub(crate) slots: Vec<Slot<T>>,
    pub(crate) free_list: Vec<u64>,
}

impl<T> Default for SlotMap<T> {
    fn default() -> Self {
        Self {
            data: Default::default(),
            slots: Default::default(),
            free_list: Default::default(),
        }
    }
}

impl<T> SlotMap<T> {
    pub fn insert(&mut self, element: T) -> Slot<T> {
        let data_index = self.data.len() as u64;
        let (proxy_index, generation) = match self.free_list.pop() {
            Some(index) => {
                let proxy = &mut self.slots[index as usize];
                *proxy = Slot::new(data_index, proxy.generation());
                (index, proxy.generation())
            }
            None => {
                self.slots.push(Slot::new(data_index, 0));
                (self.slots.len() as u64 - 1, 0)
            }
        };
        self.data.push((element, proxy_index));
        Slot::new(proxy_index, generation)
    }

    fn data_index(&self, slot: Slot<T>) -> Result<usize, ContainerErrors> {
        let proxy = self
            .slots
            .get(slot.id() as usize)
            .ok_or(ContainerErrors::NonexistentSlot)?;
        if proxy.generation() != slot.generation() {
            return Err(ContainerErrors::GenerationMismatch);
        }
        Ok(proxy.id() as usize)
    }

    pub fn remove(&mut self, slot: Slot<T>) -> Result<T, ContainerErrors> {
        let data_index = self.data_index(slot)?;
        // bump so every outstanding copy of this handle goes stale
        let proxy = &mut self.slots[slot.id() as usize];
        *proxy = Slot::new(proxy.id(), proxy.generation() + 1);

        let (value, _) = self.data.swap_remove(data_index);
        if let Some((_, moved_proxy)) = self.data.get(data_index) {
            let moved = &mut self.slots[*moved_proxy as usize];
            *moved = Slot::new(data_index as u64, moved.generation());
        }
        self.free_list.push(slot.id());
        Ok(value)
    }

    pub fn get(&self, slot: Slot<T>) -> Option<&T> {
        self.data_index(slot)
            .ok()
            .and_then(|index| self.data.get(index))
            .map(|data| &data.0)
    }

    pub fn get_mut(&mut self, slot: Slot<T>) -> Option<&mut T> {
        self.data_index(slot)
            .ok()
            .and_then(|index| self.data.get_mut(index))
            .map(|data| &mut data.0)
    }

    pub fn contains(&self, slot: Slot<T>) -> bool {
        self.data_index(slot).is_ok()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Iterates values in dense order together with their live handles
    pub fn iter(&self) -> impl Iterator<Item = (Slot<T>, &T)> + '_ {
        self.data.iter().map(|(value, proxy)| {
            let generation = self.slots[*proxy as usize].generation();
            (Slot::new(*proxy, generation), value)
        })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Slot<T>, &mut T)> + '_ {
        let slots = &self.slots;
        self.data.iter_mut().map(move |(value, proxy)| {
            let generation = slots[*proxy as usize].generation();
            (Slot::new(*proxy, generation), value)
        })
    }

    pub fn slots(&self) -> Vec<Slot<T>> {
        self.iter().map(|(slot, _)| slot).collect()
    }
}
