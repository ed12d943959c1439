pub use super::error::ContainerErrors;
pub use super::free_list::IndexFreeList;
pub use super::slot::Slot;
pub use super::slot_map::SlotMap;
