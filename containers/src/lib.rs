pub mod error;
pub mod free_list;
pub mod prelude;
pub mod slot;
pub mod slot_map;
