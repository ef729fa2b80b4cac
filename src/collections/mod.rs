mod slotmap;

pub use slotmap::{SlotKey, SlotMap};
pub(crate) use slotmap::slot_keys;
