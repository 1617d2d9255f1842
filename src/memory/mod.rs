//! Memory management utilities used by the virtual machine.

pub mod arena;

pub use arena::{Arena, ArenaHandle};
