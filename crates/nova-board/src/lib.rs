//! Task-source boundary: the shared board tasks are discovered on and the claim
//! marker written back to it.

pub mod extract;
pub mod file;
pub mod item;
pub mod memory;
pub mod source;

pub use extract::*;
pub use file::*;
pub use item::*;
pub use memory::*;
pub use source::*;
