//! Datastore boundary: runs, sub-issues and the append-only transition log.

mod checked;
mod memory;
mod traits;

pub use checked::*;
pub use memory::*;
pub use traits::*;
