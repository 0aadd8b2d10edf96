mod protocol;
mod reclaim;

pub use protocol::*;
pub use reclaim::*;
