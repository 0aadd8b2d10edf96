pub mod ids;
pub mod model;
pub mod state_machine;
pub mod types;

pub use ids::*;
pub use model::*;
pub use state_machine::*;
pub use types::*;
