pub mod config;
pub mod dispatcher;
pub mod runner;
pub mod util;
pub mod worker;

pub use config::*;
pub use dispatcher::*;
pub use runner::*;
pub use util::*;
pub use worker::*;
