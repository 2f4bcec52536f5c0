//! Data models for Vigil

mod frame;
mod instance;
mod labels;
mod rule;

pub use frame::*;
pub use instance::*;
pub use labels::*;
pub use rule::*;
