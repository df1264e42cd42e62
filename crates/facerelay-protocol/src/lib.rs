//! Wire types shared by the relay and its observers.

pub mod messages;
pub mod types;

pub use messages::*;
pub use types::*;
