pub mod handler;
mod hub;

pub use hub::{BroadcastHub, RoutingPolicy};
