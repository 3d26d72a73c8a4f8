//! Connection registry: resolves a connection name to a live, pooled handle
//! and routes statements to the matching backend adapter.

mod gate;
pub mod registry;

pub use registry::{ConnectionRegistry, ConnectionState};
