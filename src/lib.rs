//! Execution-graph layer of an inference engine.
//!
//! [`loom`] holds the graph core: nodes and edges in an arena, kernel descriptor negotiation,
//! layout resolution, buffer planning with in-place aliasing, and a shared weight cache.
//! [`hal`] is the seam to kernel backends, along with the operation types and a reference CPU
//! backend.

pub mod hal;
pub mod loom;
