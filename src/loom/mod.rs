//! The `loom` module is the graph core.
//!
//! ## Key Components
//! 1. **Descriptors**:
//!    - Tensor descriptors (`TensorDesc`) with element type, shape and a blocked physical layout.
//!    - Named memory formats and reordering between layouts.
//!
//! 2. **Graph**:
//!    - An arena of nodes and edges with stable ids.
//!    - Constant propagation and in-place eligibility.
//!
//! 3. **Preparation**:
//!    - Candidate discovery and selection against implementation priorities.
//!    - Resolution of layouts left open by the selected candidates.
//!    - Edge buffer planning, where in-place and fan-out edges alias one buffer.
//!    - Weight materialization through a fingerprint-keyed cache that may be shared by graphs.
//!
//! Phases run per node in topological order, see [`Graph::prepare`].

pub mod buffer;
pub mod config;
pub mod edge;
pub mod error;
pub mod graph;
pub mod impl_type;
pub mod layout;
pub mod loader;
mod memory;
mod negotiate;
pub mod node;
pub mod num;
mod resolve;
pub mod shape;
pub mod weights;

pub use config::{GraphBuilder, GraphConfig, WeightSharing};
pub use error::GraphError;
pub use graph::Graph;
