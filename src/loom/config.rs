use std::sync::Arc;

use rustc_hash::FxHashMap as HashMap;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::{
    graph::Graph,
    impl_type::{DEFAULT_PRIORITIES, ImplType},
    weights::WeightCache,
};
use crate::hal::Backend;

/// How weight buffers are shared through the [`WeightCache`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum WeightSharing {
    /// Every node materializes its own buffers.
    Disabled,
    /// Keyed by node name, weight index and content.
    #[default]
    PerNode,
    /// Keyed by weight index and content only, so identical blobs of different nodes share one buffer.
    Content,
}

#[derive(Debug, Clone)]
pub struct GraphConfig {
    /// Backend prefix of format hint and priority tokens.
    pub prefix: String,
    pub weight_sharing: WeightSharing,
    pub weight_cache: Arc<WeightCache>,
    pub default_priorities: Vec<ImplType>,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            prefix: "cpu:".into(),
            weight_sharing: Default::default(),
            weight_cache: Default::default(),
            default_priorities: DEFAULT_PRIORITIES.to_vec(),
        }
    }
}

pub struct GraphBuilder {
    backend: Arc<dyn Backend>,
    config: GraphConfig,
}

impl GraphBuilder {
    pub fn new(backend: impl Backend + 'static) -> Self {
        Self::with_backend(Arc::new(backend))
    }

    pub fn with_backend(backend: Arc<dyn Backend>) -> Self {
        let config = Default::default();
        Self { backend, config }
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.prefix = prefix.into();
        self
    }

    pub fn weight_sharing(mut self, sharing: WeightSharing) -> Self {
        self.config.weight_sharing = sharing;
        self
    }

    /// Uses a cache that may outlive the graph or be shared with other graphs.
    pub fn weight_cache(mut self, cache: Arc<WeightCache>) -> Self {
        self.config.weight_cache = cache;
        self
    }

    pub fn default_priorities(mut self, priorities: Vec<ImplType>) -> Self {
        self.config.default_priorities = priorities;
        self
    }

    pub fn build(self) -> Graph {
        let Self { backend, config } = self;
        Graph {
            config,
            backend,
            nodes: vec![],
            edges: vec![],
            names: HashMap::default(),
        }
    }
}
