use std::{
    hash::{Hash, Hasher},
    sync::{Arc, Mutex},
};

use derive_more::Deref;
use itertools::Itertools;
use rustc_hash::{FxHashMap as HashMap, FxHasher};

use super::{
    buffer::{Buffer, Memory},
    config::WeightSharing,
    error::GraphError,
    graph::Graph,
    layout::{self, LayoutError, TensorDesc},
    node::NodeId,
};
use crate::hal::ops::WeightBlob;

/// Key of a materialized weight buffer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    /// Owning node, absent when deduplicating by content alone.
    pub name: Option<String>,
    pub index: usize,
    pub len: usize,
    pub hash: u64,
    /// Layout the buffer is packed into. Equal bytes packed for different kernels never share.
    pub desc: TensorDesc,
}

impl Fingerprint {
    pub fn new(name: Option<&str>, index: usize, bytes: &[u8], desc: &TensorDesc) -> Self {
        let mut hasher = FxHasher::default();
        bytes.hash(&mut hasher);
        Self {
            name: name.map(ToOwned::to_owned),
            index,
            len: bytes.len(),
            hash: hasher.finish(),
            desc: desc.clone(),
        }
    }
}

/// An immutable weight buffer, repacked into the layout a kernel expects.
#[derive(Debug, Deref)]
pub struct WeightBuffer(Memory);

impl WeightBuffer {
    /// Repacks a blob into `desc`.
    pub fn pack(blob: &WeightBlob, desc: &TensorDesc) -> Result<Self, LayoutError> {
        let bytes = match blob.desc.is_compatible(desc) {
            true => blob.data.to_vec().into_boxed_slice(),
            false => layout::reorder(&blob.desc, desc, &blob.data)?,
        };
        let buffer = Buffer::from_bytes(bytes);
        Memory::from_buffer(buffer, desc.clone()).map(Self)
    }

    #[inline]
    pub fn memory(&self) -> &Memory {
        &self.0
    }
}

type Slot = Arc<Mutex<Option<Arc<WeightBuffer>>>>;

/// Fingerprint-keyed store of weight buffers, safe to share between threads and graphs.
#[derive(Debug, Default)]
pub struct WeightCache {
    slots: Mutex<HashMap<Fingerprint, Slot>>,
}

impl WeightCache {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the buffer stored under `key`, running `create` only if there is none.
    ///
    /// Concurrent callers with the same key wait on the same slot, so `create` runs at most once
    /// per key and everyone observes the same instance. A failed `create` leaves the slot empty.
    pub fn find_or_create<E>(
        &self,
        key: Fingerprint,
        create: impl FnOnce() -> Result<WeightBuffer, E>,
    ) -> Result<Arc<WeightBuffer>, E> {
        let slot = self
            .slots
            .lock()
            .expect("failed to lock")
            .entry(key)
            .or_default()
            .clone();
        let mut slot = slot.lock().expect("failed to lock");
        if let Some(buffer) = slot.as_ref() {
            log::trace!("weight cache hit");
            return Ok(buffer.clone());
        }
        let buffer = Arc::new(create()?);
        *slot = Some(buffer.clone());
        Ok(buffer)
    }

    /// Fingerprints `blob` and materializes it into `desc` on a miss.
    pub fn materialize(
        &self,
        name: Option<&str>,
        index: usize,
        blob: &WeightBlob,
        desc: &TensorDesc,
    ) -> Result<Arc<WeightBuffer>, LayoutError> {
        let key = Fingerprint::new(name, index, &blob.data, desc);
        self.find_or_create(key, || {
            log::debug!("materialize weight {index} of {} into {desc}", name.unwrap_or("<shared>"));
            WeightBuffer::pack(blob, desc)
        })
    }

    /// Number of fingerprints seen.
    pub fn len(&self) -> usize {
        self.slots.lock().expect("failed to lock").len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Graph {
    /// Materializes weight `index` of a node into the layout its selected descriptor expects,
    /// sharing through the graph's [`WeightCache`] according to [`WeightSharing`].
    pub fn materialize_weight_buffer(
        &self,
        id: NodeId,
        index: usize,
    ) -> Result<Arc<WeightBuffer>, GraphError> {
        let node = self.node(id)?;
        let Some(blob) = self.weight_blobs(id)?.get(index) else {
            let count = node.op.weights().len();
            return Err(node.precondition(format!("weight {index} out of {count}")));
        };
        let config = &node.selected_or("weight materialization")?.config;
        let desc = config.weights.get(index).unwrap_or(&blob.desc);

        let cache = &self.config.weight_cache;
        let layout = |err| GraphError::layout(&node.name, node.kind(), err);
        match self.config.weight_sharing {
            WeightSharing::Disabled => WeightBuffer::pack(blob, desc).map(Arc::new).map_err(layout),
            WeightSharing::PerNode => cache
                .materialize(Some(&node.name), index, blob, desc)
                .map_err(layout),
            WeightSharing::Content => cache.materialize(None, index, blob, desc).map_err(layout),
        }
    }

    /// Materializes the weights of every node with a selected descriptor.
    #[cfg_attr(feature = "trace", tracing::instrument(skip(self)))]
    pub fn prepare_weights(&mut self) -> Result<(), GraphError> {
        let jobs = self
            .node_ids()
            .into_iter()
            .filter_map(|id| self.node(id).ok())
            .filter(|node| node.selected().is_some())
            .flat_map(|node| (0..node.op.weights().len()).map(move |index| (node.id, index)))
            .collect_vec();

        #[cfg(not(feature = "rayon"))]
        let buffers = jobs
            .iter()
            .map(|&(id, index)| self.materialize_weight_buffer(id, index))
            .collect::<Result<Vec<_>, _>>()?;
        #[cfg(feature = "rayon")]
        let buffers = {
            use rayon::prelude::*;
            jobs.par_iter()
                .map(|&(id, index)| self.materialize_weight_buffer(id, index))
                .collect::<Result<Vec<_>, _>>()?
        };

        for id in jobs.iter().map(|&(id, _)| id).dedup() {
            self.node_mut(id)?.weights.clear();
        }
        for ((id, _), buffer) in jobs.into_iter().zip_eq(buffers) {
            self.node_mut(id)?.weights.push(buffer);
        }
        Ok(())
    }
}
