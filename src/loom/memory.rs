use rustc_hash::FxHashMap as HashMap;

use super::{
    buffer::Memory,
    edge::{EdgeId, EdgeStatus},
    error::GraphError,
    graph::Graph,
    layout::{LayoutError, TensorDesc},
    node::NodeId,
};

impl Graph {
    /// Moves every edge to [`EdgeStatus::NotAllocated`] and decides which edges alias another
    /// edge's buffer.
    ///
    /// Consumers of one output port share the buffer of the first. An output marked in place with
    /// an input writes into the input edge's buffer, and vice versa. Alias chains are folded so
    /// each aliasing edge points at the edge that owns the buffer.
    #[cfg_attr(feature = "trace", tracing::instrument(skip(self)))]
    pub fn init_edges(&mut self) -> Result<(), GraphError> {
        let mut alias: HashMap<EdgeId, EdgeId> = HashMap::default();
        let mut insert = |graph: &Graph, from: EdgeId, to: EdgeId| -> Result<(), GraphError> {
            if from == to {
                return Ok(());
            }
            match alias.insert(from, to) {
                Some(other) if other != to => {
                    let node = graph.node(graph.edge(from)?.child)?;
                    let reason = format!("edge {from} would alias both {other} and {to}");
                    Err(node.structural(reason))
                }
                _ => Ok(()),
            }
        };

        for id in self.node_ids() {
            let node = self.node(id)?;
            for port in 0..node.outputs.len() {
                let edges = self.child_edges_at_port(id, port)?;
                if let Some((&first, rest)) = edges.split_first() {
                    for &edge in rest {
                        insert(self, edge, first)?;
                    }
                }
            }

            let Some(desc) = node.selected() else {
                continue;
            };
            for (port, config) in desc.config.outputs.iter().enumerate() {
                let Some(input) = config.in_place else {
                    continue;
                };
                let output = self.child_edges_at_port(id, port)?.first().copied();
                if let (Some(output), Ok(input)) = (output, self.parent_edge_at(id, input)) {
                    insert(self, output, input)?;
                }
            }
            for (port, config) in desc.config.inputs.iter().enumerate() {
                let Some(output) = config.in_place else {
                    continue;
                };
                let output = self.child_edges_at_port(id, output)?.first().copied();
                if let (Ok(input), Some(output)) = (self.parent_edge_at(id, port), output) {
                    insert(self, input, output)?;
                }
            }
        }

        for id in self.edge_ids() {
            self.change_status(id, EdgeStatus::NotAllocated)?;
            self.edge_mut(id)?.shared = None;
        }
        for &from in alias.keys() {
            let root = self.redirect(&alias, from)?;
            log::debug!("edge {from} shares the buffer of {root}");
            self.edge_mut(from)?.shared = Some(root);
        }
        Ok(())
    }

    /// Follows the alias map from `id` to the edge owning the buffer.
    fn redirect(&self, alias: &HashMap<EdgeId, EdgeId>, id: EdgeId) -> Result<EdgeId, GraphError> {
        let mut root = id;
        for _ in 0..=alias.len() {
            match alias.get(&root) {
                Some(&next) => root = next,
                None => return Ok(root),
            }
        }
        let node = self.node(self.edge(id)?.child)?;
        Err(node.structural(format!("buffer aliasing of edge {id} forms a cycle")))
    }

    fn change_status(&mut self, id: EdgeId, status: EdgeStatus) -> Result<(), GraphError> {
        let child = self.edge(id)?.child;
        let result = self.edge_mut(id)?.change_status(status);
        match result {
            Ok(()) => Ok(()),
            Err(err) => Err(self.node(child)?.precondition(format!("edge {id}: {err}"))),
        }
    }

    fn layout_error(&self, id: NodeId, err: LayoutError) -> GraphError {
        match self.node(id) {
            Ok(node) => GraphError::layout(&node.name, node.kind(), err),
            Err(err) => err,
        }
    }

    /// The descriptor an edge's buffer is viewed through: its producer's selected output layout.
    fn edge_desc(&self, id: EdgeId) -> Result<TensorDesc, GraphError> {
        let edge = self.edge(id)?;
        let node = self.node(edge.parent)?;
        let desc = node.selected_or("allocation")?;
        match desc.config.outputs.get(edge.parent_port) {
            Some(port) => Ok(port.desc.clone()),
            None => {
                let port = edge.parent_port;
                Err(node.precondition(format!("selected descriptor lacks output port {port}")))
            }
        }
    }

    fn bind(&mut self, id: EdgeId, memory: Memory) -> Result<(), GraphError> {
        self.edge_mut(id)?.memory = Some(memory);
        self.change_status(id, EdgeStatus::Allocated)
    }

    /// Binds memory to every not-yet-allocated edge of a node.
    ///
    /// Edges owning their buffer get a fresh one, sized and laid out per the producer's selected
    /// descriptor. Aliasing edges view the owner's buffer through their own descriptor, allocating
    /// the owner first if needed. Fails if a descriptor is still unresolved.
    #[cfg_attr(feature = "trace", tracing::instrument(skip(self)))]
    pub fn resolve_not_allocated_edges(&mut self, id: NodeId) -> Result<(), GraphError> {
        let node = self.node(id)?;
        let edges = [node.parent_edges.as_slice(), node.child_edges.as_slice()].concat();
        for edge in edges {
            match self.edge(edge)?.status {
                EdgeStatus::NotAllocated => {}
                EdgeStatus::Uninitialized => {
                    let node = self.node(id)?;
                    return Err(node.precondition(format!("edge {edge} is not initialized")));
                }
                EdgeStatus::Allocated | EdgeStatus::Validated => continue,
            }

            let owner = self.edge(edge)?.shared.unwrap_or(edge);
            if self.edge(owner)?.memory.is_none() {
                let desc = self.edge_desc(owner)?;
                let parent = self.edge(owner)?.parent;
                let memory = Memory::alloc(desc).map_err(|err| self.layout_error(parent, err))?;
                self.bind(owner, memory)?;
            }
            if owner == edge {
                continue;
            }

            let desc = self.edge_desc(edge)?;
            let memory = match &self.edge(owner)?.memory {
                Some(memory) => memory.view(desc).map_err(|err| self.layout_error(id, err))?,
                None => {
                    let node = self.node(id)?;
                    return Err(node.precondition(format!("edge {owner} has no memory")));
                }
            };
            self.bind(edge, memory)?;
        }
        Ok(())
    }

    /// Allocates or aliases every edge of the graph, producers first.
    pub fn allocate_edges(&mut self) -> Result<(), GraphError> {
        for id in self.topological_order()? {
            self.resolve_not_allocated_edges(id)?;
        }
        Ok(())
    }

    /// Checks every allocated edge and marks it [`EdgeStatus::Validated`].
    ///
    /// Both ends must agree on element type, shape and layout. A layout mismatch would need a
    /// reorder node, which is not inserted here.
    pub fn validate_edges(&mut self) -> Result<(), GraphError> {
        for id in self.edge_ids() {
            let edge = self.edge(id)?;
            let child = self.node(edge.child)?;
            if edge.status < EdgeStatus::Allocated || edge.memory.is_none() {
                let status = edge.status;
                return Err(child.precondition(format!("edge {id} validated while {status}")));
            }

            let port = edge.child_port;
            let produced = self.edge_desc(id)?;
            let inputs = &child.selected_or("validation")?.config.inputs;
            let Some(consumed) = inputs.get(port).map(|x| &x.desc) else {
                let reason = format!("selected descriptor lacks input port {port}");
                return Err(child.precondition(reason));
            };
            if !produced.is_compatible(consumed) {
                let reason = format!("input {port} expects {consumed}, producer gives {produced}");
                return Err(child.config_error(reason));
            }

            self.change_status(id, EdgeStatus::Validated)?;
        }
        Ok(())
    }
}
