use std::{collections::VecDeque, sync::Arc};

use itertools::Itertools;
use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet};

use super::{
    config::GraphConfig,
    edge::{Edge, EdgeId, EdgeStatus},
    error::GraphError,
    layout::TensorDesc,
    loader::{self, NodeSpec},
    node::{ConstantType, Node, NodeId},
};
use crate::hal::{
    Backend, ExecArgs, Stream,
    ops::{OpKind, WeightBlob},
    registry,
};

/// An arena of nodes and edges. Removed entries leave holes, so ids stay stable.
pub struct Graph {
    pub(crate) config: GraphConfig,
    pub(crate) backend: Arc<dyn Backend>,
    pub(crate) nodes: Vec<Option<Node>>,
    pub(crate) edges: Vec<Option<Edge>>,
    pub(crate) names: HashMap<String, NodeId>,
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("config", &self.config)
            .field("nodes", &self.nodes)
            .field("edges", &self.edges)
            .finish_non_exhaustive()
    }
}

fn dead_node(id: NodeId) -> GraphError {
    GraphError::Precondition {
        node: id.to_string(),
        kind: OpKind::Unknown,
        reason: "node has been removed".into(),
    }
}

impl Graph {
    #[inline]
    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    /// Adds a node described by the loader. Nothing is connected yet.
    pub fn add_node(&mut self, spec: &NodeSpec) -> Result<NodeId, GraphError> {
        let op = registry::create(spec)?;
        let id = NodeId(self.nodes.len());
        let inputs = spec.inputs.iter().map(TensorDesc::from).collect();
        let outputs = spec.outputs.iter().map(TensorDesc::from).collect();
        let mut node = Node::new(id, spec.name.clone(), op, inputs, outputs);

        if self.names.contains_key(&spec.name) {
            return Err(node.config_error("duplicated node name"));
        }

        let prefix = &self.config.prefix;
        let kind = node.kind();
        let layout = |err| GraphError::layout(&spec.name, kind, err);
        if let Some(list) = &spec.input_formats {
            node.input_formats = loader::parse_formats(list, prefix).map_err(layout)?;
        }
        if let Some(list) = &spec.output_formats {
            node.output_formats = loader::parse_formats(list, prefix).map_err(layout)?;
        }
        if let Some(list) = &spec.priorities {
            let priorities = loader::parse_priorities(list, prefix);
            node.priorities = priorities.map_err(|err| node.config_error(err))?;
        }

        log::debug!("add node {id} `{}` ({})", node.name, node.kind());
        self.names.insert(spec.name.clone(), id);
        self.nodes.push(Some(node));
        Ok(id)
    }

    /// Connects output `parent_port` of `parent` to input `child_port` of `child`.
    pub fn connect(
        &mut self,
        parent: NodeId,
        parent_port: usize,
        child: NodeId,
        child_port: usize,
    ) -> Result<EdgeId, GraphError> {
        let shape = {
            let node = self.node(parent)?;
            match node.outputs.get(parent_port) {
                Some(desc) => desc.shape.clone(),
                None => {
                    let count = node.outputs.len();
                    let reason = format!("output port {parent_port} out of {count}");
                    return Err(node.config_error(reason));
                }
            }
        };
        {
            let node = self.node(child)?;
            if child_port >= node.inputs.len() {
                let count = node.inputs.len();
                let reason = format!("input port {child_port} out of {count}");
                return Err(node.config_error(reason));
            }
            if self.parent_edge_at(child, child_port).is_ok() {
                let reason = format!("input port {child_port} is already connected");
                return Err(node.config_error(reason));
            }
        }

        let id = EdgeId(self.edges.len());
        let edge = Edge::new(parent, parent_port, child, child_port, shape);
        self.edges.push(Some(edge));
        self.node_mut(parent)?.child_edges.push(id);
        self.node_mut(child)?.parent_edges.push(id);
        Ok(id)
    }

    #[inline]
    pub fn find(&self, name: &str) -> Option<NodeId> {
        self.names.get(name).copied()
    }

    pub fn node(&self, id: NodeId) -> Result<&Node, GraphError> {
        self.nodes
            .get(id.0)
            .and_then(Option::as_ref)
            .ok_or_else(|| dead_node(id))
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> Result<&mut Node, GraphError> {
        self.nodes
            .get_mut(id.0)
            .and_then(Option::as_mut)
            .ok_or_else(|| dead_node(id))
    }

    pub fn edge(&self, id: EdgeId) -> Result<&Edge, GraphError> {
        self.edges
            .get(id.0)
            .and_then(Option::as_ref)
            .ok_or_else(|| GraphError::Precondition {
                node: id.to_string(),
                kind: OpKind::Unknown,
                reason: "edge has been removed".into(),
            })
    }

    pub(crate) fn edge_mut(&mut self, id: EdgeId) -> Result<&mut Edge, GraphError> {
        match self.edges.get_mut(id.0).and_then(Option::as_mut) {
            Some(edge) => Ok(edge),
            None => Err(GraphError::Precondition {
                node: id.to_string(),
                kind: OpKind::Unknown,
                reason: "edge has been removed".into(),
            }),
        }
    }

    /// Live node ids in insertion order.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.iter().flatten().map(|node| node.id).collect()
    }

    /// Live edge ids in insertion order.
    pub fn edge_ids(&self) -> Vec<EdgeId> {
        self.edges
            .iter()
            .enumerate()
            .filter(|(_, edge)| edge.is_some())
            .map(|(index, _)| EdgeId(index))
            .collect()
    }

    /// The edge feeding input `port`.
    pub fn parent_edge_at(&self, id: NodeId, port: usize) -> Result<EdgeId, GraphError> {
        let node = self.node(id)?;
        if port >= node.inputs.len() {
            let count = node.inputs.len();
            return Err(node.precondition(format!("input port {port} out of {count}")));
        }
        for &edge in &node.parent_edges {
            if self.edge(edge)?.child_port == port {
                return Ok(edge);
            }
        }
        Err(node.precondition(format!("input port {port} is not connected")))
    }

    /// All edges fed by output `port`, in connection order.
    pub fn child_edges_at_port(&self, id: NodeId, port: usize) -> Result<Vec<EdgeId>, GraphError> {
        let node = self.node(id)?;
        if port >= node.outputs.len() {
            let count = node.outputs.len();
            return Err(node.precondition(format!("output port {port} out of {count}")));
        }
        let mut edges = vec![];
        for &edge in &node.child_edges {
            if self.edge(edge)?.parent_port == port {
                edges.push(edge);
            }
        }
        Ok(edges)
    }

    /// The first edge fed by output `port`.
    pub fn child_edge_at(&self, id: NodeId, port: usize) -> Result<EdgeId, GraphError> {
        match self.child_edges_at_port(id, port)?.first() {
            Some(&edge) => Ok(edge),
            None => {
                let node = self.node(id)?;
                Err(node.precondition(format!("output port {port} is not connected")))
            }
        }
    }

    /// Producers of a node, one per parent edge.
    pub fn parents(&self, id: NodeId) -> Result<Vec<NodeId>, GraphError> {
        let node = self.node(id)?;
        node.parent_edges
            .iter()
            .map(|&edge| self.edge(edge).map(|edge| edge.parent))
            .collect()
    }

    /// Consumers of a node, one per child edge.
    pub fn children(&self, id: NodeId) -> Result<Vec<NodeId>, GraphError> {
        let node = self.node(id)?;
        node.child_edges
            .iter()
            .map(|&edge| self.edge(edge).map(|edge| edge.child))
            .collect()
    }

    /// Removes an edge and unlinks it from both endpoints.
    pub fn remove_edge(&mut self, id: EdgeId) -> Result<(), GraphError> {
        let Edge { parent, child, .. } = *self.edge(id)?;
        if let Ok(node) = self.node_mut(parent) {
            node.child_edges.retain(|&edge| edge != id);
        }
        if let Ok(node) = self.node_mut(child) {
            node.parent_edges.retain(|&edge| edge != id);
        }
        self.edges[id.0] = None;
        Ok(())
    }

    /// Unlinks every edge of a node, then removes it.
    pub fn remove_node(&mut self, id: NodeId) -> Result<(), GraphError> {
        let node = self.node(id)?;
        let edges = node
            .parent_edges
            .iter()
            .chain(node.child_edges.iter())
            .copied()
            .collect_vec();
        for edge in edges {
            self.remove_edge(edge)?;
        }
        if let Some(node) = self.nodes[id.0].take() {
            self.names.remove(&node.name);
            log::debug!("remove node {id} `{}`", node.name);
        }
        Ok(())
    }

    /// Producers before consumers. Fails on a cycle.
    pub fn topological_order(&self) -> Result<Vec<NodeId>, GraphError> {
        let ids = self.node_ids();
        let mut degrees: HashMap<NodeId, usize> = HashMap::default();
        for &id in &ids {
            degrees.insert(id, self.node(id)?.parent_edges.len());
        }

        let mut queue: VecDeque<_> = ids.iter().copied().filter(|id| degrees[id] == 0).collect();
        let mut order = Vec::with_capacity(ids.len());
        while let Some(id) = queue.pop_front() {
            order.push(id);
            for child in self.children(id)? {
                if let Some(degree) = degrees.get_mut(&child) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(child);
                    }
                }
            }
        }

        match ids.into_iter().find(|id| degrees[id] > 0) {
            Some(id) => Err(self.node(id)?.structural("node is part of a cycle")),
            None => Ok(order),
        }
    }

    /// Whether the node's value is known before any input arrives. Resolved once, then cached.
    ///
    /// Nodes with declared constness answer directly. Otherwise consumers are swept first: reaching
    /// a constant node before a non-constant one settles it. Failing that, producers are swept:
    /// any non-constant producer makes the node non-constant, and it is constant only if some
    /// constant producer was found.
    pub fn is_constant(&mut self, id: NodeId) -> Result<bool, GraphError> {
        let node = self.node(id)?;
        let constant = match (node.constant, node.op.constant()) {
            (ConstantType::Unknown, ConstantType::Unknown) => {
                match self.sweep_constant(id, Direction::Down)? {
                    ConstantType::Const => ConstantType::Const,
                    _ => match self.sweep_constant(id, Direction::Up)? {
                        ConstantType::Const => ConstantType::Const,
                        _ => ConstantType::NoConst,
                    },
                }
            }
            (ConstantType::Unknown, declared) => declared,
            (cached, _) => return Ok(cached == ConstantType::Const),
        };
        log::trace!("node {id} resolved as {constant}");
        self.node_mut(id)?.constant = constant;
        Ok(constant == ConstantType::Const)
    }

    fn sweep_constant(&self, id: NodeId, direction: Direction) -> Result<ConstantType, GraphError> {
        let next = |id| match direction {
            Direction::Down => self.children(id),
            Direction::Up => self.parents(id),
        };
        let mut visited = HashSet::default();
        let mut queue: VecDeque<_> = next(id)?.into();
        let mut found = false;
        while let Some(id) = queue.pop_front() {
            if !visited.insert(id) {
                continue;
            }
            let node = self.node(id)?;
            let constant = match node.constant {
                ConstantType::Unknown => node.op.constant(),
                cached => cached,
            };
            match (direction, constant) {
                (Direction::Down, ConstantType::Unknown) => queue.extend(next(id)?),
                (Direction::Down, constant) => return Ok(constant),
                (Direction::Up, ConstantType::Unknown) => queue.extend(next(id)?),
                (Direction::Up, ConstantType::NoConst) => return Ok(ConstantType::NoConst),
                (Direction::Up, ConstantType::Const) => found = true,
            }
        }
        match found {
            true => Ok(ConstantType::Const),
            false => Ok(ConstantType::Unknown),
        }
    }

    /// Whether a node may write its output over its single input.
    ///
    /// Requires exactly one producer, no fan-out on that producer (looking through a reshape
    /// producer to its own producer), no constant producer feeding a non-constant node, and
    /// every output edge shaped like the input edge.
    pub fn can_be_in_place(&mut self, id: NodeId) -> Result<bool, GraphError> {
        let node = self.node(id)?;
        let &[edge] = node.parent_edges.as_slice() else {
            return Ok(false);
        };
        let edge = self.edge(edge)?;
        let (parent, shape) = (edge.parent, edge.shape.clone());
        if self.node(parent)?.child_edges.len() != 1 {
            return Ok(false);
        }
        if self.is_constant(parent)? && !self.is_constant(id)? {
            return Ok(false);
        }

        let producer = self.node(parent)?;
        if matches!(producer.kind(), OpKind::Reshape | OpKind::Flatten) {
            if let Some(&edge) = producer.parent_edges.first() {
                let grand = self.edge(edge)?.parent;
                if self.node(grand)?.child_edges.len() != 1 {
                    return Ok(false);
                }
            }
        }

        for &edge in &self.node(id)?.child_edges {
            if self.edge(edge)?.shape != shape {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Runs the node's kernel on `stream`.
    ///
    /// Every incident edge must be allocated. Nodes whose operation needs no kernel return at once.
    pub fn execute(&self, id: NodeId, stream: &mut Stream) -> Result<(), GraphError> {
        let node = self.node(id)?;
        let desc = node.selected_or("execution")?;
        for &edge in node.parent_edges.iter().chain(node.child_edges.iter()) {
            let status = self.edge(edge)?.status;
            if status < EdgeStatus::Allocated {
                let reason = format!("execution before edge {edge} is allocated ({status})");
                return Err(node.precondition(reason));
            }
        }
        if !node.op.requires_execution() {
            return Ok(());
        }

        let memory = |edge: EdgeId| {
            self.edge(edge)?
                .memory
                .clone()
                .ok_or_else(|| node.precondition(format!("edge {edge} has no memory")))
        };
        let inputs = (0..node.inputs.len())
            .map(|port| self.parent_edge_at(id, port).and_then(&memory))
            .collect::<Result<Vec<_>, _>>()?;
        let outputs = (0..node.outputs.len())
            .map(|port| self.child_edge_at(id, port).and_then(&memory))
            .collect::<Result<Vec<_>, _>>()?;

        let args = ExecArgs {
            op: node.op.as_ref(),
            config: &desc.config,
            inputs: &inputs,
            outputs: &outputs,
            weights: &node.weights,
        };
        self.backend
            .execute(stream, args)
            .map_err(|source| GraphError::Backend {
                node: node.name.clone(),
                kind: node.kind(),
                source,
            })?;
        stream.launch();
        Ok(())
    }

    /// Runs every preparation phase over the whole graph, producers first.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub fn prepare(&mut self) -> Result<(), GraphError> {
        let order = self.topological_order()?;
        for &id in &order {
            self.discover_candidates(id)?;
            self.filter_by_format_hints(id)?;
            self.select_primitive_descriptor(id)?;
        }
        for &id in &order {
            self.resolve_configured_descriptors(id)?;
        }
        self.init_edges()?;
        self.allocate_edges()?;
        self.prepare_weights()?;
        self.validate_edges()
    }

    /// Weight blobs of a node as declared by the model.
    pub(crate) fn weight_blobs(&self, id: NodeId) -> Result<&[WeightBlob], GraphError> {
        Ok(self.node(id)?.op.weights())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Down,
    Up,
}

#[cfg(test)]
pub(crate) mod tests {
    use std::error::Error;

    use super::Graph;
    use crate::{
        hal::{Backend, BackendError, ExecArgs, KernelCandidate, OpDesc, Stream},
        loom::{
            config::GraphBuilder,
            error::GraphError,
            loader::NodeSpec,
            node::{ConstantType, NodeId},
            num::DataType,
        },
    };

    /// Offers a fixed list of candidates for every query.
    pub(crate) struct Scripted(pub Vec<KernelCandidate>);

    impl Backend for Scripted {
        fn candidates(&self, _desc: &OpDesc) -> Vec<KernelCandidate> {
            self.0.clone()
        }

        fn execute(&self, _stream: &mut Stream, _args: ExecArgs<'_>) -> Result<(), BackendError> {
            Ok(())
        }
    }

    pub(crate) fn relu_spec(name: &str, shape: &[usize]) -> NodeSpec {
        NodeSpec::new(name, "ReLU")
            .input(DataType::F32, shape)
            .output(DataType::F32, shape)
    }

    /// `input -> relu -> output` over `shape`.
    pub(crate) fn chain(graph: &mut Graph, shape: &[usize]) -> Result<[NodeId; 3], GraphError> {
        let input = graph.add_node(&NodeSpec::new("input", "Input").output(DataType::F32, shape))?;
        let relu = graph.add_node(&relu_spec("relu", shape))?;
        let output = graph.add_node(&NodeSpec::new("output", "Output").input(DataType::F32, shape))?;
        graph.connect(input, 0, relu, 0)?;
        graph.connect(relu, 0, output, 0)?;
        Ok([input, relu, output])
    }

    #[test]
    fn test_connect_checks_ports() -> Result<(), Box<dyn Error>> {
        let mut graph = GraphBuilder::new(Scripted(vec![])).build();
        let [input, relu, _] = chain(&mut graph, &[4])?;
        assert!(matches!(
            graph.connect(input, 1, relu, 0),
            Err(GraphError::Config { .. })
        ));
        assert!(matches!(
            graph.connect(input, 0, relu, 0),
            Err(GraphError::Config { .. })
        ));
        assert!(graph.add_node(&relu_spec("relu", &[4])).is_err());
        Ok(())
    }

    #[test]
    fn test_remove_node_unlinks() -> Result<(), Box<dyn Error>> {
        let mut graph = GraphBuilder::new(Scripted(vec![])).build();
        let [input, relu, output] = chain(&mut graph, &[4])?;
        graph.remove_node(relu)?;

        assert!(graph.node(relu).is_err());
        assert!(graph.node(input)?.child_edges().is_empty());
        assert!(graph.node(output)?.parent_edges().is_empty());
        for id in graph.node_ids() {
            let node = graph.node(id)?;
            for &edge in node.parent_edges().iter().chain(node.child_edges()) {
                let edge = graph.edge(edge)?;
                assert!(graph.node(edge.parent()).is_ok());
                assert!(graph.node(edge.child()).is_ok());
            }
        }
        assert!(graph.edge_ids().is_empty());
        assert!(graph.find("relu").is_none());
        assert!(matches!(
            graph.parents(relu),
            Err(GraphError::Precondition { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_topological_order() -> Result<(), Box<dyn Error>> {
        let mut graph = GraphBuilder::new(Scripted(vec![])).build();
        let output = graph.add_node(&NodeSpec::new("result", "Output").input(DataType::F32, [4]))?;
        let [input, relu, sink] = chain(&mut graph, &[4])?;
        graph.remove_node(sink)?;
        graph.connect(relu, 0, output, 0)?;
        assert_eq!(graph.topological_order()?, vec![input, relu, output]);

        let x = graph.add_node(&relu_spec("x", &[4]))?;
        let y = graph.add_node(&relu_spec("y", &[4]))?;
        graph.connect(x, 0, y, 0)?;
        graph.connect(y, 0, x, 0)?;
        assert!(matches!(
            graph.topological_order(),
            Err(GraphError::Structural { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_constant_propagation() -> Result<(), Box<dyn Error>> {
        let mut graph = GraphBuilder::new(Scripted(vec![])).build();
        let weight = graph.add_node(&NodeSpec::new("w", "Const").output(DataType::F32, [4]))?;
        let folded = graph.add_node(&relu_spec("folded", &[4]))?;
        let [input, relu, _] = chain(&mut graph, &[4])?;
        graph.connect(weight, 0, folded, 0)?;

        assert!(graph.is_constant(folded)?);
        assert!(!graph.is_constant(relu)?);
        assert!(!graph.is_constant(input)?);
        assert_eq!(graph.node(folded)?.constant(), ConstantType::Const);

        // cached results survive changes to the graph
        let edge = graph.parent_edge_at(folded, 0)?;
        graph.remove_edge(edge)?;
        assert!(graph.is_constant(folded)?);
        assert!(!graph.is_constant(relu)?);
        Ok(())
    }

    #[test]
    fn test_in_place_requires_equal_shapes() -> Result<(), Box<dyn Error>> {
        let mut graph = GraphBuilder::new(Scripted(vec![])).build();
        let [_, relu, _] = chain(&mut graph, &[2, 8])?;
        assert!(graph.can_be_in_place(relu)?);

        let input = graph.add_node(&NodeSpec::new("x", "Input").output(DataType::F32, [2, 8]))?;
        let pool = graph.add_node(
            &NodeSpec::new("pool", "Pooling")
                .input(DataType::F32, [2, 8])
                .output(DataType::F32, [2, 4]),
        )?;
        let output = graph.add_node(&NodeSpec::new("y", "Output").input(DataType::F32, [2, 4]))?;
        graph.connect(input, 0, pool, 0)?;
        graph.connect(pool, 0, output, 0)?;
        assert!(!graph.can_be_in_place(pool)?);
        Ok(())
    }

    #[test]
    fn test_in_place_rejects_fan_out() -> Result<(), Box<dyn Error>> {
        let mut graph = GraphBuilder::new(Scripted(vec![])).build();
        let [input, relu, _] = chain(&mut graph, &[4])?;
        let other = graph.add_node(&relu_spec("other", &[4]))?;
        graph.connect(input, 0, other, 0)?;
        assert!(!graph.can_be_in_place(relu)?);

        // a reshape in between does not hide the fan-out
        let mut graph = GraphBuilder::new(Scripted(vec![])).build();
        let [input, relu, _] = chain(&mut graph, &[4])?;
        let edge = graph.parent_edge_at(relu, 0)?;
        graph.remove_edge(edge)?;
        let reshape = graph.add_node(
            &NodeSpec::new("reshape", "Reshape")
                .input(DataType::F32, [4])
                .output(DataType::F32, [4]),
        )?;
        let other = graph.add_node(&relu_spec("other", &[4]))?;
        graph.connect(input, 0, reshape, 0)?;
        graph.connect(reshape, 0, relu, 0)?;
        assert!(graph.can_be_in_place(relu)?);
        graph.connect(input, 0, other, 0)?;
        assert!(!graph.can_be_in_place(relu)?);
        Ok(())
    }

    #[test]
    fn test_constant_producer_blocks_in_place() -> Result<(), Box<dyn Error>> {
        let mut graph = GraphBuilder::new(Scripted(vec![])).build();
        let weight = graph.add_node(&NodeSpec::new("w", "Const").output(DataType::F32, [4]))?;
        let output = graph.add_node(&NodeSpec::new("y", "Output").input(DataType::F32, [4]))?;
        graph.connect(weight, 0, output, 0)?;
        assert!(graph.is_constant(weight)?);
        assert!(!graph.is_constant(output)?);
        assert!(!graph.can_be_in_place(output)?);
        Ok(())
    }
}
