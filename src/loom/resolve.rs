use rustc_hash::FxHashSet as HashSet;

use super::{
    error::GraphError,
    graph::Graph,
    layout::TensorDesc,
    node::{NodeId, PortConfig},
};

/// A port of the selected configuration of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Port {
    Input(usize),
    Output(usize),
}

/// Outcome of one resolution step on a node.
enum Step {
    /// Every port is concrete.
    Done,
    /// One port was resolved.
    Resolved,
    /// A neighbor must resolve first.
    Wait(NodeId),
}

impl Graph {
    /// Replaces every unresolved port descriptor of the selected configuration with a concrete one.
    ///
    /// A port shared in place with a concrete port of the same shape mirrors it. Otherwise the
    /// connected neighbor's port is adopted when it is concrete and agrees on element type and
    /// shape; a neighbor port that is itself unresolved but in place makes the neighbor resolve
    /// first. Anything else falls back to the dense layout of the declared shape. Resolution that
    /// comes back to a node still in progress is a structural error.
    #[cfg_attr(feature = "trace", tracing::instrument(skip(self)))]
    pub fn resolve_configured_descriptors(&mut self, id: NodeId) -> Result<(), GraphError> {
        let mut stack = vec![id];
        let mut progress = HashSet::default();
        progress.insert(id);

        while let Some(&top) = stack.last() {
            match self.resolve_step(top)? {
                Step::Done => {
                    stack.pop();
                    progress.remove(&top);
                }
                Step::Resolved => {}
                Step::Wait(neighbor) => {
                    if !progress.insert(neighbor) {
                        let node = self.node(neighbor)?;
                        let reason = "descriptor resolution revisits a node in progress";
                        return Err(node.structural(reason));
                    }
                    stack.push(neighbor);
                }
            }
        }
        Ok(())
    }

    fn resolve_step(&mut self, id: NodeId) -> Result<Step, GraphError> {
        let node = self.node(id)?;
        let config = &node.selected_or("descriptor resolution")?.config;
        let unresolved = |ports: &[PortConfig]| ports.iter().position(|x| !x.desc.is_concrete());
        let port = match unresolved(&config.inputs) {
            Some(index) => Port::Input(index),
            None => match unresolved(&config.outputs) {
                Some(index) => Port::Output(index),
                None => return Ok(Step::Done),
            },
        };
        let (own, mirror) = match port {
            Port::Input(index) => {
                let port = &config.inputs[index];
                let mirror = port.in_place.and_then(|x| config.outputs.get(x));
                (port, mirror)
            }
            Port::Output(index) => {
                let port = &config.outputs[index];
                let mirror = port.in_place.and_then(|x| config.inputs.get(x));
                (port, mirror)
            }
        };

        let adopt = |other: &TensorDesc| -> Option<TensorDesc> {
            let desc = &own.desc;
            let fits = other.is_concrete()
                && other.data_type == desc.data_type
                && other.shape == desc.shape;
            fits.then(|| other.clone())
        };

        let resolved = match mirror.and_then(|x| adopt(&x.desc)) {
            Some(desc) => desc,
            None => match self.neighbor_port(id, port)? {
                Some((_, neighbor)) if adopt(&neighbor.desc).is_some() => neighbor.desc.clone(),
                Some((other, neighbor))
                    if !neighbor.desc.is_concrete() && neighbor.in_place.is_some() =>
                {
                    return Ok(Step::Wait(other));
                }
                _ => TensorDesc::planar(own.desc.data_type, own.desc.shape.clone()),
            },
        };

        log::trace!("node `{}` resolves {port:?} as {resolved}", node.name);
        let node = self.node_mut(id)?;
        let Some(selected) = node.selected_mut() else {
            return Err(node.precondition("descriptor resolution before a descriptor is selected"));
        };
        let config = &mut selected.config;
        match port {
            Port::Input(index) => config.inputs[index].desc = resolved,
            Port::Output(index) => config.outputs[index].desc = resolved,
        }
        Ok(Step::Resolved)
    }

    /// The selected port config on the other end of the edge at `port`: the producer's output for
    /// an input, the first consumer's input for an output.
    fn neighbor_port(
        &self,
        id: NodeId,
        port: Port,
    ) -> Result<Option<(NodeId, &PortConfig)>, GraphError> {
        let (other, index, output) = match port {
            Port::Input(index) => match self.parent_edge_at(id, index) {
                Ok(edge) => {
                    let edge = self.edge(edge)?;
                    (edge.parent, edge.parent_port, true)
                }
                Err(_) => return Ok(None),
            },
            Port::Output(index) => match self.child_edges_at_port(id, index)?.first() {
                Some(&edge) => {
                    let edge = self.edge(edge)?;
                    (edge.child, edge.child_port, false)
                }
                None => return Ok(None),
            },
        };

        let node = self.node(other)?;
        let Some(desc) = node.selected() else {
            let name = &self.node(id)?.name;
            let reason = format!("neighbor of `{name}` has no selected descriptor");
            return Err(node.precondition(reason));
        };
        let ports = match output {
            true => &desc.config.outputs,
            false => &desc.config.inputs,
        };
        Ok(ports.get(index).or(ports.first()).map(|x| (other, x)))
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use crate::{
        hal::KernelCandidate,
        loom::{
            config::GraphBuilder,
            error::GraphError,
            graph::tests::{Scripted, chain, relu_spec},
            layout::{Format, TensorDesc},
            num::DataType,
        },
    };

    fn unresolved(shape: [usize; 4], in_place: bool) -> KernelCandidate {
        let desc = TensorDesc::any(DataType::F32, shape);
        KernelCandidate {
            inputs: vec![desc.clone()],
            outputs: vec![desc],
            weights: vec![],
            impl_name: "ref:any".into(),
            in_place,
        }
    }

    #[test]
    fn test_adopts_producer_layout() -> Result<(), Box<dyn Error>> {
        let shape = [1, 16, 2, 2];
        let mut graph = GraphBuilder::new(Scripted(vec![unresolved(shape, true)])).build();
        let [input, relu, output] = chain(&mut graph, &shape)?;
        for id in [input, relu, output] {
            graph.discover_candidates(id)?;
            graph.select_primitive_descriptor(id)?;
        }
        graph.resolve_configured_descriptors(relu)?;
        graph.resolve_configured_descriptors(output)?;

        let planar = TensorDesc::planar(DataType::F32, shape);
        let config = &graph.node(relu)?.selected().map(|x| x.config.clone()).unwrap_or_default();
        assert_eq!(config.inputs[0].desc, planar);
        // the output mirrors its in-place input
        assert_eq!(config.outputs[0].desc, planar);
        let config = &graph.node(output)?.selected().map(|x| x.config.clone()).unwrap_or_default();
        assert_eq!(config.inputs[0].desc, planar);
        Ok(())
    }

    #[test]
    fn test_in_place_producer_resolves_first() -> Result<(), Box<dyn Error>> {
        let shape = [1, 16, 2, 2];
        let mut graph = GraphBuilder::new(Scripted(vec![unresolved(shape, true)])).build();
        let [input, relu, output] = chain(&mut graph, &shape)?;
        for id in [input, relu, output] {
            graph.discover_candidates(id)?;
            graph.select_primitive_descriptor(id)?;
        }
        // the consumer resolves before its producer, forcing the producer to finalize
        graph.resolve_configured_descriptors(output)?;

        let planar = TensorDesc::planar(DataType::F32, shape);
        let relu = graph.node(relu)?.selected().map(|x| x.config.clone()).unwrap_or_default();
        assert_eq!(relu.outputs[0].desc, planar);
        let output = graph.node(output)?.selected().map(|x| x.config.clone()).unwrap_or_default();
        assert_eq!(output.inputs[0].desc, planar);
        Ok(())
    }

    #[test]
    fn test_fallback_to_dense() -> Result<(), Box<dyn Error>> {
        let shape = [1, 16, 2, 2];
        let mut graph = GraphBuilder::new(Scripted(vec![unresolved(shape, false)])).build();
        let [input, relu, output] = chain(&mut graph, &shape)?;
        for id in [input, relu, output] {
            graph.discover_candidates(id)?;
            graph.select_primitive_descriptor(id)?;
        }
        graph.resolve_configured_descriptors(output)?;
        graph.resolve_configured_descriptors(relu)?;

        let relu = graph.node(relu)?.selected().map(|x| x.config.clone()).unwrap_or_default();
        let planar = TensorDesc::planar(DataType::F32, shape);
        assert_eq!(relu.inputs[0].desc, planar);
        assert_eq!(relu.outputs[0].desc, planar);
        assert_ne!(relu.outputs[0].desc.format(), Some(Format::NChw16c));
        Ok(())
    }

    #[test]
    fn test_in_place_cycle_is_structural() -> Result<(), Box<dyn Error>> {
        let shape = [1, 16, 2, 2];
        let mut graph = GraphBuilder::new(Scripted(vec![unresolved(shape, true)])).build();
        let x = graph.add_node(&relu_spec("x", &shape))?;
        let y = graph.add_node(&relu_spec("y", &shape))?;
        graph.connect(x, 0, y, 0)?;
        graph.connect(y, 0, x, 0)?;
        for id in [x, y] {
            graph.discover_candidates(id)?;
            graph.select_primitive_descriptor(id)?;
            let selected = graph.node_mut(id)?.selected_mut().ok_or("nothing selected")?;
            selected.config.outputs[0].in_place = Some(0);
        }

        // each waits on the other's unresolved in-place output
        assert!(matches!(
            graph.resolve_configured_descriptors(x),
            Err(GraphError::Structural { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_requires_selection() -> Result<(), Box<dyn Error>> {
        let shape = [1, 16, 2, 2];
        let mut graph = GraphBuilder::new(Scripted(vec![unresolved(shape, false)])).build();
        let [_, relu, _] = chain(&mut graph, &shape)?;
        graph.discover_candidates(relu)?;
        assert!(matches!(
            graph.resolve_configured_descriptors(relu),
            Err(GraphError::Precondition { .. })
        ));
        graph.select_primitive_descriptor(relu)?;
        // the producer has not selected anything yet
        assert!(matches!(
            graph.resolve_configured_descriptors(relu),
            Err(GraphError::Precondition { .. })
        ));
        Ok(())
    }
}
