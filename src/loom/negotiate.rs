use itertools::Itertools;

use super::{
    error::GraphError,
    graph::Graph,
    impl_type::merge_priorities,
    layout::{Format, TensorDesc},
    node::{NodeId, PortConfig, PrimitiveDesc},
};

impl Graph {
    /// Populates the candidate configurations of a node. Returns how many were found.
    ///
    /// Operations that declare their own candidates never reach the backend. Fails if nothing is
    /// found for a node that must execute.
    #[cfg_attr(feature = "trace", tracing::instrument(skip(self)))]
    pub fn discover_candidates(&mut self, id: NodeId) -> Result<usize, GraphError> {
        let node = self.node(id)?;
        // views share their input buffer whatever the neighborhood
        let in_place = match node.op.requires_execution() {
            true => self.can_be_in_place(id)?,
            false => true,
        };

        let backend = self.backend.clone();
        let node = self.node_mut(id)?;
        let candidates = match node.op.builtin_candidates(&node.inputs, &node.outputs) {
            Some(candidates) => candidates,
            None => node
                .op
                .descs(&node.inputs, &node.outputs)
                .iter()
                .flat_map(|desc| backend.candidates(desc))
                .collect(),
        };
        node.candidates = candidates
            .into_iter()
            .map(|candidate| PrimitiveDesc::new(candidate, in_place))
            .collect();
        node.selected = None;

        log::debug!(
            "node `{}` ({}): {} candidates [{}]",
            node.name,
            node.kind(),
            node.candidates.len(),
            node.candidates.iter().map(|x| &x.impl_name).format(", ")
        );
        if node.candidates.is_empty() && node.op.requires_execution() {
            return Err(node.unsupported("the backend reports no candidates"));
        }
        Ok(node.candidates.len())
    }

    /// Drops every candidate whose hinted ports do not have the hinted format.
    pub fn filter_by_format_hints(&mut self, id: NodeId) -> Result<(), GraphError> {
        let node = self.node_mut(id)?;
        let (inputs, outputs) = (&node.input_formats, &node.output_formats);
        if inputs.len() > node.inputs.len() {
            let (hints, ports) = (inputs.len(), node.inputs.len());
            let reason = format!("{hints} input format hints for {ports} input ports");
            return Err(node.config_error(reason));
        }
        if outputs.len() > node.outputs.len() {
            let (hints, ports) = (outputs.len(), node.outputs.len());
            let reason = format!("{hints} output format hints for {ports} output ports");
            return Err(node.config_error(reason));
        }
        if inputs.is_empty() && outputs.is_empty() {
            return Ok(());
        }

        fn suitable(ports: &[PortConfig], hints: &[Format]) -> bool {
            ports
                .iter()
                .zip(hints)
                .all(|(port, &format)| port.desc.matches_format(format))
        }
        let before = node.candidates.len();
        let (inputs, outputs) = (inputs.clone(), outputs.clone());
        node.candidates.retain(|candidate| {
            suitable(&candidate.config.inputs, &inputs)
                && suitable(&candidate.config.outputs, &outputs)
        });
        log::debug!(
            "node `{}`: format hints keep {} of {before} candidates",
            node.name,
            node.candidates.len()
        );
        Ok(())
    }

    /// Selects one candidate: the first implementation kind in priority order that any candidate
    /// has wins, and among candidates of that kind the one whose inputs agree with the most
    /// already-selected producer outputs. Earlier candidates win ties. Falls back to the first
    /// candidate when no kind matches.
    #[cfg_attr(feature = "trace", tracing::instrument(skip(self)))]
    pub fn select_primitive_descriptor(&mut self, id: NodeId) -> Result<usize, GraphError> {
        let node = self.node(id)?;
        if node.candidates.is_empty() {
            return Err(node.unsupported("no candidate configuration to select"));
        }

        let priorities = merge_priorities(&node.priorities, &self.config.default_priorities);
        let mut selected = None;
        for impl_type in priorities {
            let mut best: Option<(usize, isize)> = None;
            for (index, candidate) in node.candidates.iter().enumerate() {
                if candidate.impl_type != impl_type {
                    continue;
                }
                if best.is_none() {
                    best = Some((index, -1));
                }
                if candidate.config.inputs.len() > node.parent_edges.len() {
                    continue;
                }
                let matches = self.count_producer_matches(id, &candidate.config.inputs)?;
                if best.is_none_or(|(_, count)| matches > count) {
                    best = Some((index, matches));
                }
            }
            if let Some((index, _)) = best {
                selected = Some(index);
                break;
            }
        }

        let index = match selected {
            Some(index) => index,
            None => {
                let impl_name = &node.candidates[0].impl_name;
                log::warn!(
                    "node `{}`: no preferred implementation available, fall back to `{impl_name}`",
                    node.name
                );
                0
            }
        };

        let node = self.node_mut(id)?;
        node.selected = Some(index);
        log::debug!(
            "node `{}` selects candidate {index} ({})",
            node.name,
            node.candidates[index].impl_type
        );
        Ok(index)
    }

    /// Number of input ports whose layout equals the finalized output layout of their producer.
    fn count_producer_matches(&self, id: NodeId, inputs: &[PortConfig]) -> Result<isize, GraphError> {
        let mut count = 0;
        for (port, config) in inputs.iter().enumerate() {
            let Ok(edge) = self.parent_edge_at(id, port) else {
                continue;
            };
            let edge = self.edge(edge)?;
            let Some(parent) = self.node(edge.parent)?.selected() else {
                continue;
            };
            let outputs = &parent.config.outputs;
            let produced: Option<&TensorDesc> = outputs
                .get(edge.parent_port)
                .or(outputs.first())
                .map(|port| &port.desc);
            if let Some(desc) = produced {
                if desc.is_concrete() && desc.is_compatible(&config.desc) {
                    count += 1;
                }
            }
        }
        Ok(count)
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
            graph::tests::{Scripted, chain},
            layout::{Format, TensorDesc},
            loader::NodeSpec,
            num::DataType,
        },
    };

    fn candidate(desc: &TensorDesc, impl_name: &'static str) -> KernelCandidate {
        KernelCandidate {
            inputs: vec![desc.clone()],
            outputs: vec![desc.clone()],
            weights: vec![],
            impl_name: impl_name.into(),
            in_place: true,
        }
    }

    #[test]
    fn test_selection_follows_priorities() -> Result<(), Box<dyn Error>> {
        let planar = TensorDesc::planar(DataType::F32, [1, 16, 2, 2]);
        let blocked = TensorDesc::with_format(DataType::F32, [1, 16, 2, 2], Format::NChw16c)?;
        let backend = Scripted(vec![
            candidate(&planar, "ref:any"),
            candidate(&planar, "jit:uni"),
            candidate(&blocked, "jit:avx512"),
        ]);
        let mut graph = GraphBuilder::new(backend).build();
        let [input, relu, _] = chain(&mut graph, &[1, 16, 2, 2])?;
        graph.discover_candidates(input)?;
        graph.select_primitive_descriptor(input)?;

        assert_eq!(graph.discover_candidates(relu)?, 3);
        assert_eq!(graph.select_primitive_descriptor(relu)?, 1);
        assert!(graph.node(relu)?.is_in_place()?);
        Ok(())
    }

    #[test]
    fn test_priority_override() -> Result<(), Box<dyn Error>> {
        let planar = TensorDesc::planar(DataType::F32, [8]);
        let backend = Scripted(vec![candidate(&planar, "jit:uni"), candidate(&planar, "ref:any")]);
        let mut graph = GraphBuilder::new(backend).build();
        let spec = NodeSpec::new("relu", "ReLU")
            .input(DataType::F32, [8])
            .output(DataType::F32, [8])
            .priorities("cpu:ref_any,gpu:jit_uni");
        let relu = graph.add_node(&spec)?;
        graph.discover_candidates(relu)?;
        assert_eq!(graph.select_primitive_descriptor(relu)?, 1);
        assert_eq!(graph.node(relu)?.primitive_descriptor_type()?, "ref_any_F32");
        Ok(())
    }

    #[test]
    fn test_fallback_selects_first() -> Result<(), Box<dyn Error>> {
        let planar = TensorDesc::planar(DataType::F32, [8]);
        let backend = Scripted(vec![
            candidate(&planar, "vendor:fast"),
            candidate(&planar, "vendor:faster"),
        ]);
        let mut graph = GraphBuilder::new(backend).default_priorities(vec![]).build();
        let [_, relu, _] = chain(&mut graph, &[8])?;
        graph.discover_candidates(relu)?;
        assert_eq!(graph.select_primitive_descriptor(relu)?, 0);
        assert_eq!(graph.node(relu)?.selected_index(), Some(0));
        Ok(())
    }

    #[test]
    fn test_no_candidates_is_unsupported() -> Result<(), Box<dyn Error>> {
        let mut graph = GraphBuilder::new(Scripted(vec![])).build();
        let [input, relu, output] = chain(&mut graph, &[8])?;
        assert_eq!(graph.discover_candidates(input)?, 1);
        assert_eq!(graph.discover_candidates(output)?, 1);

        assert!(matches!(
            graph.discover_candidates(relu),
            Err(GraphError::Unsupported { .. })
        ));
        assert!(matches!(
            graph.select_primitive_descriptor(relu),
            Err(GraphError::Unsupported { .. })
        ));
        assert!(graph.node(relu)?.selected().is_none());
        Ok(())
    }

    #[test]
    fn test_format_hints() -> Result<(), Box<dyn Error>> {
        let shape = [1, 16, 2, 2];
        let planar = TensorDesc::planar(DataType::F32, shape);
        let nhwc = TensorDesc::with_format(DataType::F32, shape, Format::Nhwc)?;
        let backend = Scripted(vec![candidate(&planar, "jit:uni"), candidate(&nhwc, "jit:uni")]);
        let mut graph = GraphBuilder::new(backend).build();

        let spec = NodeSpec::new("relu", "ReLU")
            .input(DataType::F32, shape)
            .output(DataType::F32, shape)
            .output_formats("cpu:nhwc");
        let relu = graph.add_node(&spec)?;
        graph.discover_candidates(relu)?;
        graph.filter_by_format_hints(relu)?;
        let node = graph.node(relu)?;
        assert_eq!(node.candidates().len(), 1);
        assert_eq!(node.candidates()[0].config.outputs[0].desc, nhwc);

        let spec = NodeSpec::new("bad", "ReLU")
            .input(DataType::F32, shape)
            .output(DataType::F32, shape)
            .input_formats("cpu:nchw,cpu:nhwc");
        let bad = graph.add_node(&spec)?;
        graph.discover_candidates(bad)?;
        assert!(matches!(
            graph.filter_by_format_hints(bad),
            Err(GraphError::Config { .. })
        ));
        Ok(())
    }

    /// `Input -> Reshape -> Convolution`: the convolution offers a generic layout first and the
    /// layout its producer settled on second, both of the same implementation kind.
    #[test]
    fn test_select_matches_producer_layout() -> Result<(), Box<dyn Error>> {
        let shape = [1, 3, 4, 4];
        let planar = TensorDesc::planar(DataType::F32, shape);
        let nhwc = TensorDesc::with_format(DataType::F32, shape, Format::Nhwc)?;
        let output = TensorDesc::planar(DataType::F32, [1, 8, 4, 4]);
        let conv = |input: &TensorDesc| KernelCandidate {
            inputs: vec![input.clone()],
            outputs: vec![output.clone()],
            weights: vec![],
            impl_name: "jit:avx2".into(),
            in_place: false,
        };
        let backend = Scripted(vec![conv(&nhwc), conv(&planar)]);
        let mut graph = GraphBuilder::new(backend).build();

        let input = graph.add_node(&NodeSpec::new("data", "Input").output(DataType::F32, shape))?;
        let reshape = graph.add_node(
            &NodeSpec::new("reshape", "Reshape")
                .input(DataType::F32, shape)
                .output(DataType::F32, shape),
        )?;
        let conv = graph.add_node(
            &NodeSpec::new("conv", "Convolution")
                .input(DataType::F32, shape)
                .output(DataType::F32, [1, 8, 4, 4]),
        )?;
        graph.connect(input, 0, reshape, 0)?;
        graph.connect(reshape, 0, conv, 0)?;

        for id in [input, reshape, conv] {
            graph.discover_candidates(id)?;
            graph.select_primitive_descriptor(id)?;
        }
        let node = graph.node(conv)?;
        assert_eq!(node.selected_index(), Some(1));
        assert_eq!(node.selected().map(|x| &x.config.inputs[0].desc), Some(&planar));
        Ok(())
    }
}
