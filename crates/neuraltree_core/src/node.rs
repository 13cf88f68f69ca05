//! Tree nodes: small networks arranged as a tree whose output is the
//! probabilistic mixture of its leaves.

use crate::autodiff::DualGraph;
use crate::codec::{decode_list, encode_list, DecodeError, DecoderRegistry, EncodeError, TypedBlob};
use crate::logsumexp::{log_sum_exp, log_sum_exp_graph};
use crate::network::{Network, Parameter};
use crate::tape::Tape;
use crate::traits::{Graph, ScoringNetwork};
use anyhow::{bail, Result};
use thiserror::Error;
use tracing::{debug, warn};

/// Type tag of an encoded tree node.
pub const NODE_TYPE_TAG: &str = "neuraltree.Node";

const ARITY_MISMATCH: &str = "child node count must match network output size";

/// Nesting limit when decoding, so hostile input cannot exhaust the stack.
pub const MAX_DECODE_DEPTH: usize = 256;

/// A tree built inconsistently with its own networks.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StructureError {
    #[error("node at {path:?} has {children} children but its network outputs {outputs} values")]
    Arity {
        path: Vec<usize>,
        children: usize,
        outputs: usize,
    },

    #[error("leaf at {path:?} outputs {found} classes, expected {expected}")]
    ClassCount {
        path: Vec<usize>,
        expected: usize,
        found: usize,
    },

    #[error("node at {path:?} takes {found} inputs, expected {expected}")]
    InputSize {
        path: Vec<usize>,
        expected: usize,
        found: usize,
    },
}

/// A node makes decisions by running its children or, at a leaf, by scoring
/// the classes directly.
///
/// At a leaf `network` outputs class log-probabilities; at a branch it outputs
/// one log-probability per child. Children are owned; the tree never shares
/// subtrees.
#[derive(Debug, Clone, PartialEq)]
pub struct TreeNode<N = Network> {
    pub network: N,
    pub children: Vec<TreeNode<N>>,
}

impl<N: ScoringNetwork> TreeNode<N> {
    pub fn leaf(network: N) -> Self {
        Self {
            network,
            children: Vec::new(),
        }
    }

    pub fn branch(network: N, children: Vec<TreeNode<N>>) -> Self {
        Self { network, children }
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// Number of nodes in this subtree, this node included.
    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(TreeNode::node_count).sum::<usize>()
    }

    /// Number of branch layers below this node (0 for a leaf).
    pub fn depth(&self) -> usize {
        self.children
            .iter()
            .map(|c| c.depth() + 1)
            .max()
            .unwrap_or(0)
    }

    /// Class log-probabilities, `log P(class | input)`, marginalised over
    /// every root-to-leaf path.
    ///
    /// # Panics
    /// If a branch network's output size differs from its child count.
    pub fn evaluate(&self, input: &[f64]) -> Vec<f64> {
        let weights = self.network.apply(input);
        if self.is_leaf() {
            return weights;
        }
        if weights.len() != self.children.len() {
            panic!("{ARITY_MISMATCH}");
        }

        let mut res: Option<Vec<f64>> = None;
        for (child, &weight) in self.children.iter().zip(&weights) {
            let weighted: Vec<f64> = child.evaluate(input).iter().map(|v| v + weight).collect();
            res = Some(match res {
                None => weighted,
                Some(acc) => log_sum_exp(&acc, &weighted),
            });
        }
        // Non-leaf, so at least one child contributed.
        res.unwrap_or_default()
    }

    /// `evaluate`, recorded on a computation graph so gradients can flow
    /// back into every network.
    ///
    /// # Panics
    /// If a branch network's output size differs from its child count.
    pub fn evaluate_graph<'p, G: Graph<'p>>(&'p self, graph: &mut G, input: &G::Value) -> G::Value {
        let decision = self.network.apply_graph(graph, input);
        if self.is_leaf() {
            return decision;
        }
        if graph.len(&decision) != self.children.len() {
            panic!("{ARITY_MISMATCH}");
        }

        let weights = graph.pool(&decision);
        let mut res: Option<G::Value> = None;
        for (i, child) in self.children.iter().enumerate() {
            let weight = graph.slice(&weights, i, i + 1);
            let child_out = child.evaluate_graph(graph, input);
            let weighted = graph.add_first(&child_out, &weight);
            res = Some(match res {
                None => weighted,
                Some(acc) => log_sum_exp_graph(graph, &acc, &weighted),
            });
        }
        res.unwrap_or(decision)
    }

    /// This node's parameters followed by each child's, in child order.
    pub fn parameters(&self) -> Vec<&Parameter> {
        let mut res = self.network.parameters();
        for child in &self.children {
            res.extend(child.parameters());
        }
        res
    }

    /// Same order as `parameters`.
    pub fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        let mut res = self.network.parameters_mut();
        for child in &mut self.children {
            res.extend(child.parameters_mut());
        }
        res
    }

    /// Total number of trainable scalars.
    pub fn parameter_count(&self) -> usize {
        self.parameters().iter().map(|p| p.len()).sum()
    }

    /// Gradient of `-log P(target | input)` aligned with `parameters()`,
    /// together with that loss.
    pub fn loss_gradient(&self, input: &[f64], target: usize) -> Result<(f64, Vec<Vec<f64>>)> {
        let class_count = self.validate()?;
        if target >= class_count {
            bail!(
                "Target class {} out of range for {} classes.",
                target,
                class_count
            );
        }
        if input.len() != self.network.input_size() {
            bail!(
                "Input dimension mismatch. Expected {}, got {}.",
                self.network.input_size(),
                input.len()
            );
        }

        let mut tape = Tape::new();
        let x = tape.input(input);
        let out = self.evaluate_graph(&mut tape, &x);
        let loss = -tape.value(out)[target];
        let mut seed = vec![0.0; class_count];
        seed[target] = -1.0;
        let grads = tape.backward(out, &seed);
        Ok((loss, grads.ordered(&self.parameters())))
    }

    /// Output values and their directional derivative along `direction`,
    /// which holds one tangent per entry of `parameters()`.
    pub fn evaluate_directional(
        &self,
        input: &[f64],
        direction: &[Vec<f64>],
    ) -> Result<(Vec<f64>, Vec<f64>)> {
        let params = self.parameters();
        if direction.len() != params.len() {
            bail!(
                "Direction covers {} parameters, tree has {}.",
                direction.len(),
                params.len()
            );
        }
        let mut graph = DualGraph::along(params.into_iter().zip(direction.iter().cloned()))?;
        let x = graph.input(input);
        let out = self.evaluate_graph(&mut graph, &x);
        Ok((graph.values(&out), graph.tangents(&out)))
    }

    /// Checks the tree against its networks without evaluating it. Returns
    /// the class count on success.
    pub fn validate(&self) -> Result<usize, StructureError> {
        let mut class_count = None;
        self.validate_at(&mut Vec::new(), self.network.input_size(), &mut class_count)?;
        Ok(class_count.unwrap_or(0))
    }

    fn validate_at(
        &self,
        path: &mut Vec<usize>,
        input_size: usize,
        class_count: &mut Option<usize>,
    ) -> Result<(), StructureError> {
        if self.network.input_size() != input_size {
            return Err(StructureError::InputSize {
                path: path.clone(),
                expected: input_size,
                found: self.network.input_size(),
            });
        }
        let outputs = self.network.output_size();
        if self.is_leaf() {
            match *class_count {
                None => *class_count = Some(outputs),
                Some(expected) if expected != outputs => {
                    return Err(StructureError::ClassCount {
                        path: path.clone(),
                        expected,
                        found: outputs,
                    })
                }
                Some(_) => {}
            }
            return Ok(());
        }
        if outputs != self.children.len() {
            return Err(StructureError::Arity {
                path: path.clone(),
                children: self.children.len(),
                outputs,
            });
        }
        for (i, child) in self.children.iter().enumerate() {
            path.push(i);
            child.validate_at(path, input_size, class_count)?;
            path.pop();
        }
        Ok(())
    }

    /// Encodes the node as a blob list: children first, network last.
    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        let mut list = Vec::with_capacity(self.children.len() + 1);
        for child in &self.children {
            list.push(TypedBlob::new(NODE_TYPE_TAG, child.encode()?));
        }
        list.push(TypedBlob::new(self.network.type_tag(), self.network.encode()?));
        encode_list(&list)
    }

    /// Decodes a node encoded by `encode`, resolving networks through
    /// `registry`. The decoded tree is validated before it is returned.
    pub fn decode(bytes: &[u8], registry: &DecoderRegistry<N>) -> Result<Self, DecodeError> {
        let node = Self::decode_unchecked(bytes, registry, 0)
            .and_then(|node| {
                node.validate()?;
                Ok(node)
            })
            .inspect_err(|err| {
                warn!("Rejected tree encoding: {err}");
            })?;
        debug!(
            nodes = node.node_count(),
            depth = node.depth(),
            "Decoded tree"
        );
        Ok(node)
    }

    fn decode_unchecked(
        bytes: &[u8],
        registry: &DecoderRegistry<N>,
        depth: usize,
    ) -> Result<Self, DecodeError> {
        if depth > MAX_DECODE_DEPTH {
            return Err(DecodeError::TooDeep(MAX_DECODE_DEPTH));
        }
        let mut list = decode_list(bytes)?;
        let network_blob = list.pop().ok_or(DecodeError::EmptyList)?;
        let network = registry.decode(&network_blob)?;
        let mut children = Vec::with_capacity(list.len());
        for (index, blob) in list.into_iter().enumerate() {
            if blob.tag != NODE_TYPE_TAG {
                return Err(DecodeError::ExpectedNode {
                    index,
                    tag: blob.tag,
                });
            }
            children.push(Self::decode_unchecked(&blob.payload, registry, depth + 1)?);
        }
        Ok(Self { network, children })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{build_binary_tree, TreeSettings};
    use crate::network::{DenseLayer, Layer};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const INPUT: [f64; 4] = [0.1, -0.2, 0.3, 0.05];

    fn settings(depth: usize) -> TreeSettings {
        TreeSettings {
            depth,
            input_size: 4,
            hidden_size: 8,
            class_count: 3,
        }
    }

    fn tree(depth: usize, seed: u64) -> TreeNode {
        let mut rng = StdRng::seed_from_u64(seed);
        build_binary_tree(settings(depth), &mut rng).expect("tree should build")
    }

    fn random_net(input: usize, output: usize, rng: &mut StdRng) -> Network {
        let mut net = Network::mlp(input, 5, output);
        net.randomize(rng);
        net
    }

    fn assert_close(a: &[f64], b: &[f64], tol: f64) {
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b) {
            assert!((x - y).abs() < tol, "{x} vs {y}");
        }
    }

    #[test]
    fn depth_two_tree_outputs_a_distribution() {
        let tree = tree(2, 11);
        assert_eq!(tree.node_count(), 7);
        let out = tree.evaluate(&INPUT);
        assert_eq!(out.len(), 3);
        let total: f64 = out.iter().map(|v| v.exp()).sum();
        assert!((total - 1.0).abs() < 1e-6, "total probability {total}");
    }

    #[test]
    fn outputs_are_distributions_at_every_depth() {
        for depth in 0..5 {
            let tree = tree(depth, depth as u64);
            for input in [INPUT, [1.0, 2.0, -3.0, 0.0], [0.0; 4]] {
                let out = tree.evaluate(&input);
                assert_eq!(out.len(), 3);
                let total: f64 = out.iter().map(|v| v.exp()).sum();
                assert!((total - 1.0).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn single_leaf_passes_network_output_through() {
        let tree = tree(0, 5);
        assert!(tree.is_leaf());
        assert_eq!(tree.evaluate(&INPUT), tree.network.apply(&INPUT));
    }

    #[test]
    fn branch_output_is_the_weighted_mixture() {
        let tree = tree(1, 21);
        let weights: Vec<f64> = tree.network.apply(&INPUT).iter().map(|v| v.exp()).collect();
        let left: Vec<f64> = tree.children[0].evaluate(&INPUT).iter().map(|v| v.exp()).collect();
        let right: Vec<f64> = tree.children[1].evaluate(&INPUT).iter().map(|v| v.exp()).collect();
        let expected: Vec<f64> = (0..3)
            .map(|c| (weights[0] * left[c] + weights[1] * right[c]).ln())
            .collect();
        assert_close(&tree.evaluate(&INPUT), &expected, 1e-12);
    }

    #[test]
    fn supports_more_than_two_children() {
        let mut rng = StdRng::seed_from_u64(4);
        let children = (0..3)
            .map(|_| TreeNode::leaf(random_net(4, 2, &mut rng)))
            .collect();
        let tree = TreeNode::branch(random_net(4, 3, &mut rng), children);
        assert_eq!(tree.validate().expect("valid"), 2);
        let out = tree.evaluate(&INPUT);
        let total: f64 = out.iter().map(|v| v.exp()).sum();
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    #[should_panic(expected = "child node count must match network output size")]
    fn evaluate_panics_on_arity_mismatch() {
        let mut rng = StdRng::seed_from_u64(8);
        let tree = TreeNode::branch(
            random_net(4, 3, &mut rng),
            vec![TreeNode::leaf(random_net(4, 2, &mut rng))],
        );
        tree.evaluate(&INPUT);
    }

    #[test]
    fn validate_reports_structural_defects() {
        let mut rng = StdRng::seed_from_u64(9);
        let bad_arity = TreeNode::branch(
            random_net(4, 3, &mut rng),
            vec![TreeNode::leaf(random_net(4, 2, &mut rng))],
        );
        assert!(matches!(
            bad_arity.validate(),
            Err(StructureError::Arity { children: 1, outputs: 3, .. })
        ));

        let bad_classes = TreeNode::branch(
            random_net(4, 2, &mut rng),
            vec![
                TreeNode::leaf(random_net(4, 3, &mut rng)),
                TreeNode::leaf(random_net(4, 2, &mut rng)),
            ],
        );
        let err = bad_classes.validate().expect_err("expected class mismatch");
        assert_eq!(
            err,
            StructureError::ClassCount {
                path: vec![1],
                expected: 3,
                found: 2
            }
        );
    }

    #[test]
    fn graph_evaluation_matches_value_evaluation() {
        let tree = tree(2, 13);
        let expected = tree.evaluate(&INPUT);

        let mut tape = Tape::new();
        let x = tape.input(&INPUT);
        let out = tree.evaluate_graph(&mut tape, &x);
        assert_close(&tape.values(&out), &expected, 1e-12);

        let mut graph = DualGraph::new();
        let x = graph.input(&INPUT);
        let out = tree.evaluate_graph(&mut graph, &x);
        assert_close(&graph.values(&out), &expected, 1e-12);
    }

    #[test]
    fn parameters_follow_node_then_children_order() {
        let tree = tree(1, 17);
        let params = tree.parameters();
        assert_eq!(params.len(), 3 * 4);
        let own = tree.network.parameters();
        assert!(std::ptr::eq(params[0], own[0]));
        assert!(std::ptr::eq(params[4], tree.children[0].network.parameters()[0]));
        assert!(std::ptr::eq(params[8], tree.children[1].network.parameters()[0]));

        // Every node has a 4x8 + 8 hidden layer; the root adds 8x2 + 2 and
        // each leaf 8x3 + 3.
        assert_eq!(tree.parameter_count(), 3 * 40 + 18 + 2 * 27);

        let mut tree = tree;
        let ptrs: Vec<*const Parameter> = tree.parameters().into_iter().map(|p| p as *const _).collect();
        let mut_ptrs: Vec<*const Parameter> = tree
            .parameters_mut()
            .into_iter()
            .map(|p| p as *const _)
            .collect();
        assert_eq!(ptrs, mut_ptrs);
    }

    #[test]
    fn loss_gradient_matches_finite_differences() {
        let tree = tree(2, 23);
        let target = 1;
        let (loss, grads) = tree.loss_gradient(&INPUT, target).expect("gradient");
        assert!((loss + tree.evaluate(&INPUT)[target]).abs() < 1e-12);

        let h = 1e-6;
        // Probe a few entries spread over the root, a branch and a leaf.
        for (param_index, entry) in [(0usize, 3usize), (3, 1), (6, 5), (11, 2), (27, 0)] {
            let mut plus = tree.clone();
            plus.parameters_mut()[param_index].values[entry] += h;
            let mut minus = tree.clone();
            minus.parameters_mut()[param_index].values[entry] -= h;
            let numeric =
                (-plus.evaluate(&INPUT)[target] + minus.evaluate(&INPUT)[target]) / (2.0 * h);
            let analytic = grads[param_index][entry];
            assert!(
                (numeric - analytic).abs() < 1e-5,
                "param {param_index}[{entry}]: {analytic} vs {numeric}"
            );
        }
    }

    #[test]
    fn forward_and_reverse_mode_agree() {
        let tree = tree(2, 29);
        let target = 2;
        let (_, grads) = tree.loss_gradient(&INPUT, target).expect("gradient");

        let mut rng = StdRng::seed_from_u64(30);
        let direction: Vec<Vec<f64>> = tree
            .parameters()
            .iter()
            .map(|p| (0..p.len()).map(|_| rng.random_range(-1.0..1.0)).collect())
            .collect();
        let (values, tangents) = tree
            .evaluate_directional(&INPUT, &direction)
            .expect("directional derivative");

        assert_close(&values, &tree.evaluate(&INPUT), 1e-12);
        let dot: f64 = grads
            .iter()
            .flatten()
            .zip(direction.iter().flatten())
            .map(|(g, d)| g * d)
            .sum();
        assert!((-tangents[target] - dot).abs() < 1e-9);
    }

    #[test]
    fn loss_gradient_rejects_bad_arguments() {
        let tree = tree(1, 31);
        let err = tree.loss_gradient(&INPUT, 3).expect_err("target out of range");
        assert!(format!("{err}").contains("out of range"));
        let err = tree.loss_gradient(&[0.0; 2], 0).expect_err("input too short");
        assert!(format!("{err}").contains("Input dimension mismatch"));
    }

    #[test]
    fn encode_decode_round_trip() {
        let tree = tree(2, 37);
        let bytes = tree.encode().expect("encode");
        let registry = DecoderRegistry::with_default_network();
        let decoded = TreeNode::decode(&bytes, &registry).expect("decode");

        assert_eq!(decoded, tree);
        assert_eq!(decoded.node_count(), 7);
        assert_eq!(decoded.children.len(), 2);
        assert_eq!(decoded.children[1].children.len(), 2);
        assert_eq!(decoded.evaluate(&INPUT), tree.evaluate(&INPUT));
    }

    #[test]
    fn decode_rejects_empty_list() {
        let registry = DecoderRegistry::with_default_network();
        let bytes = encode_list(&[]).expect("encode");
        let err = TreeNode::decode(&bytes, &registry).expect_err("empty list");
        assert!(matches!(err, DecodeError::EmptyList));
    }

    #[test]
    fn decode_rejects_malformed_bytes() {
        let registry = DecoderRegistry::with_default_network();
        let tree = tree(1, 41);
        let bytes = tree.encode().expect("encode");
        for cut in [0, 1, bytes.len() / 2, bytes.len() - 1] {
            assert!(TreeNode::decode(&bytes[..cut], &registry).is_err());
        }
        assert!(TreeNode::decode(&[0xff; 12], &registry).is_err());
    }

    #[test]
    fn decode_rejects_misplaced_elements() {
        let registry = DecoderRegistry::with_default_network();
        let net = Network::mlp(4, 2, 2);
        let net_blob = TypedBlob::new(Network::TYPE_TAG, net.encode().expect("encode"));

        // A network where a child node belongs.
        let bytes = encode_list(&[net_blob.clone(), net_blob.clone()]).expect("encode");
        let err = TreeNode::decode(&bytes, &registry).expect_err("network in child slot");
        assert!(matches!(err, DecodeError::ExpectedNode { index: 0, .. }));

        // A node where the network belongs.
        let leaf = TreeNode::leaf(Network::mlp(4, 2, 2));
        let node_blob = TypedBlob::new(NODE_TYPE_TAG, leaf.encode().expect("encode"));
        let bytes = encode_list(&[node_blob]).expect("encode");
        let err = TreeNode::decode(&bytes, &registry).expect_err("node in network slot");
        assert!(matches!(err, DecodeError::UnknownNetworkTag(_)));
    }

    #[test]
    fn decode_rejects_inconsistent_structure() {
        let registry = DecoderRegistry::with_default_network();
        let tree = TreeNode::branch(
            Network::mlp(4, 2, 3),
            vec![TreeNode::leaf(Network::mlp(4, 2, 2))],
        );
        let bytes = tree.encode().expect("encode");
        let err = TreeNode::decode(&bytes, &registry).expect_err("arity mismatch");
        assert!(matches!(err, DecodeError::Structure(StructureError::Arity { .. })));
    }

    #[test]
    fn decode_rejects_excessive_nesting() {
        let registry = DecoderRegistry::with_default_network();
        let net_blob = TypedBlob::new(Network::TYPE_TAG, Network::mlp(1, 1, 1).encode().expect("encode"));
        let mut bytes = encode_list(&[net_blob.clone()]).expect("encode");
        for _ in 0..=MAX_DECODE_DEPTH {
            let child = TypedBlob::new(NODE_TYPE_TAG, bytes);
            bytes = encode_list(&[child, net_blob.clone()]).expect("encode");
        }
        let err = TreeNode::decode(&bytes, &registry).expect_err("too deep");
        assert!(matches!(err, DecodeError::TooDeep(_)));
    }

    #[test]
    fn decode_rejects_overflowing_layer_shape() {
        let registry = DecoderRegistry::with_default_network();
        let layer = DenseLayer {
            input_count: usize::MAX / 2 + 1,
            output_count: 2,
            weights: Parameter::zeros(0),
            biases: Parameter::zeros(2),
        };
        // Same wire layout as `Network`: layers, then the cached sizes.
        let payload = postcard::to_allocvec(&(vec![Layer::Dense(layer)], 0usize, 2usize))
            .expect("encode");
        let bytes = encode_list(&[TypedBlob::new(Network::TYPE_TAG, payload)]).expect("encode");
        let err = TreeNode::decode(&bytes, &registry).expect_err("overflowing shape");
        assert!(matches!(err, DecodeError::ParameterShape { layer: 0 }));
    }

    #[test]
    fn decode_rejects_corrupt_network_payload() {
        let registry = DecoderRegistry::with_default_network();
        let net = Network::new(vec![Layer::Dense(DenseLayer::new(4, 2)), Layer::LogSoftmax])
            .expect("valid network");
        let mut payload = net.encode().expect("encode");
        payload.truncate(payload.len() / 2);
        let bytes = encode_list(&[TypedBlob::new(Network::TYPE_TAG, payload)]).expect("encode");
        let err = TreeNode::decode(&bytes, &registry).expect_err("truncated payload");
        assert!(matches!(err, DecodeError::Decoding(_)));
    }
}
