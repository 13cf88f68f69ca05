use crate::network::Network;
use crate::node::TreeNode;
use crate::traits::ScoringNetwork;
use anyhow::{bail, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Deepest tree `build_binary_tree` accepts; node count grows as `2^(depth + 1) - 1`.
pub const MAX_DEPTH: usize = 16;

/// Shape of a balanced binary tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeSettings {
    /// Number of branch layers; 0 builds a single leaf.
    pub depth: usize,
    pub input_size: usize,
    pub hidden_size: usize,
    pub class_count: usize,
}

impl Default for TreeSettings {
    fn default() -> Self {
        Self {
            depth: 2,
            input_size: 4,
            hidden_size: 8,
            class_count: 3,
        }
    }
}

impl TreeSettings {
    pub fn validate(&self) -> Result<()> {
        if self.depth > MAX_DEPTH {
            bail!("depth must be at most {}, got {}.", MAX_DEPTH, self.depth);
        }
        if self.input_size == 0 {
            bail!("input_size must be greater than zero.");
        }
        if self.hidden_size == 0 {
            bail!("hidden_size must be greater than zero.");
        }
        if self.class_count == 0 {
            bail!("class_count must be greater than zero.");
        }
        Ok(())
    }
}

/// Builds a balanced binary tree of `settings.depth` branch layers.
///
/// Every node gets its own independently randomized
/// dense → tanh → dense → log-softmax network, with 2 outputs at branches and
/// `class_count` outputs at leaves.
pub fn build_binary_tree<R: Rng + ?Sized>(settings: TreeSettings, rng: &mut R) -> Result<TreeNode> {
    settings.validate()?;
    let tree = build_node(&settings, settings.depth, rng);
    debug!(
        depth = settings.depth,
        nodes = tree.node_count(),
        parameters = tree.parameter_count(),
        "Built binary tree"
    );
    Ok(tree)
}

fn build_node<R: Rng + ?Sized>(settings: &TreeSettings, depth: usize, rng: &mut R) -> TreeNode {
    if depth == 0 {
        let mut net = Network::mlp(settings.input_size, settings.hidden_size, settings.class_count);
        net.randomize(rng);
        return TreeNode::leaf(net);
    }

    let mut net = Network::mlp(settings.input_size, settings.hidden_size, 2);
    net.randomize(rng);
    let children = vec![
        build_node(settings, depth - 1, rng),
        build_node(settings, depth - 1, rng),
    ];
    TreeNode::branch(net, children)
}
