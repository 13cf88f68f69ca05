//! Tree handle and the JavaScript-facing operations on it.

use anyhow::{bail, Result};
use js_sys::Float64Array;
use neuraltree_core::builder::{build_binary_tree, TreeSettings};
use neuraltree_core::codec::DecoderRegistry;
use neuraltree_core::network::Network;
use neuraltree_core::node::TreeNode;
use neuraltree_core::traits::ScoringNetwork;
use neuraltree_core::training::{sgd_step, SgdSettings};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use serde_wasm_bindgen::to_value;
use wasm_bindgen::prelude::*;

#[wasm_bindgen]
pub struct WasmTree {
    tree: TreeNode<Network>,
    class_count: usize,
}

/// Shape summary returned to JavaScript.
#[derive(Debug, Serialize)]
struct TreeSummary {
    depth: usize,
    nodes: usize,
    parameters: usize,
    input_size: usize,
    class_count: usize,
}

fn wrap(tree: TreeNode<Network>) -> Result<WasmTree> {
    let class_count = tree.validate()?;
    Ok(WasmTree { tree, class_count })
}

pub(crate) fn build_tree(settings: TreeSettings, seed: u64) -> Result<WasmTree> {
    let mut rng = StdRng::seed_from_u64(seed);
    wrap(build_binary_tree(settings, &mut rng)?)
}

pub(crate) fn decode_tree(bytes: &[u8]) -> Result<WasmTree> {
    let registry = DecoderRegistry::with_default_network();
    wrap(TreeNode::decode(bytes, &registry)?)
}

impl WasmTree {
    fn check_input(&self, input: &[f64]) -> Result<()> {
        let expected = self.tree.network.input_size();
        if input.len() != expected {
            bail!(
                "Input dimension mismatch. Expected {}, got {}.",
                expected,
                input.len()
            );
        }
        Ok(())
    }

    pub(crate) fn try_evaluate(&self, input: &[f64]) -> Result<Vec<f64>> {
        self.check_input(input)?;
        Ok(self.tree.evaluate(input))
    }

    pub(crate) fn flat_gradient(&self, input: &[f64], target: usize) -> Result<(f64, Vec<f64>)> {
        let (loss, grads) = self.tree.loss_gradient(input, target)?;
        Ok((loss, grads.concat()))
    }

    fn summary_payload(&self) -> TreeSummary {
        TreeSummary {
            depth: self.tree.depth(),
            nodes: self.tree.node_count(),
            parameters: self.tree.parameter_count(),
            input_size: self.tree.network.input_size(),
            class_count: self.class_count,
        }
    }
}

fn js_error(context: &str, err: anyhow::Error) -> JsValue {
    JsValue::from_str(&format!("{}: {}", context, err))
}

#[wasm_bindgen]
impl WasmTree {
    /// Builds a balanced binary tree with networks seeded from `seed`.
    #[wasm_bindgen(constructor)]
    pub fn new(
        depth: u32,
        input_size: u32,
        hidden_size: u32,
        class_count: u32,
        seed: u64,
    ) -> Result<WasmTree, JsValue> {
        console_error_panic_hook::set_once();

        let settings = TreeSettings {
            depth: depth as usize,
            input_size: input_size as usize,
            hidden_size: hidden_size as usize,
            class_count: class_count as usize,
        };
        build_tree(settings, seed).map_err(|e| js_error("Tree construction failed", e))
    }

    /// Restores a tree produced by `to_bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Result<WasmTree, JsValue> {
        console_error_panic_hook::set_once();
        decode_tree(bytes).map_err(|e| js_error("Tree decoding failed", e))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, JsValue> {
        self.tree
            .encode()
            .map_err(|e| JsValue::from_str(&format!("Tree encoding failed: {}", e)))
    }

    /// Class log-probabilities.
    pub fn evaluate(&self, input: &[f64]) -> Result<Vec<f64>, JsValue> {
        self.try_evaluate(input)
            .map_err(|e| js_error("Evaluation failed", e))
    }

    /// Class probabilities.
    pub fn probabilities(&self, input: &[f64]) -> Result<Vec<f64>, JsValue> {
        let log_probs = self.evaluate(input)?;
        Ok(log_probs.into_iter().map(f64::exp).collect())
    }

    /// Index of the most likely class.
    pub fn classify(&self, input: &[f64]) -> Result<u32, JsValue> {
        let log_probs = self.evaluate(input)?;
        let best = log_probs
            .iter()
            .enumerate()
            .fold((0, f64::NEG_INFINITY), |best, (i, &v)| {
                if v > best.1 {
                    (i, v)
                } else {
                    best
                }
            });
        Ok(best.0 as u32)
    }

    /// One gradient-descent step towards `target`; returns the loss before
    /// the update.
    pub fn train_step(&mut self, input: &[f64], target: u32, step_size: f64) -> Result<f64, JsValue> {
        let settings = SgdSettings { step_size };
        sgd_step(&mut self.tree, input, target as usize, settings)
            .map_err(|e| js_error("Training step failed", e))
    }

    /// Gradient of the negative log-likelihood, flattened in parameter order.
    pub fn loss_gradient(&self, input: &[f64], target: u32) -> Result<Float64Array, JsValue> {
        let (_, grad) = self
            .flat_gradient(input, target as usize)
            .map_err(|e| js_error("Gradient computation failed", e))?;
        Ok(Float64Array::from(grad.as_slice()))
    }

    pub fn summary(&self) -> Result<JsValue, JsValue> {
        to_value(&self.summary_payload())
            .map_err(|e| JsValue::from_str(&format!("Serialization error: {}", e)))
    }

    pub fn class_count(&self) -> u32 {
        self.class_count as u32
    }

    pub fn parameter_count(&self) -> u32 {
        self.tree.parameter_count() as u32
    }
}


#[cfg(all(test, target_arch = "wasm32"))]
mod wasm_tests {
    use super::WasmTree;
    use wasm_bindgen_test::wasm_bindgen_test;

    #[wasm_bindgen_test]
    fn from_bytes_rejects_garbage() {
        assert!(WasmTree::from_bytes(&[0xff; 8]).is_err());
    }

    #[wasm_bindgen_test]
    fn evaluate_rejects_wrong_input_length() {
        let tree = WasmTree::new(1, 4, 4, 2, 0).expect("tree");
        assert!(tree.evaluate(&[1.0, 2.0]).is_err());
    }

    #[wasm_bindgen_test]
    fn train_step_rejects_unknown_class() {
        let mut tree = WasmTree::new(1, 4, 4, 2, 0).expect("tree");
        assert!(tree.train_step(&[0.0; 4], 5, 0.1).is_err());
    }

    #[wasm_bindgen_test]
    fn loss_gradient_matches_parameter_count() {
        let tree = WasmTree::new(1, 4, 4, 2, 0).expect("tree");
        let grad = tree.loss_gradient(&[0.1; 4], 0).expect("gradient");
        assert_eq!(grad.length(), tree.parameter_count());
    }
}
