//! WASM bridge exposing differentiable decision trees to JavaScript.

mod tree;

pub use tree::WasmTree;
