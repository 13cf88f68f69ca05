//! The `neuraltree_core` crate implements differentiable decision trees: small
//! networks arranged as a tree whose output mixes the leaves' class
//! distributions, weighted by the branch probabilities along each path.
//!
//! Key components:
//! - **Traits**: `Scalar` (f64 or Dual), `Graph` (differentiable operations), `ScoringNetwork`.
//! - **Node**: `TreeNode`, the recursive forward pass in value and graph form.
//! - **Log-sum-exp**: the shared-shift combinator merging sibling branches.
//! - **Backends**: reverse-mode `Tape` and forward-mode `DualGraph`.
//! - **Codec**: typed-blob encoding with an explicit `DecoderRegistry`.
pub mod autodiff;
pub mod builder;
pub mod codec;
pub mod logsumexp;
pub mod network;
pub mod node;
pub mod tape;
pub mod training;
pub mod traits;

pub use builder::{build_binary_tree, TreeSettings};
pub use codec::{DecodeError, DecoderRegistry, EncodeError};
pub use network::{Network, Parameter};
pub use node::{StructureError, TreeNode};
pub use training::{sgd_step, SgdSettings};
