use crate::codec::EncodeError;
use crate::network::Parameter;
use num_traits::Num;
use rand::Rng;
use std::fmt::Debug;
use std::ops::Neg;

/// A trait for types that can flow through the value-only evaluation paths.
/// Implemented by `f64` and by the forward-mode `Dual` number.
pub trait Scalar: Copy + Num + Neg<Output = Self> + PartialOrd + Debug + 'static {
    /// Lifts a plain constant (zero derivative).
    fn constant(value: f64) -> Self;
    /// The real part, with any derivative information dropped.
    fn real(self) -> f64;
    fn exp(self) -> Self;
    fn ln(self) -> Self;
    fn tanh(self) -> Self;
    fn abs(self) -> Self;
}

impl Scalar for f64 {
    fn constant(value: f64) -> Self {
        value
    }
    fn real(self) -> f64 {
        self
    }
    fn exp(self) -> Self {
        f64::exp(self)
    }
    fn ln(self) -> Self {
        f64::ln(self)
    }
    fn tanh(self) -> Self {
        f64::tanh(self)
    }
    fn abs(self) -> Self {
        f64::abs(self)
    }
}

/// A differentiable computation graph.
///
/// The tree never derives gradients itself; both its forward pass and the
/// log-sum-exp combinator are written purely in terms of these operations, so
/// swapping the backend (reverse-mode `Tape`, forward-mode `DualGraph`) leaves
/// the tree algorithm untouched.
///
/// `'p` is the lifetime of the parameters the graph reads from. Backends that
/// record parameters keep them borrowed until the graph is dropped.
pub trait Graph<'p> {
    /// Handle to an intermediate vector value.
    type Value: Clone;

    /// Introduces a constant input vector.
    fn input(&mut self, values: &[f64]) -> Self::Value;

    /// Introduces a trainable parameter. Repeated calls with the same
    /// parameter must refer to the same underlying variable.
    fn parameter(&mut self, param: &'p Parameter) -> Self::Value;

    /// Plain values of a graph value.
    fn values(&self, value: &Self::Value) -> Vec<f64>;

    /// Number of entries in a graph value.
    fn len(&self, value: &Self::Value) -> usize;

    /// Entries `start..end`.
    fn slice(&mut self, value: &Self::Value, start: usize, end: usize) -> Self::Value;

    /// Elementwise sum of two equally sized values.
    fn add(&mut self, a: &Self::Value, b: &Self::Value) -> Self::Value;

    /// Adds the first entry of `scalar` to every entry of `vector`.
    fn add_first(&mut self, vector: &Self::Value, scalar: &Self::Value) -> Self::Value;

    /// Adds a constant to every entry.
    fn add_scalar(&mut self, value: &Self::Value, constant: f64) -> Self::Value;

    fn exp(&mut self, value: &Self::Value) -> Self::Value;

    fn ln(&mut self, value: &Self::Value) -> Self::Value;

    /// Marks a value that feeds several downstream operations. Backends that
    /// accumulate adjoints per node get this for free.
    fn pool(&mut self, value: &Self::Value) -> Self::Value {
        value.clone()
    }

    /// `weights * input` for a column-major `rows x cols` weight matrix.
    fn mat_vec(
        &mut self,
        weights: &Self::Value,
        rows: usize,
        cols: usize,
        input: &Self::Value,
    ) -> Self::Value;

    fn tanh(&mut self, value: &Self::Value) -> Self::Value;

    fn log_softmax(&mut self, value: &Self::Value) -> Self::Value;
}

/// A small network scoring a node: class log-probabilities at a leaf,
/// child log-probabilities at a branch.
pub trait ScoringNetwork {
    /// Tag identifying the concrete network in the persisted encoding.
    fn type_tag(&self) -> &'static str;

    fn input_size(&self) -> usize;

    fn output_size(&self) -> usize;

    /// Value-only forward pass.
    fn apply(&self, input: &[f64]) -> Vec<f64>;

    /// Forward pass recorded on a computation graph.
    fn apply_graph<'p, G: Graph<'p>>(&'p self, graph: &mut G, input: &G::Value) -> G::Value;

    fn parameters(&self) -> Vec<&Parameter>;

    fn parameters_mut(&mut self) -> Vec<&mut Parameter>;

    /// Re-draws every parameter.
    fn randomize<R: Rng + ?Sized>(&mut self, rng: &mut R);

    /// Self-describing payload, decoded again through a `DecoderRegistry`.
    fn encode(&self) -> Result<Vec<u8>, EncodeError>;
}
