//! The default scoring network: a stack of dense layers and elementwise
//! nonlinearities, usually closed by a log-softmax.

use crate::codec::{DecodeError, EncodeError};
use crate::traits::{Graph, Scalar, ScoringNetwork};
use nalgebra::{DMatrix, DVector};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// A trainable buffer of scalars owned by a network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub values: Vec<f64>,
}

impl Parameter {
    pub fn new(values: Vec<f64>) -> Self {
        Self { values }
    }

    pub fn zeros(len: usize) -> Self {
        Self::new(vec![0.0; len])
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Fully connected layer. `weights` is a column-major
/// `output_count x input_count` matrix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenseLayer {
    pub input_count: usize,
    pub output_count: usize,
    pub weights: Parameter,
    pub biases: Parameter,
}

impl DenseLayer {
    pub fn new(input_count: usize, output_count: usize) -> Self {
        Self {
            input_count,
            output_count,
            weights: Parameter::zeros(input_count * output_count),
            biases: Parameter::zeros(output_count),
        }
    }

    fn apply(&self, input: &[f64]) -> Vec<f64> {
        let w = DMatrix::from_column_slice(self.output_count, self.input_count, &self.weights.values);
        let x = DVector::from_column_slice(input);
        let b = DVector::from_column_slice(&self.biases.values);
        (w * x + b).as_slice().to_vec()
    }

    fn randomize<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        let scale = 1.0 / (self.input_count.max(1) as f64).sqrt();
        for w in self
            .weights
            .values
            .iter_mut()
            .chain(self.biases.values.iter_mut())
        {
            *w = rng.random_range(-scale..scale);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Layer {
    Dense(DenseLayer),
    Tanh,
    LogSoftmax,
}

/// Sequential network of `Layer`s.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Network {
    layers: Vec<Layer>,
    input_size: usize,
    output_size: usize,
}

impl Network {
    pub const TYPE_TAG: &'static str = "neuraltree.Network";

    /// Builds a network, checking that consecutive dense layers agree on
    /// their sizes and that the parameter buffers have the declared shapes.
    pub fn new(layers: Vec<Layer>) -> Result<Self, DecodeError> {
        let mut input_size = None;
        let mut size = None;
        for (index, layer) in layers.iter().enumerate() {
            if let Layer::Dense(dense) = layer {
                let weight_count = dense.input_count.checked_mul(dense.output_count);
                if weight_count != Some(dense.weights.len())
                    || dense.biases.len() != dense.output_count
                {
                    return Err(DecodeError::ParameterShape { layer: index });
                }
                if let Some(current) = size {
                    if current != dense.input_count {
                        return Err(DecodeError::LayerSize {
                            layer: index,
                            expected: current,
                            found: dense.input_count,
                        });
                    }
                }
                input_size.get_or_insert(dense.input_count);
                size = Some(dense.output_count);
            }
        }
        match (input_size, size) {
            (Some(input_size), Some(output_size)) => Ok(Self {
                layers,
                input_size,
                output_size,
            }),
            _ => Err(DecodeError::NoDenseLayer),
        }
    }

    /// dense(input → hidden), tanh, dense(hidden → output), log-softmax.
    /// Parameters start at zero; call `randomize` before training.
    pub fn mlp(input_size: usize, hidden_size: usize, output_size: usize) -> Self {
        Self {
            layers: vec![
                Layer::Dense(DenseLayer::new(input_size, hidden_size)),
                Layer::Tanh,
                Layer::Dense(DenseLayer::new(hidden_size, output_size)),
                Layer::LogSoftmax,
            ],
            input_size,
            output_size,
        }
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    /// Decoder for the registry entry under `Network::TYPE_TAG`.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let decoded: Network = postcard::from_bytes(bytes)?;
        // Re-derive the cached sizes rather than trusting the payload.
        Network::new(decoded.layers)
    }
}

impl ScoringNetwork for Network {
    fn type_tag(&self) -> &'static str {
        Self::TYPE_TAG
    }

    fn input_size(&self) -> usize {
        self.input_size
    }

    fn output_size(&self) -> usize {
        self.output_size
    }

    fn apply(&self, input: &[f64]) -> Vec<f64> {
        assert_eq!(
            input.len(),
            self.input_size,
            "network input size mismatch"
        );
        let mut x = input.to_vec();
        for layer in &self.layers {
            x = match layer {
                Layer::Dense(dense) => dense.apply(&x),
                Layer::Tanh => x.iter().map(|v| v.tanh()).collect(),
                Layer::LogSoftmax => log_softmax(&x),
            };
        }
        x
    }

    fn apply_graph<'p, G: Graph<'p>>(&'p self, graph: &mut G, input: &G::Value) -> G::Value {
        let mut x = input.clone();
        for layer in &self.layers {
            x = match layer {
                Layer::Dense(dense) => {
                    let w = graph.parameter(&dense.weights);
                    let b = graph.parameter(&dense.biases);
                    let wx = graph.mat_vec(&w, dense.output_count, dense.input_count, &x);
                    graph.add(&wx, &b)
                }
                Layer::Tanh => graph.tanh(&x),
                Layer::LogSoftmax => graph.log_softmax(&x),
            };
        }
        x
    }

    fn parameters(&self) -> Vec<&Parameter> {
        let mut res = Vec::new();
        for layer in &self.layers {
            if let Layer::Dense(dense) = layer {
                res.push(&dense.weights);
                res.push(&dense.biases);
            }
        }
        res
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        let mut res = Vec::new();
        for layer in &mut self.layers {
            if let Layer::Dense(dense) = layer {
                res.push(&mut dense.weights);
                res.push(&mut dense.biases);
            }
        }
        res
    }

    fn randomize<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        for layer in &mut self.layers {
            if let Layer::Dense(dense) = layer {
                dense.randomize(rng);
            }
        }
    }

    fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        Ok(postcard::to_allocvec(self)?)
    }
}

/// `weights * input` for a column-major `rows x cols` matrix.
pub(crate) fn mat_vec<T: Scalar>(weights: &[T], rows: usize, cols: usize, input: &[T]) -> Vec<T> {
    assert_eq!(weights.len(), rows * cols, "weight buffer shape mismatch");
    assert_eq!(input.len(), cols, "mat_vec input size mismatch");
    (0..rows)
        .map(|r| {
            (0..cols).fold(T::zero(), |acc, c| acc + weights[c * rows + r] * input[c])
        })
        .collect()
}

/// Normalises `values` into log-probabilities, shifting by the maximum so the
/// exponentials cannot overflow.
pub(crate) fn log_softmax<T: Scalar>(values: &[T]) -> Vec<T> {
    let max = values
        .iter()
        .map(|v| v.real())
        .fold(f64::NEG_INFINITY, f64::max);
    let shift = T::constant(max);
    let sum = values
        .iter()
        .fold(T::zero(), |acc, &v| acc + (v - shift).exp());
    let log_norm = sum.ln() + shift;
    values.iter().map(|&v| v - log_norm).collect()
}
