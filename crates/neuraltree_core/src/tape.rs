use crate::network::{log_softmax, Parameter};
use crate::traits::Graph;
use nalgebra::{DMatrix, DVector};
use std::collections::HashMap;
use std::marker::PhantomData;

/// Handle to a value recorded on a `Tape`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Var(usize);

#[derive(Debug, Clone, Copy)]
enum Op {
    Leaf,
    Slice { src: Var, start: usize },
    Add(Var, Var),
    AddFirst { vector: Var, scalar: Var },
    AddScalar(Var),
    Exp(Var),
    Ln(Var),
    MatVec {
        weights: Var,
        input: Var,
        rows: usize,
        cols: usize,
    },
    Tanh(Var),
    LogSoftmax(Var),
}

#[derive(Debug)]
struct TapeNode {
    value: DVector<f64>,
    op: Op,
}

/// Reverse-mode computation graph.
///
/// Operations are appended in evaluation order, so the tape is already
/// topologically sorted and `backward` is a single reverse sweep.
/// The tape borrows every parameter it records for `'p`; parameters can only
/// be updated once the tape (and its `Gradients`) are gone.
#[derive(Debug)]
pub struct Tape<'p> {
    nodes: Vec<TapeNode>,
    params: HashMap<*const Parameter, Var>,
    _params: PhantomData<&'p Parameter>,
}

impl<'p> Tape<'p> {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            params: HashMap::new(),
            _params: PhantomData,
        }
    }

    /// Number of recorded operations, leaves included.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn value(&self, var: Var) -> &DVector<f64> {
        &self.nodes[var.0].value
    }

    fn push(&mut self, value: DVector<f64>, op: Op) -> Var {
        self.nodes.push(TapeNode { value, op });
        Var(self.nodes.len() - 1)
    }

    /// Propagates `seed` (the gradient of some scalar objective with respect
    /// to `output`) back to every recorded parameter.
    pub fn backward(&self, output: Var, seed: &[f64]) -> Gradients<'p> {
        assert_eq!(
            seed.len(),
            self.nodes[output.0].value.len(),
            "seed length must match output length"
        );

        let mut adjoints: Vec<Option<DVector<f64>>> = vec![None; self.nodes.len()];
        adjoints[output.0] = Some(DVector::from_column_slice(seed));

        for index in (0..=output.0).rev() {
            let Some(adj) = adjoints[index].take() else {
                continue;
            };
            let node = &self.nodes[index];
            match node.op {
                Op::Leaf => {
                    // Final: every consumer sits later on the tape.
                    adjoints[index] = Some(adj);
                }
                Op::Slice { src, start } => {
                    let mut delta = DVector::zeros(self.nodes[src.0].value.len());
                    delta.rows_mut(start, adj.len()).copy_from(&adj);
                    accumulate(&mut adjoints, src, delta);
                }
                Op::Add(a, b) => {
                    accumulate(&mut adjoints, a, adj.clone());
                    accumulate(&mut adjoints, b, adj);
                }
                Op::AddFirst { vector, scalar } => {
                    let mut delta = DVector::zeros(self.nodes[scalar.0].value.len());
                    delta[0] = adj.sum();
                    accumulate(&mut adjoints, scalar, delta);
                    accumulate(&mut adjoints, vector, adj);
                }
                Op::AddScalar(src) => accumulate(&mut adjoints, src, adj),
                Op::Exp(src) => {
                    let delta = adj.component_mul(&node.value);
                    accumulate(&mut adjoints, src, delta);
                }
                Op::Ln(src) => {
                    let delta = adj.component_div(&self.nodes[src.0].value);
                    accumulate(&mut adjoints, src, delta);
                }
                Op::MatVec {
                    weights,
                    input,
                    rows,
                    cols,
                } => {
                    let w = DMatrix::from_column_slice(
                        rows,
                        cols,
                        self.nodes[weights.0].value.as_slice(),
                    );
                    let x = &self.nodes[input.0].value;
                    let grad_w = &adj * x.transpose();
                    let grad_x = w.tr_mul(&adj);
                    accumulate(
                        &mut adjoints,
                        weights,
                        DVector::from_column_slice(grad_w.as_slice()),
                    );
                    accumulate(&mut adjoints, input, grad_x);
                }
                Op::Tanh(src) => {
                    let delta = adj.component_mul(&node.value.map(|t| 1.0 - t * t));
                    accumulate(&mut adjoints, src, delta);
                }
                Op::LogSoftmax(src) => {
                    let softmax = node.value.map(f64::exp);
                    let delta = &adj - softmax * adj.sum();
                    accumulate(&mut adjoints, src, delta);
                }
            }
        }

        let by_param = self
            .params
            .iter()
            .map(|(&ptr, &var)| {
                let grad = adjoints[var.0]
                    .take()
                    .unwrap_or_else(|| DVector::zeros(self.nodes[var.0].value.len()));
                (ptr, grad)
            })
            .collect();

        Gradients {
            by_param,
            _params: PhantomData,
        }
    }
}

impl Default for Tape<'_> {
    fn default() -> Self {
        Self::new()
    }
}

fn accumulate(adjoints: &mut [Option<DVector<f64>>], var: Var, delta: DVector<f64>) {
    if let Some(existing) = adjoints[var.0].as_mut() {
        *existing += delta;
    } else {
        adjoints[var.0] = Some(delta);
    }
}

impl<'p> Graph<'p> for Tape<'p> {
    type Value = Var;

    fn input(&mut self, values: &[f64]) -> Var {
        self.push(DVector::from_column_slice(values), Op::Leaf)
    }

    fn parameter(&mut self, param: &'p Parameter) -> Var {
        let key = param as *const Parameter;
        if let Some(&var) = self.params.get(&key) {
            return var;
        }
        let var = self.push(DVector::from_column_slice(&param.values), Op::Leaf);
        self.params.insert(key, var);
        var
    }

    fn values(&self, value: &Var) -> Vec<f64> {
        self.value(*value).as_slice().to_vec()
    }

    fn len(&self, value: &Var) -> usize {
        self.value(*value).len()
    }

    fn slice(&mut self, value: &Var, start: usize, end: usize) -> Var {
        let sliced = self.value(*value).rows(start, end - start).into_owned();
        self.push(sliced, Op::Slice { src: *value, start })
    }

    fn add(&mut self, a: &Var, b: &Var) -> Var {
        let sum = self.value(*a) + self.value(*b);
        self.push(sum, Op::Add(*a, *b))
    }

    fn add_first(&mut self, vector: &Var, scalar: &Var) -> Var {
        let s = self.value(*scalar)[0];
        let out = self.value(*vector).add_scalar(s);
        self.push(
            out,
            Op::AddFirst {
                vector: *vector,
                scalar: *scalar,
            },
        )
    }

    fn add_scalar(&mut self, value: &Var, constant: f64) -> Var {
        let out = self.value(*value).add_scalar(constant);
        self.push(out, Op::AddScalar(*value))
    }

    fn exp(&mut self, value: &Var) -> Var {
        let out = self.value(*value).map(f64::exp);
        self.push(out, Op::Exp(*value))
    }

    fn ln(&mut self, value: &Var) -> Var {
        let out = self.value(*value).map(f64::ln);
        self.push(out, Op::Ln(*value))
    }

    fn mat_vec(&mut self, weights: &Var, rows: usize, cols: usize, input: &Var) -> Var {
        let w = DMatrix::from_column_slice(rows, cols, self.value(*weights).as_slice());
        let out = w * self.value(*input);
        self.push(
            out,
            Op::MatVec {
                weights: *weights,
                input: *input,
                rows,
                cols,
            },
        )
    }

    fn tanh(&mut self, value: &Var) -> Var {
        let out = self.value(*value).map(f64::tanh);
        self.push(out, Op::Tanh(*value))
    }

    fn log_softmax(&mut self, value: &Var) -> Var {
        let out = DVector::from_vec(log_softmax(self.value(*value).as_slice()));
        self.push(out, Op::LogSoftmax(*value))
    }
}

/// Gradients of one backward pass, keyed by parameter identity.
#[derive(Debug)]
pub struct Gradients<'p> {
    by_param: HashMap<*const Parameter, DVector<f64>>,
    _params: PhantomData<&'p Parameter>,
}

impl Gradients<'_> {
    pub fn wrt(&self, param: &Parameter) -> Option<&[f64]> {
        self.by_param
            .get(&(param as *const Parameter))
            .map(|g| g.as_slice())
    }

    /// Gradients aligned with `params`. Parameters never touched by the
    /// recorded computation get zeros.
    pub fn ordered(&self, params: &[&Parameter]) -> Vec<Vec<f64>> {
        params
            .iter()
            .map(|p| match self.wrt(p) {
                Some(grad) => grad.to_vec(),
                None => vec![0.0; p.len()],
            })
            .collect()
    }
}
