use crate::network::{log_softmax, mat_vec, Parameter};
use crate::traits::{Graph, Scalar};
use anyhow::{bail, Result};
use num_traits::{Num, One, Zero};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::ops::{Add, AddAssign, Div, Mul, Neg, Rem, Sub};

/// Dual number `val + eps·ε` with `ε² = 0`; `eps` carries the derivative
/// along the direction the graph was seeded with.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Dual {
    pub val: f64,
    pub eps: f64,
}

impl Dual {
    pub fn new(val: f64, eps: f64) -> Self {
        Self { val, eps }
    }
}

impl Zero for Dual {
    fn zero() -> Self {
        Self::new(0.0, 0.0)
    }
    fn is_zero(&self) -> bool {
        self.val == 0.0 && self.eps == 0.0
    }
}

impl One for Dual {
    fn one() -> Self {
        Self::new(1.0, 0.0)
    }
}

impl Add for Dual {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self::new(self.val + rhs.val, self.eps + rhs.eps)
    }
}

impl Sub for Dual {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self::new(self.val - rhs.val, self.eps - rhs.eps)
    }
}

impl Mul for Dual {
    type Output = Self;
    fn mul(self, rhs: Self) -> Self {
        Self::new(self.val * rhs.val, self.val * rhs.eps + self.eps * rhs.val)
    }
}

impl Div for Dual {
    type Output = Self;
    fn div(self, rhs: Self) -> Self {
        let denom = rhs.val * rhs.val;
        Self::new(
            self.val / rhs.val,
            (self.eps * rhs.val - self.val * rhs.eps) / denom,
        )
    }
}

impl Neg for Dual {
    type Output = Self;
    fn neg(self) -> Self {
        Self::new(-self.val, -self.eps)
    }
}

impl Rem for Dual {
    type Output = Self;
    fn rem(self, rhs: Self) -> Self {
        // Piecewise constant offset, so the tangent passes through unchanged.
        Self::new(self.val % rhs.val, self.eps)
    }
}

impl AddAssign for Dual {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Num for Dual {
    type FromStrRadixErr = ();
    fn from_str_radix(str: &str, radix: u32) -> Result<Self, Self::FromStrRadixErr> {
        f64::from_str_radix(str, radix)
            .map(|v| Self::new(v, 0.0))
            .map_err(|_| ())
    }
}

impl Scalar for Dual {
    fn constant(value: f64) -> Self {
        Self::new(value, 0.0)
    }

    fn real(self) -> f64 {
        self.val
    }

    fn exp(self) -> Self {
        let e = self.val.exp();
        Self::new(e, e * self.eps)
    }

    fn ln(self) -> Self {
        Self::new(self.val.ln(), self.eps / self.val)
    }

    fn tanh(self) -> Self {
        let t = self.val.tanh();
        Self::new(t, self.eps * (1.0 - t * t))
    }

    fn abs(self) -> Self {
        Self::new(
            self.val.abs(),
            if self.val >= 0.0 { self.eps } else { -self.eps },
        )
    }
}

// --- Forward-mode graph ---

/// Forward-mode graph: every value carries its directional derivative along a
/// fixed direction in parameter space.
///
/// Parameters without an assigned direction have a zero tangent.
pub struct DualGraph<'p> {
    directions: HashMap<*const Parameter, Vec<f64>>,
    _params: PhantomData<&'p Parameter>,
}

impl<'p> DualGraph<'p> {
    /// A graph with every parameter tangent set to zero.
    pub fn new() -> Self {
        Self {
            directions: HashMap::new(),
            _params: PhantomData,
        }
    }

    /// A graph differentiating along the given per-parameter directions.
    pub fn along<I>(directions: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'p Parameter, Vec<f64>)>,
    {
        let mut graph = Self::new();
        for (param, direction) in directions {
            if direction.len() != param.len() {
                bail!(
                    "Direction length mismatch. Expected {}, got {}.",
                    param.len(),
                    direction.len()
                );
            }
            graph
                .directions
                .insert(param as *const Parameter, direction);
        }
        Ok(graph)
    }

    /// Tangent parts of a value.
    pub fn tangents(&self, value: &[Dual]) -> Vec<f64> {
        value.iter().map(|d| d.eps).collect()
    }
}

impl Default for DualGraph<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'p> Graph<'p> for DualGraph<'p> {
    type Value = Vec<Dual>;

    fn input(&mut self, values: &[f64]) -> Self::Value {
        values.iter().map(|&v| Dual::constant(v)).collect()
    }

    fn parameter(&mut self, param: &'p Parameter) -> Self::Value {
        match self.directions.get(&(param as *const Parameter)) {
            Some(direction) => param
                .values
                .iter()
                .zip(direction)
                .map(|(&v, &d)| Dual::new(v, d))
                .collect(),
            None => self.input(&param.values),
        }
    }

    fn values(&self, value: &Self::Value) -> Vec<f64> {
        value.iter().map(|d| d.val).collect()
    }

    fn len(&self, value: &Self::Value) -> usize {
        value.len()
    }

    fn slice(&mut self, value: &Self::Value, start: usize, end: usize) -> Self::Value {
        value[start..end].to_vec()
    }

    fn add(&mut self, a: &Self::Value, b: &Self::Value) -> Self::Value {
        assert_eq!(a.len(), b.len(), "added values must have equal length");
        a.iter().zip(b).map(|(&x, &y)| x + y).collect()
    }

    fn add_first(&mut self, vector: &Self::Value, scalar: &Self::Value) -> Self::Value {
        let s = scalar[0];
        vector.iter().map(|&x| x + s).collect()
    }

    fn add_scalar(&mut self, value: &Self::Value, constant: f64) -> Self::Value {
        let c = Dual::constant(constant);
        value.iter().map(|&x| x + c).collect()
    }

    fn exp(&mut self, value: &Self::Value) -> Self::Value {
        value.iter().map(|&x| x.exp()).collect()
    }

    fn ln(&mut self, value: &Self::Value) -> Self::Value {
        value.iter().map(|&x| x.ln()).collect()
    }

    fn mat_vec(
        &mut self,
        weights: &Self::Value,
        rows: usize,
        cols: usize,
        input: &Self::Value,
    ) -> Self::Value {
        mat_vec(weights, rows, cols, input)
    }

    fn tanh(&mut self, value: &Self::Value) -> Self::Value {
        value.iter().map(|&x| x.tanh()).collect()
    }

    fn log_softmax(&mut self, value: &Self::Value) -> Self::Value {
        log_softmax(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dual_tanh_matches_derivative() {
        let x = Dual::new(0.3, 1.0);
        let y = x.tanh();
        let t = 0.3f64.tanh();
        assert!((y.val - t).abs() < 1e-15);
        assert!((y.eps - (1.0 - t * t)).abs() < 1e-15);
    }

    #[test]
    fn dual_exp_ln_chain_is_identity() {
        let x = Dual::new(1.7, 2.0);
        let y = x.exp().ln();
        assert!((y.val - 1.7).abs() < 1e-12);
        assert!((y.eps - 2.0).abs() < 1e-12);
    }

    #[test]
    fn dual_abs_flips_tangent_for_negative_values() {
        let y = Dual::new(-2.0, 0.5).abs();
        assert_eq!(y, Dual::new(2.0, -0.5));
    }

    #[test]
    fn along_rejects_mismatched_direction() {
        let param = Parameter::new(vec![1.0, 2.0]);
        let result = DualGraph::along([(&param, vec![1.0])]);
        let err = result.err().expect("expected length error");
        assert!(format!("{err}").contains("Direction length mismatch"));
    }

    #[test]
    fn parameter_carries_assigned_direction() {
        let param = Parameter::new(vec![1.0, 2.0]);
        let other = Parameter::new(vec![3.0]);
        let mut graph = DualGraph::along([(&param, vec![0.5, -1.0])]).expect("graph");
        let value = graph.parameter(&param);
        assert_eq!(graph.tangents(&value), vec![0.5, -1.0]);
        let untouched = graph.parameter(&other);
        assert_eq!(graph.tangents(&untouched), vec![0.0]);
    }
}
