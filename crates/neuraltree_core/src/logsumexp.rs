//! Pairwise `log(exp(v1) + exp(v2))`.
//!
//! Both forms shift every entry by one scalar, the largest absolute value seen
//! in either vector. The shift is not per element: when the largest magnitude
//! is a large negative entry, all shifted exponentials can underflow to zero
//! and the result degrades to `-inf`.

use crate::traits::{Graph, Scalar};

fn max_abs(values: impl IntoIterator<Item = f64>) -> f64 {
    values.into_iter().map(f64::abs).fold(0.0, f64::max)
}

/// Value-only form, generic over the scalar so dual numbers flow through it.
pub fn log_sum_exp<T: Scalar>(v1: &[T], v2: &[T]) -> Vec<T> {
    assert_eq!(v1.len(), v2.len(), "log_sum_exp operands differ in length");
    let shift = max_abs(v1.iter().map(|v| v.real())).max(max_abs(v2.iter().map(|v| v.real())));
    let s = T::constant(shift);
    v1.iter()
        .zip(v2)
        .map(|(&a, &b)| ((a - s).exp() + (b - s).exp()).ln() + s)
        .collect()
}

/// Graph form: the same formula expressed in graph operations.
pub fn log_sum_exp_graph<'p, G: Graph<'p>>(graph: &mut G, v1: &G::Value, v2: &G::Value) -> G::Value {
    let shift = max_abs(graph.values(v1)).max(max_abs(graph.values(v2)));
    let shifted1 = graph.add_scalar(v1, -shift);
    let shifted2 = graph.add_scalar(v2, -shift);
    let exp1 = graph.exp(&shifted1);
    let exp2 = graph.exp(&shifted2);
    let sum = graph.add(&exp1, &exp2);
    let log = graph.ln(&sum);
    graph.add_scalar(&log, shift)
}
