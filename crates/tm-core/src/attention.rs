//! Multi-head scaled dot-product attention over memory rows.
//!
//! Each head projects the query, keys and values through its own square
//! matrix (row · W), scores keys by `q·k / sqrt(d)`, softmaxes over the key
//! axis and mixes the projected values. Head outputs are concatenated and
//! projected back to `d` through one combined output matrix.

use crate::linalg::{self, Matrix};
use crate::params::AttentionParams;

/// Single-head attention for one query row.
fn attend_head(
    query: &[f64],
    keys: &[&[f64]],
    values: &[&[f64]],
    wq: &Matrix,
    wk: &Matrix,
    wv: &Matrix,
    scale: f64,
) -> Vec<f64> {
    let q = wq.vecmat(query);
    let scores: Vec<f64> = keys
        .iter()
        .map(|k| linalg::dot(&q, &wk.vecmat(k)) * scale)
        .collect();
    let weights = linalg::softmax(&scores);

    let mut out = vec![0.0; wv.cols];
    for (w, v) in weights.iter().zip(values) {
        let projected = wv.vecmat(v);
        for (o, p) in out.iter_mut().zip(&projected) {
            *o += w * p;
        }
    }
    out
}

/// Attend from `query` over `keys`/`values` (paired rows, all of length d).
///
/// Returns a vector of length d. With no keys the result is the output
/// projection of an all-zero concatenation, i.e. zeros.
pub fn multi_head_attention(
    params: &AttentionParams,
    query: &[f64],
    keys: &[&[f64]],
    values: &[&[f64]],
) -> Vec<f64> {
    debug_assert_eq!(keys.len(), values.len());
    let d = query.len();
    let scale = 1.0 / (d as f64).sqrt();

    let mut concat = Vec::with_capacity(params.num_heads() * d);
    for h in 0..params.num_heads() {
        concat.extend(attend_head(
            query,
            keys,
            values,
            &params.query[h],
            &params.key[h],
            &params.value[h],
            scale,
        ));
    }

    params.output.matvec(&concat)
}
