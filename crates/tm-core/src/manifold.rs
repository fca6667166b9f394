//! Geodesic steps on the unit hypersphere.
//!
//! `base` is a point on S^(n-1) and `velocity` an arbitrary direction. The
//! velocity is projected onto the tangent space at `base`, clamped to
//! `max_step_size` radians, and followed along the great circle. With the
//! manifold disabled the step is plain vector addition.

use crate::constants::RENORM_EPSILON;
use crate::error::{ModelError, Result};
use crate::linalg;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ManifoldOptions {
    pub use_manifold: bool,
    pub max_step_size: f64,
    pub tangent_epsilon: f64,
}

/// Move `base` by `velocity`, either on the sphere or in flat space.
///
/// Pure: no state, no parameters. Output has the same length as `base`.
/// When `base` is unit-norm and the manifold is enabled, the result is
/// unit-norm within floating-point tolerance.
pub fn manifold_step(
    base: &[f64],
    velocity: &[f64],
    opts: &ManifoldOptions,
) -> Result<Vec<f64>> {
    ModelError::check_len("velocity", base.len(), velocity.len())?;

    if !opts.use_manifold {
        return Ok(linalg::add(base, velocity));
    }

    // Tangent projection: strip the radial component.
    let radial = linalg::scale(base, linalg::dot(base, velocity));
    let tangent = linalg::sub(velocity, &radial);

    let tnorm = linalg::norm(&tangent);
    if tnorm < opts.tangent_epsilon {
        return Ok(base.to_vec());
    }

    let step = tnorm.min(opts.max_step_size);
    let (sin, cos) = step.sin_cos();

    let result: Vec<f64> = base
        .iter()
        .zip(&tangent)
        .map(|(b, t)| b * cos + (t / tnorm) * sin)
        .collect();

    let n = linalg::norm(&result) + RENORM_EPSILON;
    Ok(result.into_iter().map(|r| r / n).collect())
}

/// Angle in radians between two nonzero vectors. Range: [0, π].
pub fn angular_distance(a: &[f64], b: &[f64]) -> f64 {
    let denom = linalg::norm(a) * linalg::norm(b);
    if denom == 0.0 {
        return 0.0;
    }
    (linalg::dot(a, b) / denom).clamp(-1.0, 1.0).acos()
}
