//! Adam over the optimized parameter group.
//!
//! One moment buffer per tensor, a single shared step counter, bias
//! correction by that counter. Attention and memory-bank parameters never
//! pass through here.

use crate::constants::{ADAM_BETA1, ADAM_BETA2, ADAM_EPSILON};
use crate::params::OptimizedParams;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AdamConfig {
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            beta1: ADAM_BETA1,
            beta2: ADAM_BETA2,
            eps: ADAM_EPSILON,
        }
    }
}

#[derive(Clone, Debug)]
struct MomentBuf {
    m: Vec<f64>,
    v: Vec<f64>,
}

impl MomentBuf {
    fn zeros(n: usize) -> Self {
        Self {
            m: vec![0.0; n],
            v: vec![0.0; n],
        }
    }
}

/// Adam state. Buffer order: w1, b1, w2, b2, forget_gate.
#[derive(Clone, Debug)]
pub struct Adam {
    pub config: AdamConfig,
    bufs: Vec<MomentBuf>,
    step: u64,
}

#[allow(clippy::too_many_arguments)]
#[inline]
fn adam_step_buf(
    params: &mut [f64],
    grads: &[f64],
    buf: &mut MomentBuf,
    lr: f64,
    c: &AdamConfig,
    bc1_inv: f64,
    bc2_inv: f64,
) {
    debug_assert_eq!(params.len(), grads.len());
    for i in 0..params.len() {
        let g = grads[i];
        buf.m[i] = c.beta1 * buf.m[i] + (1.0 - c.beta1) * g;
        buf.v[i] = c.beta2 * buf.v[i] + (1.0 - c.beta2) * g * g;
        let m_hat = buf.m[i] * bc1_inv;
        let v_hat = buf.v[i] * bc2_inv;
        params[i] -= lr * m_hat / (v_hat.sqrt() + c.eps);
    }
}

impl Adam {
    pub fn new(params: &OptimizedParams, config: AdamConfig) -> Self {
        Self {
            config,
            bufs: vec![
                MomentBuf::zeros(params.w1.data.len()),
                MomentBuf::zeros(params.b1.len()),
                MomentBuf::zeros(params.w2.data.len()),
                MomentBuf::zeros(params.b2.len()),
                MomentBuf::zeros(1),
            ],
            step: 0,
        }
    }

    pub fn step_count(&self) -> u64 {
        self.step
    }

    /// Apply one bias-corrected update to every tensor in `params`.
    pub fn step(&mut self, params: &mut OptimizedParams, grads: &OptimizedParams, lr: f64) {
        self.step += 1;
        let c = self.config;
        let t = self.step as f64;
        let bc1_inv = 1.0 / (1.0 - c.beta1.powf(t));
        let bc2_inv = 1.0 / (1.0 - c.beta2.powf(t));

        let mut gate = [params.forget_gate];
        let pairs: [(&mut [f64], &[f64]); 5] = [
            (params.w1.data.as_mut_slice(), grads.w1.data.as_slice()),
            (params.b1.as_mut_slice(), grads.b1.as_slice()),
            (params.w2.data.as_mut_slice(), grads.w2.data.as_slice()),
            (params.b2.as_mut_slice(), grads.b2.as_slice()),
            (gate.as_mut_slice(), std::slice::from_ref(&grads.forget_gate)),
        ];
        for ((p, g), buf) in pairs.into_iter().zip(self.bufs.iter_mut()) {
            adam_step_buf(p, g, buf, lr, &c, bc1_inv, bc2_inv);
        }
        params.forget_gate = gate[0];
    }

    /// Zero moments and the step counter.
    pub fn reset(&mut self) {
        for buf in &mut self.bufs {
            buf.m.iter_mut().for_each(|x| *x = 0.0);
            buf.v.iter_mut().for_each(|x| *x = 0.0);
        }
        self.step = 0;
    }
}
