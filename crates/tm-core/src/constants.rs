/// Weight of the surprise term added to the prediction loss in a train step.
pub const SURPRISE_PENALTY: f64 = 0.01;

/// Added to the norm before renormalising a manifold step result.
pub const RENORM_EPSILON: f64 = 1e-12;

/// Adam first-moment decay.
pub const ADAM_BETA1: f64 = 0.9;

/// Adam second-moment decay.
pub const ADAM_BETA2: f64 = 0.999;

/// Adam denominator epsilon.
pub const ADAM_EPSILON: f64 = 1e-8;

pub const DEFAULT_INPUT_DIM: usize = 64;
pub const DEFAULT_HIDDEN_DIM: usize = 32;
pub const DEFAULT_MEMORY_DIM: usize = 64;
pub const DEFAULT_LEARNING_RATE: f64 = 1e-3;
pub const DEFAULT_MOMENTUM_FACTOR: f64 = 0.9;
pub const DEFAULT_FORGET_GATE_INIT: f64 = 0.01;
pub const DEFAULT_MAX_STEP_SIZE: f64 = 0.1;
pub const DEFAULT_TANGENT_EPSILON: f64 = 1e-8;
pub const DEFAULT_NUM_HEADS: usize = 4;
pub const DEFAULT_NUM_LAYERS: usize = 3;
