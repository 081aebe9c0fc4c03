use super::{
    zero_padding, BackwardIo, ForwardIo, Gradient, InitContext, Operator,
};
use crate::tensor::{
    parallel::{for_i, get_threads, SyncSliceMut},
    Dims, Format,
};
use anyhow::{bail, Result};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::{f32::consts::PI, str::FromStr};

/// Elementwise activation function.
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum ActivationKind {
    Abs,
    /// Clamps to `[alpha, beta]`, default `[-1, 1]`.
    Clip,
    /// `alpha * (e^x - 1)` below 0, default alpha 1.
    Elu,
    Exp,
    Gelu,
    HardLogistic,
    HardSwish,
    /// `alpha * x + beta`, default `x`.
    Linear,
    Log,
    Logistic,
    LogLogistic,
    Mish,
    /// `x^alpha`, default alpha 2.
    Pow,
    /// Leaky with slope alpha below 0, default 0.
    Relu,
    Relu6,
    SoftRelu,
    SoftSign,
    Sqrt,
    Square,
    /// `x * logistic(alpha * x)`, default alpha 1.
    Swish,
    Tanh,
    TanhExp,
}

impl ActivationKind {
    /// Every activation.
    pub const ALL: [Self; 22] = [
        Self::Abs,
        Self::Clip,
        Self::Elu,
        Self::Exp,
        Self::Gelu,
        Self::HardLogistic,
        Self::HardSwish,
        Self::Linear,
        Self::Log,
        Self::Logistic,
        Self::LogLogistic,
        Self::Mish,
        Self::Pow,
        Self::Relu,
        Self::Relu6,
        Self::SoftRelu,
        Self::SoftSign,
        Self::Sqrt,
        Self::Square,
        Self::Swish,
        Self::Tanh,
        Self::TanhExp,
    ];
    fn default_alpha(self) -> f32 {
        match self {
            Self::Clip => -1.,
            Self::Elu | Self::Linear | Self::Swish => 1.,
            Self::Pow => 2.,
            _ => 0.,
        }
    }
    fn default_beta(self) -> f32 {
        match self {
            Self::Clip => 1.,
            _ => 0.,
        }
    }
}

impl FromStr for ActivationKind {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        match Self::ALL.iter().find(|x| x.to_string() == s) {
            Some(x) => Ok(*x),
            None => bail!("Unknown activation {s:?}!"),
        }
    }
}

/// An activation with its parameters.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Activation {
    /// Function.
    pub kind: ActivationKind,
    /// First parameter.
    pub alpha: f32,
    /// Second parameter.
    pub beta: f32,
}

fn logistic(x: f32) -> f32 {
    1. / (1. + (-x).exp())
}

fn softplus(x: f32) -> f32 {
    if x > 20. {
        x
    } else {
        x.exp().ln_1p()
    }
}

const GELU_C: f32 = 0.044715;

impl Activation {
    /// Creates an activation, `None` parameters take the default of `kind`.
    pub fn new(kind: ActivationKind, alpha: Option<f32>, beta: Option<f32>) -> Self {
        Self {
            kind,
            alpha: alpha.unwrap_or_else(|| kind.default_alpha()),
            beta: beta.unwrap_or_else(|| kind.default_beta()),
        }
    }
    /// `f(x)`
    pub fn f(&self, x: f32) -> f32 {
        let Self { kind, alpha, beta } = *self;
        match kind {
            ActivationKind::Abs => x.abs(),
            ActivationKind::Clip => x.max(alpha).min(beta),
            ActivationKind::Elu => {
                if x > 0. {
                    x
                } else {
                    alpha * x.exp_m1()
                }
            }
            ActivationKind::Exp => x.exp(),
            ActivationKind::Gelu => {
                let k = (2. / PI).sqrt();
                0.5 * x * (1. + (k * (x + GELU_C * x * x * x)).tanh())
            }
            ActivationKind::HardLogistic => (x / 6. + 0.5).clamp(0., 1.),
            ActivationKind::HardSwish => x * (x / 6. + 0.5).clamp(0., 1.),
            ActivationKind::Linear => alpha * x + beta,
            ActivationKind::Log => x.ln(),
            ActivationKind::Logistic => logistic(x),
            ActivationKind::LogLogistic => -softplus(-x),
            ActivationKind::Mish => x * softplus(x).tanh(),
            ActivationKind::Pow => x.powf(alpha),
            ActivationKind::Relu => {
                if x > 0. {
                    x
                } else {
                    alpha * x
                }
            }
            ActivationKind::Relu6 => x.clamp(0., 6.),
            ActivationKind::SoftRelu => softplus(x),
            ActivationKind::SoftSign => x / (1. + x.abs()),
            ActivationKind::Sqrt => x.sqrt(),
            ActivationKind::Square => x * x,
            ActivationKind::Swish => x * logistic(alpha * x),
            ActivationKind::Tanh => x.tanh(),
            ActivationKind::TanhExp => x * x.exp().tanh(),
        }
    }
    /// `f'(x)`, in terms of the input.
    pub fn df(&self, x: f32) -> f32 {
        let Self { kind, alpha, beta } = *self;
        match kind {
            ActivationKind::Abs => {
                if x > 0. {
                    1.
                } else if x < 0. {
                    -1.
                } else {
                    0.
                }
            }
            ActivationKind::Clip => {
                if x > alpha && x < beta {
                    1.
                } else {
                    0.
                }
            }
            ActivationKind::Elu => {
                if x > 0. {
                    1.
                } else {
                    alpha * x.exp()
                }
            }
            ActivationKind::Exp => x.exp(),
            ActivationKind::Gelu => {
                let k = (2. / PI).sqrt();
                let t = (k * (x + GELU_C * x * x * x)).tanh();
                0.5 * (1. + t) + 0.5 * x * (1. - t * t) * k * (1. + 3. * GELU_C * x * x)
            }
            ActivationKind::HardLogistic => {
                if x > -3. && x < 3. {
                    1. / 6.
                } else {
                    0.
                }
            }
            ActivationKind::HardSwish => {
                if x <= -3. {
                    0.
                } else if x >= 3. {
                    1.
                } else {
                    x / 3. + 0.5
                }
            }
            ActivationKind::Linear => alpha,
            ActivationKind::Log => 1. / x,
            ActivationKind::Logistic => {
                let y = logistic(x);
                y * (1. - y)
            }
            ActivationKind::LogLogistic => 1. - logistic(x),
            ActivationKind::Mish => {
                let t = softplus(x).tanh();
                t + x * (1. - t * t) * logistic(x)
            }
            ActivationKind::Pow => alpha * x.powf(alpha - 1.),
            ActivationKind::Relu => {
                if x > 0. {
                    1.
                } else {
                    alpha
                }
            }
            ActivationKind::Relu6 => {
                if x > 0. && x < 6. {
                    1.
                } else {
                    0.
                }
            }
            ActivationKind::SoftRelu => logistic(x),
            ActivationKind::SoftSign => {
                let d = 1. + x.abs();
                1. / (d * d)
            }
            ActivationKind::Sqrt => 0.5 / x.sqrt(),
            ActivationKind::Square => 2. * x,
            ActivationKind::Swish => {
                let s = logistic(alpha * x);
                s + alpha * x * s * (1. - s)
            }
            ActivationKind::Tanh => {
                let y = x.tanh();
                1. - y * y
            }
            ActivationKind::TanhExp => {
                let e = x.exp();
                let t = e.tanh();
                t - x * e * (t * t - 1.)
            }
        }
    }
    /// Gradient of the input for output gradient `dy`, zero where `dy` is zero.
    #[inline]
    pub(crate) fn backward(&self, x: f32, dy: f32) -> f32 {
        if dy == 0. {
            0.
        } else {
            dy * self.df(x)
        }
    }
}

/// Standalone activation layer.
#[derive(Debug)]
pub(crate) struct ActivationLayer {
    activation: Activation,
}

impl ActivationLayer {
    pub(crate) fn new(activation: Activation) -> Self {
        Self { activation }
    }
}

impl Operator for ActivationLayer {
    fn output_dims(&self, inputs: &[Dims]) -> Result<Dims> {
        Ok(inputs[0])
    }
    fn initialize(&mut self, ctx: &InitContext) -> Result<Format> {
        Ok(ctx.input_format())
    }
    fn resets_gradient(&self) -> bool {
        true
    }
    fn forward(&mut self, io: ForwardIo) -> Result<()> {
        let ForwardIo {
            inputs,
            output,
            d_output,
            ..
        } = io;
        let x = inputs[0].data;
        let desc = output.desc;
        let sample_len = desc.sample_len();
        let activation = self.activation;
        let threads = get_threads(desc.len(), 4);
        let y = SyncSliceMut::new(output.data);
        let d_y = d_output.map(SyncSliceMut::new);
        for_i(desc.batch, threads, |n| {
            let start = n * sample_len;
            let y = unsafe { y.slice_mut(start, sample_len) };
            for (y, x) in y.iter_mut().zip(&x[start..start + sample_len]) {
                *y = activation.f(*x);
            }
            zero_padding(&desc.with_batch(1), y);
            if let Some(d_y) = d_y.as_ref() {
                unsafe { d_y.slice_mut(start, sample_len) }.fill(0.);
            }
        });
        Ok(())
    }
    fn backward(&mut self, io: BackwardIo) -> Result<()> {
        let BackwardIo {
            inputs,
            gradient,
            accumulate,
            ..
        } = io;
        let x = inputs[0].data;
        let desc = inputs[0].desc;
        let activation = self.activation;
        let sample_len = desc.sample_len();
        let threads = get_threads(desc.len(), 4);
        match gradient {
            Gradient::InPlace(d) => {
                let d = SyncSliceMut::new(d);
                for_i(desc.batch, threads, |n| {
                    let start = n * sample_len;
                    let d = unsafe { d.slice_mut(start, sample_len) };
                    for (d, x) in d.iter_mut().zip(&x[start..start + sample_len]) {
                        *d = activation.backward(*x, *d);
                    }
                });
            }
            Gradient::Separate {
                d_output: Some(dy),
                mut d_inputs,
            } => {
                let Some(dx) = d_inputs.swap_remove(0) else {
                    return Ok(());
                };
                let accumulate = accumulate[0];
                let dx = SyncSliceMut::new(dx);
                for_i(desc.batch, threads, |n| {
                    let start = n * sample_len;
                    let dx = unsafe { dx.slice_mut(start, sample_len) };
                    let range = start..start + sample_len;
                    for ((dx, x), dy) in dx.iter_mut().zip(&x[range.clone()]).zip(&dy[range]) {
                        let g = activation.backward(*x, *dy);
                        if accumulate {
                            *dx += g;
                        } else {
                            *dx = g;
                        }
                    }
                });
            }
            Gradient::Separate { d_output: None, .. } => bail!("Missing output gradient!"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn derivatives_match_finite_differences() {
        let h = 1e-3;
        for kind in ActivationKind::ALL {
            let activation = Activation::new(kind, None, None);
            for x in [-2.3f32, -0.7, 0.4, 1.9] {
                let x = match kind {
                    ActivationKind::Log | ActivationKind::Sqrt | ActivationKind::Pow => x.abs(),
                    _ => x,
                };
                let numeric = (activation.f(x + h) - activation.f(x - h)) / (2. * h);
                assert_relative_eq!(activation.df(x), numeric, epsilon = 1e-2, max_relative = 1e-2);
            }
        }
    }

    #[test]
    fn parameters_default_per_kind() -> Result<()> {
        let relu = Activation::new("Relu".parse()?, Some(0.1), None);
        assert_eq!(relu.f(-2.), -0.2);
        assert_eq!(Activation::new(ActivationKind::Clip, None, None).f(3.), 1.);
        assert_eq!(Activation::new(ActivationKind::Linear, None, None).f(3.), 3.);
        assert!("ReLU".parse::<ActivationKind>().is_err());
        Ok(())
    }
}
