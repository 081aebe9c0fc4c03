//! Weight update rules.
//!
//! Each parameterized layer keeps its own moment buffers (`moments()` per tensor) and scalar state
//! ([`OptimizerScalars`]). [`update`] applies one step of the selected rule to a tensor.
use anyhow::{bail, Result};
use derive_more::Display;
use ndarray::{ArrayView1, ArrayViewMut1, Zip};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Update rule.
#[derive(Clone, Copy, Debug, Default, Display, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[allow(clippy::upper_case_acronyms)]
pub enum Optimizer {
    /// Plain gradient descent with L2 penalty.
    SGD,
    /// Gradient descent with a velocity.
    #[default]
    SGDMomentum,
    /// Momentum with decoupled weight decay.
    SGDW,
    /// Nesterov accelerated gradient.
    NAG,
    /// Root mean square propagation.
    RMSProp,
    /// Adaptive gradient.
    AdaGrad,
    /// Adaptive delta.
    AdaDelta,
    /// Adaptive moments.
    Adam,
    /// Adam with decoupled weight decay.
    AdamW,
    /// Adam with an infinity norm.
    Adamax,
    /// Adam with the variance of the gradient around its mean.
    AdaBelief,
    /// Adam with dynamic step bounds.
    AdaBound,
    /// AdaBound with decoupled weight decay.
    AdaBoundW,
    /// AdaBound with a running maximum of the second moment.
    AmsBound,
    /// AmsBound with decoupled weight decay.
    AmsBoundW,
}

impl Optimizer {
    /// Every rule.
    pub const ALL: [Self; 15] = [
        Self::SGD,
        Self::SGDMomentum,
        Self::SGDW,
        Self::NAG,
        Self::RMSProp,
        Self::AdaGrad,
        Self::AdaDelta,
        Self::Adam,
        Self::AdamW,
        Self::Adamax,
        Self::AdaBelief,
        Self::AdaBound,
        Self::AdaBoundW,
        Self::AmsBound,
        Self::AmsBoundW,
    ];
    /// Auxiliary buffers per parameter tensor.
    pub fn moments(self) -> usize {
        use Optimizer::*;
        match self {
            SGD => 0,
            SGDMomentum | SGDW | NAG | RMSProp | AdaGrad => 1,
            AdaDelta | Adam | AdamW | Adamax | AdaBelief | AdaBound | AdaBoundW => 2,
            AmsBound | AmsBoundW => 3,
        }
    }
    /// Persisted scalars, a prefix of `[B1, B2, Gamma]`.
    pub fn scalars(self) -> usize {
        use Optimizer::*;
        match self {
            Adamax => 1,
            Adam | AdamW | AdaBelief => 2,
            AdaBound | AdaBoundW | AmsBound | AmsBoundW => 3,
            _ => 0,
        }
    }
    /// Whether weight decay is applied to the weights instead of the gradient.
    pub fn decoupled(self) -> bool {
        matches!(
            self,
            Self::SGDW | Self::AdamW | Self::AdaBoundW | Self::AmsBoundW
        )
    }
}

impl FromStr for Optimizer {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|x| x.to_string() == s)
            .ok_or_else(|| anyhow::format_err!("Unknown optimizer {s:?}!"))
    }
}

/// Training hyperparameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingRate {
    /// Update rule.
    pub optimizer: Optimizer,
    /// Learning rate.
    pub rate: f32,
    /// Momentum, or beta1 for the Adam family.
    pub momentum: f32,
    /// Beta2 for the Adam family.
    pub beta2: f32,
    /// Weight decay.
    pub l2_penalty: f32,
    /// Denominator epsilon.
    pub eps: f32,
    /// Final learning rate of the bounded rules.
    pub final_rate: f32,
    /// Convergence speed of the bounds.
    pub gamma: f32,
}

impl Default for TrainingRate {
    fn default() -> Self {
        Self {
            optimizer: Optimizer::default(),
            rate: 0.01,
            momentum: 0.9,
            beta2: 0.999,
            l2_penalty: 0.0005,
            eps: 1e-8,
            final_rate: 0.1,
            gamma: 0.003,
        }
    }
}

impl TrainingRate {
    /// Checks the hyperparameter ranges.
    ///
    /// **Errors**
    ///
    /// Rate or decay is negative, or a beta is outside `[0, 1[`.
    pub fn validate(&self) -> Result<()> {
        let Self {
            rate,
            momentum,
            beta2,
            l2_penalty,
            eps,
            ..
        } = *self;
        if !(rate >= 0. && l2_penalty >= 0. && eps >= 0.) {
            bail!("Rate {rate}, L2 penalty {l2_penalty} and eps {eps} must be positive!");
        }
        if !((0. ..1.).contains(&momentum) && (0. ..1.).contains(&beta2)) {
            bail!("Momentum {momentum} and beta2 {beta2} must be in [0, 1[!");
        }
        Ok(())
    }
}

/// Bias correction state of a layer, `B1 = beta1^t`, `B2 = beta2^t`, `Gamma = gamma * t`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct OptimizerScalars {
    /// `beta1^t`
    pub b1: f32,
    /// `beta2^t`
    pub b2: f32,
    /// `gamma * t`
    pub gamma: f32,
}

impl Default for OptimizerScalars {
    fn default() -> Self {
        Self {
            b1: 1.,
            b2: 1.,
            gamma: 0.,
        }
    }
}

impl OptimizerScalars {
    /// Scalars as persisted.
    pub fn as_array(&self) -> [f32; 3] {
        [self.b1, self.b2, self.gamma]
    }
    /// Restores from the persisted prefix.
    pub fn set_from(&mut self, values: &[f32]) {
        let mut array = self.as_array();
        array[..values.len()].copy_from_slice(values);
        [self.b1, self.b2, self.gamma] = array;
    }
    /// Advances one step.
    pub fn advance(&mut self, rate: &TrainingRate) {
        self.b1 *= rate.momentum;
        self.b2 *= rate.beta2;
        self.gamma += rate.gamma;
    }
}

/// Per tensor constants of one step.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Step {
    lr: f32,
    wd: f32,
    m: f32,
    b2: f32,
    eps: f32,
    bc1: f32,
    bc2: f32,
    lower: f32,
    upper: f32,
}

impl Step {
    /// Constants for a tensor with learning rate and weight decay multipliers `lrm`, `wdm`.
    pub(crate) fn new(rate: &TrainingRate, scalars: &OptimizerScalars, lrm: f32, wdm: f32) -> Self {
        let lr = rate.rate * lrm;
        let final_lr = rate.final_rate * lrm;
        let gamma = scalars.gamma.max(f32::EPSILON);
        Self {
            lr,
            wd: rate.l2_penalty * wdm,
            m: rate.momentum,
            b2: rate.beta2,
            eps: rate.eps,
            bc1: (1. - scalars.b1).max(f32::EPSILON),
            bc2: (1. - scalars.b2).max(f32::EPSILON),
            lower: final_lr * (1. - 1. / (gamma + 1.)),
            upper: final_lr * (1. + 1. / gamma),
        }
    }
}

/// Applies one step of `optimizer` to `w` with gradient `g`.
///
/// `moments` must hold [`Optimizer::moments()`] buffers of `w.len()` elements.
pub(crate) fn update(
    optimizer: Optimizer,
    step: &Step,
    w: &mut [f32],
    g: &[f32],
    moments: &mut [Vec<f32>],
) -> Result<()> {
    if moments.len() < optimizer.moments()
        || moments.iter().any(|x| x.len() != w.len())
        || g.len() != w.len()
    {
        bail!(
            "{optimizer} expected {} moments of {} elements!",
            optimizer.moments(),
            w.len()
        );
    }
    let w = ArrayViewMut1::from(w);
    let g = ArrayView1::from(g);
    let s = *step;
    match (optimizer, moments) {
        (Optimizer::SGD, _) => {
            Zip::from(w).and(g).for_each(|w, g| kernels::sgd(w, *g, s.lr, s.wd));
        }
        (Optimizer::AdaDelta, [m1, m2, ..]) => {
            Zip::from(w)
                .and(g)
                .and(m1.as_mut_slice())
                .and(m2.as_mut_slice())
                .for_each(|w, g, m1, m2| kernels::adadelta(w, *g, &s, m1, m2));
        }
        (Optimizer::AmsBound | Optimizer::AmsBoundW, [m1, m2, m3, ..]) => {
            let decoupled = optimizer.decoupled();
            Zip::from(w)
                .and(g)
                .and(m1.as_mut_slice())
                .and(m2.as_mut_slice())
                .and(m3.as_mut_slice())
                .for_each(|w, g, m1, m2, m3| kernels::amsbound(w, *g, &s, decoupled, m1, m2, m3));
        }
        (optimizer, [m1, m2, ..]) if optimizer.moments() == 2 => {
            let kernel = match optimizer {
                Optimizer::Adam => kernels::adam,
                Optimizer::AdamW => kernels::adamw,
                Optimizer::Adamax => kernels::adamax,
                Optimizer::AdaBelief => kernels::adabelief,
                Optimizer::AdaBound => kernels::adabound,
                Optimizer::AdaBoundW => kernels::adaboundw,
                _ => unreachable!("{optimizer}"),
            };
            Zip::from(w)
                .and(g)
                .and(m1.as_mut_slice())
                .and(m2.as_mut_slice())
                .for_each(|w, g, m1, m2| kernel(w, *g, &s, m1, m2));
        }
        (optimizer, [m1, ..]) => {
            let kernel = match optimizer {
                Optimizer::SGDMomentum => kernels::sgd_momentum,
                Optimizer::SGDW => kernels::sgdw,
                Optimizer::NAG => kernels::nag,
                Optimizer::RMSProp => kernels::rmsprop,
                Optimizer::AdaGrad => kernels::adagrad,
                _ => unreachable!("{optimizer}"),
            };
            Zip::from(w)
                .and(g)
                .and(m1.as_mut_slice())
                .for_each(|w, g, m1| kernel(w, *g, &s, m1));
        }
        (optimizer, []) => unreachable!("{optimizer}"),
    }
    Ok(())
}

/// Per element update rules.
mod kernels {
    use super::Step;

    pub fn sgd(w: &mut f32, dw: f32, lr: f32, wd: f32) {
        *w -= lr * (dw + wd * *w);
    }

    pub fn sgd_momentum(w: &mut f32, dw: f32, s: &Step, v: &mut f32) {
        *v = s.m * *v + dw + s.wd * *w;
        *w -= s.lr * *v;
    }

    pub fn sgdw(w: &mut f32, dw: f32, s: &Step, v: &mut f32) {
        *v = s.m * *v + dw;
        *w -= s.lr * (*v + s.wd * *w);
    }

    pub fn nag(w: &mut f32, dw: f32, s: &Step, v: &mut f32) {
        let v_prev = *v;
        *v = s.m * *v - s.lr * (dw + s.wd * *w);
        *w += -s.m * v_prev + (1. + s.m) * *v;
    }

    pub fn rmsprop(w: &mut f32, dw: f32, s: &Step, r: &mut f32) {
        let dw = dw + s.wd * *w;
        *r = s.m * *r + (1. - s.m) * dw * dw;
        *w -= s.lr * dw / (r.sqrt() + s.eps);
    }

    pub fn adagrad(w: &mut f32, dw: f32, s: &Step, r: &mut f32) {
        let dw = dw + s.wd * *w;
        *r += dw * dw;
        *w -= s.lr * dw / (r.sqrt() + s.eps);
    }

    pub fn adadelta(w: &mut f32, dw: f32, s: &Step, r: &mut f32, d: &mut f32) {
        let dw = dw + s.wd * *w;
        *r = s.m * *r + (1. - s.m) * dw * dw;
        let dx = ((*d + s.eps).sqrt() / (*r + s.eps).sqrt()) * dw;
        *d = s.m * *d + (1. - s.m) * dx * dx;
        *w -= s.lr * dx;
    }

    fn moments(dw: f32, s: &Step, m: &mut f32, v: &mut f32) -> (f32, f32) {
        *m = s.m * *m + (1. - s.m) * dw;
        *v = s.b2 * *v + (1. - s.b2) * dw * dw;
        (*m / s.bc1, *v / s.bc2)
    }

    pub fn adam(w: &mut f32, dw: f32, s: &Step, m: &mut f32, v: &mut f32) {
        let (m, v) = moments(dw + s.wd * *w, s, m, v);
        *w -= s.lr * m / (v.sqrt() + s.eps);
    }

    pub fn adamw(w: &mut f32, dw: f32, s: &Step, m: &mut f32, v: &mut f32) {
        let (m, v) = moments(dw, s, m, v);
        *w -= s.lr * (m / (v.sqrt() + s.eps) + s.wd * *w);
    }

    pub fn adamax(w: &mut f32, dw: f32, s: &Step, m: &mut f32, u: &mut f32) {
        let dw = dw + s.wd * *w;
        *m = s.m * *m + (1. - s.m) * dw;
        *u = (s.b2 * *u).max(dw.abs());
        *w -= s.lr / s.bc1 * *m / (*u + s.eps);
    }

    pub fn adabelief(w: &mut f32, dw: f32, s: &Step, m: &mut f32, v: &mut f32) {
        let dw = dw + s.wd * *w;
        *m = s.m * *m + (1. - s.m) * dw;
        let belief = dw - *m;
        *v = s.b2 * *v + (1. - s.b2) * belief * belief + s.eps;
        *w -= s.lr * (*m / s.bc1) / ((*v / s.bc2).sqrt() + s.eps);
    }

    fn bounded(s: &Step, v: f32) -> f32 {
        let step = s.lr / (v.sqrt() + s.eps);
        if s.lower <= s.upper {
            step.clamp(s.lower, s.upper)
        } else {
            step
        }
    }

    pub fn adabound(w: &mut f32, dw: f32, s: &Step, m: &mut f32, v: &mut f32) {
        let (m, v) = moments(dw + s.wd * *w, s, m, v);
        *w -= bounded(s, v) * m;
    }

    pub fn adaboundw(w: &mut f32, dw: f32, s: &Step, m: &mut f32, v: &mut f32) {
        let (m, v) = moments(dw, s, m, v);
        *w -= bounded(s, v) * m + s.lr * s.wd * *w;
    }

    pub fn amsbound(
        w: &mut f32,
        dw: f32,
        s: &Step,
        decoupled: bool,
        m: &mut f32,
        v: &mut f32,
        v_max: &mut f32,
    ) {
        let dw = if decoupled { dw } else { dw + s.wd * *w };
        let (m, _) = moments(dw, s, m, v);
        *v_max = v_max.max(*v);
        let step = bounded(s, *v_max / s.bc2) * m;
        if decoupled {
            *w -= step + s.lr * s.wd * *w;
        } else {
            *w -= step;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn run(optimizer: Optimizer, steps: usize) -> Result<f32> {
        // minimize (w - 3)^2
        let rate = TrainingRate {
            optimizer,
            rate: if matches!(optimizer, Optimizer::AdaDelta) { 1. } else { 0.05 },
            l2_penalty: 0.,
            ..TrainingRate::default()
        };
        let mut scalars = OptimizerScalars::default();
        let mut w = vec![0f32];
        let mut moments = vec![vec![0f32]; optimizer.moments()];
        for _ in 0..steps {
            let g = [2. * (w[0] - 3.)];
            scalars.advance(&rate);
            let step = Step::new(&rate, &scalars, 1., 1.);
            update(optimizer, &step, &mut w, &g, &mut moments)?;
        }
        Ok(w[0])
    }

    #[test]
    fn every_rule_descends() -> Result<()> {
        for optimizer in Optimizer::ALL {
            let w = run(optimizer, 50)?;
            assert!(
                (w - 3.).abs() < 3.,
                "{optimizer} moved away from the minimum: {w}"
            );
            assert!(w > 0., "{optimizer} did not move: {w}");
        }
        Ok(())
    }

    #[test]
    fn sgd_step() -> Result<()> {
        let rate = TrainingRate {
            optimizer: Optimizer::SGD,
            rate: 0.5,
            l2_penalty: 0.1,
            ..TrainingRate::default()
        };
        let step = Step::new(&rate, &OptimizerScalars::default(), 2., 1.);
        let mut w = vec![1., 2.];
        update(Optimizer::SGD, &step, &mut w, &[1., -1.], &mut [])?;
        assert_relative_eq!(w[0], 1. - 1. * (1. + 0.1));
        assert_relative_eq!(w[1], 2. - 1. * (-1. + 0.2));
        Ok(())
    }

    #[test]
    fn adam_first_step_is_rate() -> Result<()> {
        let rate = TrainingRate {
            optimizer: Optimizer::Adam,
            rate: 0.01,
            l2_penalty: 0.,
            ..TrainingRate::default()
        };
        let mut scalars = OptimizerScalars::default();
        scalars.advance(&rate);
        assert_relative_eq!(scalars.b1, 0.9);
        let step = Step::new(&rate, &scalars, 1., 1.);
        let mut w = vec![0.];
        let mut moments = vec![vec![0.], vec![0.]];
        update(Optimizer::Adam, &step, &mut w, &[4.], &mut moments)?;
        assert_relative_eq!(w[0], -0.01, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn moment_counts() {
        let counts: Vec<_> = Optimizer::ALL.iter().map(|x| x.moments()).collect();
        assert_eq!(counts, [0, 1, 1, 1, 1, 1, 2, 2, 2, 2, 2, 2, 2, 3, 3]);
        assert_eq!(Optimizer::AmsBoundW.scalars(), 3);
        assert_eq!("AdaBelief".parse::<Optimizer>().unwrap(), Optimizer::AdaBelief);
    }

    #[test]
    fn training_rate_serde() -> Result<()> {
        let rate: TrainingRate = serde_json::from_str(r#"{"optimizer": "AdamW", "rate": 0.002}"#)?;
        assert_eq!(rate.optimizer, Optimizer::AdamW);
        assert_eq!(rate.momentum, 0.9);
        rate.validate()?;
        Ok(())
    }
}
