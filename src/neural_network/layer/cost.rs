//! Cost layers: loss and gradient against a label stream, error counters and confusion matrix.
use super::{write_slice, BackwardIo, ForwardIo, Gradient, InitContext, LayerConfig, LayerType, Operator};
use crate::tensor::{Dims, Format, MemoryDesc};
use anyhow::{bail, Result};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Loss function of a cost layer.
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum CostFunction {
    BinaryCrossEntropy,
    CategoricalCrossEntropy,
    MeanAbsoluteEpsError,
    MeanAbsoluteError,
    MeanSquaredError,
    SmoothHinge,
}

impl CostFunction {
    /// Every cost function.
    pub const ALL: [Self; 6] = [
        Self::BinaryCrossEntropy,
        Self::CategoricalCrossEntropy,
        Self::MeanAbsoluteEpsError,
        Self::MeanAbsoluteError,
        Self::MeanSquaredError,
        Self::SmoothHinge,
    ];
}

impl FromStr for CostFunction {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        match Self::ALL.iter().find(|x| x.to_string() == s) {
            Some(x) => Ok(*x),
            None => bail!("Unknown cost function {s:?}!"),
        }
    }
}

/// Loss and error counters of one phase.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CostCounters {
    /// Summed weighted loss.
    pub loss: f32,
    /// Misclassified samples.
    pub errors: usize,
    /// Samples seen.
    pub samples: usize,
}

impl CostCounters {
    /// Mean loss per sample.
    pub fn average_loss(&self) -> f32 {
        if self.samples == 0 {
            0.
        } else {
            self.loss / self.samples as f32
        }
    }
    /// Fraction of misclassified samples.
    pub fn error_rate(&self) -> f32 {
        if self.samples == 0 {
            0.
        } else {
            self.errors as f32 / self.samples as f32
        }
    }
}

/// Running counters of a cost layer.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CostMetrics {
    /// Training forward passes.
    pub train: CostCounters,
    /// Inference forward passes with labels.
    pub test: CostCounters,
    /// `confusion[label][predicted]`.
    pub confusion: Vec<Vec<usize>>,
}

impl CostMetrics {
    /// Zeroes counters and the confusion matrix.
    pub fn reset(&mut self) {
        self.train = CostCounters::default();
        self.test = CostCounters::default();
        self.confusion.iter_mut().for_each(|row| row.fill(0));
    }
}

/// Per element loss and its derivative.
#[derive(Clone, Copy, Debug)]
struct Loss {
    function: CostFunction,
    /// The input holds log probabilities.
    log_input: bool,
    eps: f32,
}

impl Loss {
    /// `(loss, d loss / d p)` for prediction `p`, target `t` and hinge sign `y`.
    fn eval(&self, p: f32, t: f32, y: f32) -> (f32, f32) {
        let eps = self.eps;
        match self.function {
            CostFunction::CategoricalCrossEntropy if self.log_input => (-t * p, -t),
            CostFunction::CategoricalCrossEntropy => {
                let p = p.max(eps);
                (-t * p.ln(), -t / p)
            }
            CostFunction::BinaryCrossEntropy => {
                let p = p.clamp(eps, 1. - eps);
                (
                    -(t * p.ln() + (1. - t) * (1. - p).ln()),
                    (p - t) / (p * (1. - p)),
                )
            }
            CostFunction::MeanAbsoluteError => {
                let d = p - t;
                (d.abs(), sign(d))
            }
            CostFunction::MeanAbsoluteEpsError => {
                let d = p - t;
                if d.abs() > eps {
                    (d.abs(), sign(d))
                } else {
                    (0., 0.)
                }
            }
            CostFunction::MeanSquaredError => {
                let d = p - t;
                (d * d, 2. * d)
            }
            CostFunction::SmoothHinge => {
                let z = y * p;
                if z >= 1. {
                    (0., 0.)
                } else if z <= 0. {
                    (0.5 - z, -y)
                } else {
                    (0.5 * (1. - z) * (1. - z), -y * (1. - z))
                }
            }
        }
    }
}

fn sign(x: f32) -> f32 {
    if x > 0. {
        1.
    } else if x < 0. {
        -1.
    } else {
        0.
    }
}

/// Terminal layer, its output is a copy of its input.
#[derive(Debug)]
pub(crate) struct Cost {
    loss: Loss,
    /// Classes, 0 until known from the input.
    channels: usize,
    label_index: usize,
    group_index: usize,
    weight: f32,
    label_true: f32,
    label_false: f32,
    metrics: CostMetrics,
    /// Weighted mean loss of the last scored batch.
    batch_loss: f32,
    /// Gradient of the input computed by the last training forward.
    gradient: Vec<f32>,
}

impl Cost {
    pub(crate) fn new(config: &LayerConfig, input_type: LayerType) -> Self {
        Self {
            loss: Loss {
                function: config.cost,
                log_input: input_type == LayerType::LogSoftmax,
                eps: config.eps,
            },
            channels: config.channels,
            label_index: config.label_index,
            group_index: config.group_index,
            weight: config.weight,
            label_true: config.label_true,
            label_false: config.label_false,
            metrics: CostMetrics::default(),
            batch_loss: 0.,
            gradient: Vec::new(),
        }
    }
    pub(crate) fn metrics(&self) -> &CostMetrics {
        &self.metrics
    }
    pub(crate) fn reset_metrics(&mut self) {
        self.metrics.reset();
    }
    pub(crate) fn group_index(&self) -> usize {
        self.group_index
    }
    pub(crate) fn function(&self) -> CostFunction {
        self.loss.function
    }
    pub(crate) fn batch_loss(&self) -> f32 {
        self.batch_loss
    }
    /// Scores `x` against `labels`, writing the input gradient when `gradient` is given.
    fn evaluate(
        &mut self,
        desc: &MemoryDesc,
        x: &[f32],
        labels: &[usize],
        columns: usize,
        training: bool,
        mut gradient: Option<&mut [f32]>,
    ) -> Result<()> {
        let channels = self.channels;
        if desc.dims.c != channels || !desc.dims.is_unit_spatial() {
            bail!(
                "Cost layer expects {channels} channels at unit resolution, found {:?}!",
                desc.dims
            );
        }
        if self.label_index >= columns || labels.len() < desc.batch * columns {
            bail!(
                "Label column {} out of {columns} for {} samples!",
                self.label_index,
                desc.batch
            );
        }
        let scale = self.weight / desc.batch as f32;
        let mut counters = CostCounters::default();
        for n in 0..desc.batch {
            let label = labels[n * columns + self.label_index];
            if label >= channels {
                bail!("Label {label} out of range for {channels} classes!");
            }
            let mut loss = 0f32;
            let mut predicted = 0;
            for c in 0..channels {
                let o = desc.offset(n, c, 0);
                let p = x[o];
                if p > x[desc.offset(n, predicted, 0)] {
                    predicted = c;
                }
                let (t, y) = if c == label {
                    (self.label_true, 1.)
                } else {
                    (self.label_false, -1.)
                };
                let (l, d) = self.loss.eval(p, t, y);
                loss += l;
                if let Some(gradient) = gradient.as_mut() {
                    gradient[o] = scale * d;
                }
            }
            counters.loss += self.weight * loss;
            counters.samples += 1;
            if predicted != label {
                counters.errors += 1;
            }
            if let Some(row) = self.metrics.confusion.get_mut(label) {
                row[predicted] += 1;
            }
        }
        self.batch_loss = counters.loss / desc.batch as f32;
        let phase = if training {
            &mut self.metrics.train
        } else {
            &mut self.metrics.test
        };
        phase.loss += counters.loss;
        phase.errors += counters.errors;
        phase.samples += counters.samples;
        Ok(())
    }
}

impl Operator for Cost {
    fn output_dims(&self, inputs: &[Dims]) -> Result<Dims> {
        Ok(inputs[0])
    }
    fn initialize(&mut self, ctx: &InitContext) -> Result<Format> {
        if self.channels == 0 {
            self.channels = ctx.dims.c;
        }
        if self.metrics.confusion.len() != self.channels {
            self.metrics.confusion = vec![vec![0; self.channels]; self.channels];
        }
        Ok(ctx.input_format())
    }
    fn forward(&mut self, io: ForwardIo) -> Result<()> {
        let ForwardIo {
            training,
            inputs,
            output,
            labels,
            ..
        } = io;
        let x = inputs[0];
        let len = x.desc.len();
        output.data[..len].copy_from_slice(&x.data[..len]);
        let Some(labels) = labels else {
            if training {
                bail!("Training a cost layer needs labels!");
            }
            return Ok(());
        };
        if training {
            let mut gradient = std::mem::take(&mut self.gradient);
            gradient.clear();
            gradient.resize(len, 0.);
            let result = self.evaluate(
                &x.desc,
                x.data,
                labels.data,
                labels.columns,
                true,
                Some(gradient.as_mut_slice()),
            );
            self.gradient = gradient;
            result
        } else {
            self.evaluate(&x.desc, x.data, labels.data, labels.columns, false, None)
        }
    }
    fn backward(&mut self, io: BackwardIo) -> Result<()> {
        let Gradient::Separate { d_inputs, .. } = io.gradient else {
            bail!("Cost layers have no in place gradient!");
        };
        let Some(dx) = d_inputs.into_iter().next().flatten() else {
            return Ok(());
        };
        if self.gradient.is_empty() {
            bail!("Cost backward without a training forward!");
        }
        let len = self.gradient.len();
        write_slice(&mut dx[..len], &self.gradient, io.accumulate[0]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn loss(function: CostFunction) -> Loss {
        Loss {
            function,
            log_input: false,
            eps: 1e-4,
        }
    }

    #[test]
    fn derivatives_match_finite_differences() {
        let h = 1e-3;
        for function in CostFunction::ALL {
            let loss = loss(function);
            for (p, t, y) in [(0.3f32, 1f32, 1f32), (0.6, 0., -1.), (0.2, 0., -1.)] {
                let (_, d) = loss.eval(p, t, y);
                let numeric = (loss.eval(p + h, t, y).0 - loss.eval(p - h, t, y).0) / (2. * h);
                assert_relative_eq!(d, numeric, epsilon = 1e-2, max_relative = 1e-2);
            }
        }
    }

    #[test]
    fn counts_errors_and_confusion() -> Result<()> {
        let config = LayerConfig {
            channels: 3,
            ..LayerConfig::default()
        };
        let mut cost = Cost::new(&config, LayerType::Softmax);
        cost.metrics.confusion = vec![vec![0; 3]; 3];
        let desc = MemoryDesc::new(2, Dims::new(3, 1, 1, 1), Format::Plain);
        let x = [0.7, 0.2, 0.1, 0.1, 0.3, 0.6];
        let mut gradient = vec![0.; 6];
        cost.evaluate(&desc, &x, &[0, 1], 1, true, Some(gradient.as_mut_slice()))?;
        let train = cost.metrics().train;
        assert_eq!((train.samples, train.errors), (2, 1));
        assert_relative_eq!(train.average_loss(), -(0.7f32.ln() + 0.3f32.ln()) / 2.);
        assert_eq!(cost.metrics().confusion[1][2], 1);
        assert_relative_eq!(gradient[0], -0.5 / 0.7);
        assert_eq!(gradient[1], 0.);
        cost.reset_metrics();
        assert_eq!(cost.metrics().train.samples, 0);
        Ok(())
    }
}
