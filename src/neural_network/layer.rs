//! Layers.
//!
//! A [`Layer`] couples the state every layer shares (name, type tag, inputs, output dims, the
//! negotiated [`Format`], the update lock and statistics) with a [`LayerKind`], the closed set of
//! operators. Every operator implements the crate private [`Operator`] contract:
//! - shape inference from the input dims, also used when the resolution changes,
//! - format negotiation and primitive construction for a batch size,
//! - forward in training or inference mode,
//! - backward, adding into or storing to the gradients of its inputs,
//! - access to its trainable [`Parameters`].
use super::{
    filler::Filler,
    optimizer::{self, Optimizer, OptimizerScalars, Step, TrainingRate},
    stats::{self, Statistics},
    ModelDefaults,
};
use crate::{
    engine::{Engine, ExecArgs, Primitive, ReductionAlgorithm, ResamplingAlgorithm, Stream},
    tensor::{Dims, Format, MemoryDesc, WeightDims, WeightFormat, VECTOR_SIZE},
};
use anyhow::{bail, Result};
use derive_more::Display;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

mod activation;
mod binary;
mod channel;
mod conv;
mod cost;
mod dense;
mod dropout;
pub(crate) mod lane;
mod norm;
mod pool;
mod reduction;
mod resample;
mod softmax;

#[cfg(test)]
mod tests;

pub use activation::{Activation, ActivationKind};
pub use cost::{CostCounters, CostFunction, CostMetrics};

/// Layer type tag, spelled as in model definitions.
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum LayerType {
    Activation,
    Add,
    Average,
    AvgPooling,
    BatchNorm,
    BatchNormActivation,
    BatchNormActivationDropout,
    ChannelSplit,
    ChannelSplitRatioLeft,
    ChannelSplitRatioRight,
    ChannelZeroPad,
    Concat,
    Convolution,
    ConvolutionTranspose,
    Cost,
    Dense,
    DepthwiseConvolution,
    Divide,
    Dropout,
    GlobalAvgPooling,
    GlobalMaxPooling,
    Input,
    LayerNorm,
    LogSoftmax,
    Max,
    MaxPooling,
    Min,
    Multiply,
    PartialDepthwiseConvolution,
    Reduction,
    Resampling,
    Shuffle,
    Softmax,
    Substract,
}

/// How many inputs a layer type takes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Arity {
    /// The implicit input layer.
    None,
    /// Exactly one.
    One,
    /// Exactly two.
    Two,
    /// Two or more.
    AtLeastTwo,
}

impl Arity {
    /// Whether `n` inputs are accepted.
    pub fn accepts(self, n: usize) -> bool {
        match self {
            Self::None => n == 0,
            Self::One => n == 1,
            Self::Two => n == 2,
            Self::AtLeastTwo => n >= 2,
        }
    }
}

impl LayerType {
    /// Every layer type.
    pub const ALL: [Self; 34] = [
        Self::Activation,
        Self::Add,
        Self::Average,
        Self::AvgPooling,
        Self::BatchNorm,
        Self::BatchNormActivation,
        Self::BatchNormActivationDropout,
        Self::ChannelSplit,
        Self::ChannelSplitRatioLeft,
        Self::ChannelSplitRatioRight,
        Self::ChannelZeroPad,
        Self::Concat,
        Self::Convolution,
        Self::ConvolutionTranspose,
        Self::Cost,
        Self::Dense,
        Self::DepthwiseConvolution,
        Self::Divide,
        Self::Dropout,
        Self::GlobalAvgPooling,
        Self::GlobalMaxPooling,
        Self::Input,
        Self::LayerNorm,
        Self::LogSoftmax,
        Self::Max,
        Self::MaxPooling,
        Self::Min,
        Self::Multiply,
        Self::PartialDepthwiseConvolution,
        Self::Reduction,
        Self::Resampling,
        Self::Shuffle,
        Self::Softmax,
        Self::Substract,
    ];
    /// Input count constraint.
    pub fn arity(self) -> Arity {
        match self {
            Self::Input => Arity::None,
            Self::Concat => Arity::AtLeastTwo,
            t if t.is_binary() => Arity::Two,
            _ => Arity::One,
        }
    }
    /// Elementwise ops of two inputs.
    pub fn is_binary(self) -> bool {
        matches!(
            self,
            Self::Add
                | Self::Average
                | Self::Divide
                | Self::Max
                | Self::Min
                | Self::Multiply
                | Self::Substract
        )
    }
    /// Batch normalization variants.
    pub fn is_batch_norm(self) -> bool {
        matches!(
            self,
            Self::BatchNorm | Self::BatchNormActivation | Self::BatchNormActivationDropout
        )
    }
    /// Normalization layers, their scale and shift are only trainable with `Scaling`.
    pub fn is_norm(self) -> bool {
        self.is_batch_norm() || self == Self::LayerNorm
    }
    /// Convolutions, the layers whose gradient buffer may be shared in place.
    pub fn is_conv(self) -> bool {
        matches!(
            self,
            Self::Convolution | Self::DepthwiseConvolution | Self::ConvolutionTranspose
        )
    }
    /// Layers with `Kernel`, `Stride` and `Pad`.
    pub fn has_kernel(self) -> bool {
        self.is_conv()
            || matches!(
                self,
                Self::PartialDepthwiseConvolution | Self::MaxPooling | Self::AvgPooling
            )
    }
    /// Layers with trainable weights.
    pub fn has_weights(self) -> bool {
        self.is_conv() || matches!(self, Self::PartialDepthwiseConvolution | Self::Dense)
    }
    /// Whether backward may run in place on the input gradient.
    ///
    /// Only activations and the batch statistics normalizations qualify, they zero their
    /// output gradient in training forward. [`LayerNorm`](Self::LayerNorm) keeps its own buffer.
    pub fn supports_inplace(self) -> bool {
        self == Self::Activation || self.is_batch_norm()
    }
    /// Whether the type takes `Activation=`.
    pub fn has_activation(self) -> bool {
        matches!(
            self,
            Self::Activation | Self::BatchNormActivation | Self::BatchNormActivationDropout
        )
    }
    /// Whether the type takes `Dropout=`.
    pub fn has_dropout(self) -> bool {
        matches!(self, Self::Dropout | Self::BatchNormActivationDropout)
    }
}

impl FromStr for LayerType {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        match Self::ALL.iter().find(|t| t.to_string() == s) {
            Some(t) => Ok(*t),
            None => bail!("Unknown layer type {s:?}!"),
        }
    }
}

/// The directives of one layer block, defaults already applied.
#[derive(Clone, Debug)]
pub struct LayerConfig {
    /// Output channels, 0 when unset.
    pub channels: usize,
    /// Kernel `[h, w]`.
    pub kernel: [usize; 2],
    /// Stride `[h, w]`.
    pub stride: [usize; 2],
    /// Padding `[h, w]`.
    pub pad: [usize; 2],
    /// Dilation `[h, w]`.
    pub dilation: [usize; 2],
    /// Groups.
    pub groups: usize,
    /// One based group selected by split layers.
    pub group: usize,
    /// Depthwise channel multiplier.
    pub multiplier: usize,
    /// Fraction of channels in the right half of a ratio split.
    pub ratio: f32,
    /// Whether a bias is learned.
    pub biases: bool,
    /// Filler set in the layer block.
    pub weights_filler: Option<Filler>,
    /// Filler set in the layer block.
    pub biases_filler: Option<Filler>,
    /// Model default filler.
    pub default_weights_filler: Filler,
    /// Model default filler.
    pub default_biases_filler: Filler,
    /// Learning rate multiplier.
    pub weights_lrm: f32,
    /// Weight decay multiplier.
    pub weights_wdm: f32,
    /// Learning rate multiplier.
    pub biases_lrm: f32,
    /// Weight decay multiplier.
    pub biases_wdm: f32,
    /// Running statistics momentum.
    pub momentum: f32,
    /// Normalization epsilon, also the cost epsilon.
    pub eps: f32,
    /// Whether normalization learns scale and shift.
    pub scaling: bool,
    /// Activation.
    pub activation: ActivationKind,
    /// Activation parameter.
    pub alpha: Option<f32>,
    /// Activation parameter.
    pub beta: Option<f32>,
    /// Drop probability.
    pub dropout: f32,
    /// Cost function.
    pub cost: CostFunction,
    /// Column of a multi column label stream.
    pub label_index: usize,
    /// Label stream.
    pub group_index: usize,
    /// Cost weight.
    pub weight: f32,
    /// Target for the true class.
    pub label_true: f32,
    /// Target for the other classes.
    pub label_false: f32,
    /// Resampling factor `[h, w]`.
    pub factor: [f32; 2],
    /// Resampling algorithm.
    pub algorithm: ResamplingAlgorithm,
    /// Reduction.
    pub operation: ReductionAlgorithm,
}

impl LayerConfig {
    /// A layer block seeded from the model block.
    pub fn new(defaults: &ModelDefaults) -> Self {
        Self {
            channels: 0,
            kernel: [1, 1],
            stride: [1, 1],
            pad: [0, 0],
            dilation: [1, 1],
            groups: 1,
            group: 1,
            multiplier: 1,
            ratio: 0.375,
            biases: defaults.biases,
            weights_filler: None,
            biases_filler: None,
            default_weights_filler: defaults.weights_filler,
            default_biases_filler: defaults.biases_filler,
            weights_lrm: defaults.weights_lrm,
            weights_wdm: defaults.weights_wdm,
            biases_lrm: defaults.biases_lrm,
            biases_wdm: defaults.biases_wdm,
            momentum: defaults.momentum,
            eps: defaults.eps,
            scaling: defaults.scaling,
            activation: ActivationKind::Relu,
            alpha: defaults.alpha,
            beta: defaults.beta,
            dropout: defaults.dropout,
            cost: CostFunction::CategoricalCrossEntropy,
            label_index: 0,
            group_index: 0,
            weight: 1.,
            label_true: 1.,
            label_false: 0.,
            factor: [1., 1.],
            algorithm: ResamplingAlgorithm::Linear,
            operation: ReductionAlgorithm::Max,
        }
    }
    fn activation(&self) -> Activation {
        Activation::new(self.activation, self.alpha, self.beta)
    }
}

impl Default for LayerConfig {
    fn default() -> Self {
        Self::new(&ModelDefaults::default())
    }
}

/// Learning rate and weight decay multipliers.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Multipliers {
    /// Weights learning rate.
    pub weights_lrm: f32,
    /// Weights decay.
    pub weights_wdm: f32,
    /// Biases learning rate.
    pub biases_lrm: f32,
    /// Biases decay.
    pub biases_wdm: f32,
}

/// Trainable tensors of a layer with their gradients and optimizer state.
///
/// Weights are held in the engine's physical [`WeightFormat`]. Moments are element aligned with
/// the tensor they belong to, so they are reordered together with it. `running` holds non
/// trainable state that is persisted after the biases (batch norm mean and variance).
#[derive(Clone, Debug)]
pub struct Parameters {
    weight_dims: WeightDims,
    weight_format: WeightFormat,
    pub(crate) weights: Vec<f32>,
    pub(crate) weights_d1: Vec<f32>,
    pub(crate) weights_par: Vec<Vec<f32>>,
    pub(crate) biases: Vec<f32>,
    pub(crate) biases_d1: Vec<f32>,
    pub(crate) biases_par: Vec<Vec<f32>>,
    pub(crate) running: Vec<Vec<f32>>,
    running_init: Vec<f32>,
    pub(crate) scalars: OptimizerScalars,
    weights_filler: Filler,
    biases_filler: Filler,
    multipliers: Multipliers,
    fan: (usize, usize),
}

impl Parameters {
    fn new(
        weight_dims: WeightDims,
        bias_len: usize,
        fillers: (Filler, Filler),
        config: &LayerConfig,
        fan: (usize, usize),
    ) -> Self {
        Self {
            weight_dims,
            weight_format: WeightFormat::Oihw,
            weights: vec![0.; weight_dims.size()],
            weights_d1: vec![0.; weight_dims.size()],
            weights_par: Vec::new(),
            biases: vec![0.; bias_len],
            biases_d1: vec![0.; bias_len],
            biases_par: Vec::new(),
            running: Vec::new(),
            running_init: Vec::new(),
            scalars: OptimizerScalars::default(),
            weights_filler: fillers.0,
            biases_filler: fillers.1,
            multipliers: Multipliers {
                weights_lrm: config.weights_lrm,
                weights_wdm: config.weights_wdm,
                biases_lrm: config.biases_lrm,
                biases_wdm: config.biases_wdm,
            },
            fan,
        }
    }
    /// Adds a persisted non trainable buffer reset to `init`.
    fn with_running(mut self, len: usize, init: f32) -> Self {
        self.running.push(vec![init; len]);
        self.running_init.push(init);
        self
    }
    /// Logical weight dims.
    pub fn weight_dims(&self) -> WeightDims {
        self.weight_dims
    }
    /// Physical weight layout.
    pub fn weight_format(&self) -> WeightFormat {
        self.weight_format
    }
    /// Weights in the physical layout.
    pub fn weights(&self) -> &[f32] {
        &self.weights
    }
    /// Mutable weights in the physical layout.
    pub fn weights_mut(&mut self) -> &mut [f32] {
        &mut self.weights
    }
    /// Biases.
    pub fn biases(&self) -> &[f32] {
        &self.biases
    }
    /// Weight gradient of the last backward.
    pub fn weights_d1(&self) -> &[f32] {
        &self.weights_d1
    }
    /// Bias gradient of the last backward.
    pub fn biases_d1(&self) -> &[f32] {
        &self.biases_d1
    }
    /// Non trainable persisted buffers.
    pub fn running(&self) -> &[Vec<f32>] {
        &self.running
    }
    /// Optimizer bias correction state.
    pub fn scalars(&self) -> OptimizerScalars {
        self.scalars
    }
    /// Multipliers.
    pub fn multipliers(&self) -> Multipliers {
        self.multipliers
    }
    /// Weight moments.
    pub fn weights_par(&self) -> &[Vec<f32>] {
        &self.weights_par
    }
    /// Bias moments.
    pub fn biases_par(&self) -> &[Vec<f32>] {
        &self.biases_par
    }
    /// Weights and biases element count.
    pub fn len(&self) -> usize {
        self.weight_dims.size() + self.biases.len()
    }
    /// Whether nothing is trainable.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// Switches the physical weight layout, reordering weights, gradients and moments.
    pub(crate) fn set_weight_format(&mut self, engine: &Engine, format: WeightFormat) -> Result<()> {
        if format == self.weight_format {
            return Ok(());
        }
        let (dims, from) = (self.weight_dims, self.weight_format);
        self.weights = engine.reorder_weights(&dims, from, &self.weights, format)?;
        self.weights_d1 = vec![0.; dims.len(format)];
        for par in self.weights_par.iter_mut() {
            *par = engine.reorder_weights(&dims, from, par, format)?;
        }
        self.weight_format = format;
        Ok(())
    }
    /// Weights converted to the persisted [`WeightFormat::Oihw`].
    pub(crate) fn persist(&self, data: &[f32]) -> Result<Vec<f32>> {
        crate::tensor::reordered_weights(
            &self.weight_dims,
            self.weight_format,
            data,
            WeightFormat::Oihw,
        )
    }
    /// Converts persisted weights into the physical layout.
    pub(crate) fn restore(&self, persisted: &[f32]) -> Result<Vec<f32>> {
        crate::tensor::reordered_weights(
            &self.weight_dims,
            WeightFormat::Oihw,
            persisted,
            self.weight_format,
        )
    }
    /// Refills weights and biases, clears gradients, moments and running state.
    pub(crate) fn reset(&mut self) -> Result<()> {
        let (fan_in, fan_out) = self.fan;
        let mut weights = vec![0.; self.weight_dims.size()];
        self.weights_filler.fill(&mut weights, fan_in, fan_out)?;
        self.weights = self.restore(&weights)?;
        self.biases_filler.fill(&mut self.biases, fan_in, fan_out)?;
        for (running, init) in self.running.iter_mut().zip(self.running_init.iter()) {
            running.fill(*init);
        }
        self.weights_par.iter_mut().for_each(|x| x.fill(0.));
        self.biases_par.iter_mut().for_each(|x| x.fill(0.));
        self.scalars = OptimizerScalars::default();
        self.reset_gradients();
        Ok(())
    }
    /// Zeroes the gradients.
    pub(crate) fn reset_gradients(&mut self) {
        self.weights_d1.fill(0.);
        self.biases_d1.fill(0.);
    }
    /// Allocates the moments `optimizer` needs, keeping existing ones of the right shape.
    pub(crate) fn prepare_optimizer(&mut self, optimizer: Optimizer) {
        let moments = optimizer.moments();
        let (w, b) = (self.weights.len(), self.biases.len());
        if self.weights_par.len() != moments
            || self.weights_par.iter().any(|x| x.len() != w)
            || self.biases_par.iter().any(|x| x.len() != b)
        {
            self.weights_par = vec![vec![0.; w]; moments];
            self.biases_par = vec![vec![0.; b]; moments];
            self.scalars = OptimizerScalars::default();
        }
    }
    /// Applies one optimizer step with the stored gradients.
    pub(crate) fn update(&mut self, rate: &TrainingRate) -> Result<()> {
        self.prepare_optimizer(rate.optimizer);
        self.scalars.advance(rate);
        let Multipliers {
            weights_lrm,
            weights_wdm,
            biases_lrm,
            biases_wdm,
        } = self.multipliers;
        let step = Step::new(rate, &self.scalars, weights_lrm, weights_wdm);
        optimizer::update(
            rate.optimizer,
            &step,
            &mut self.weights,
            &self.weights_d1,
            &mut self.weights_par,
        )?;
        let step = Step::new(rate, &self.scalars, biases_lrm, biases_wdm);
        optimizer::update(
            rate.optimizer,
            &step,
            &mut self.biases,
            &self.biases_d1,
            &mut self.biases_par,
        )
    }
    /// Name of the first buffer holding a NaN or Inf.
    pub(crate) fn find_non_finite(&self) -> Option<String> {
        let finite = |x: &[f32]| x.iter().all(|x| x.is_finite());
        if !finite(&self.weights) {
            return Some("weights".into());
        }
        if !finite(&self.biases) {
            return Some("biases".into());
        }
        for (k, par) in self.weights_par.iter().enumerate() {
            if !finite(par) {
                return Some(format!("weights moment {}", k + 1));
            }
        }
        for (k, par) in self.biases_par.iter().enumerate() {
            if !finite(par) {
                return Some(format!("biases moment {}", k + 1));
            }
        }
        let scalars = self.scalars.as_array();
        if !finite(&scalars) {
            return Some("optimizer scalars".into());
        }
        None
    }
}

/// Read only view of a layer buffer.
#[derive(Clone, Copy)]
pub(crate) struct TensorRef<'a> {
    pub(crate) desc: MemoryDesc,
    pub(crate) data: &'a [f32],
}

/// Mutable view of a layer buffer.
pub(crate) struct TensorMut<'a> {
    pub(crate) desc: MemoryDesc,
    pub(crate) data: &'a mut [f32],
}

/// A label stream, `columns` labels per sample.
#[derive(Clone, Copy)]
pub(crate) struct Labels<'a> {
    pub(crate) data: &'a [usize],
    pub(crate) columns: usize,
}

/// Arguments of [`Operator::initialize`].
pub(crate) struct InitContext<'a> {
    pub(crate) engine: &'a Engine,
    pub(crate) name: &'a str,
    pub(crate) batch: usize,
    pub(crate) inputs: &'a [MemoryDesc],
    pub(crate) dims: Dims,
}

impl InitContext<'_> {
    /// The output desc for `format`.
    pub(crate) fn output(&self, format: Format) -> MemoryDesc {
        MemoryDesc::new(self.batch, self.dims, format)
    }
    /// Format of the first input.
    pub(crate) fn input_format(&self) -> Format {
        self.inputs.first().map(|x| x.format).unwrap_or_default()
    }
}

/// Arguments of [`Operator::forward`].
pub(crate) struct ForwardIo<'a> {
    pub(crate) engine: &'a Engine,
    pub(crate) stream: &'a Stream,
    pub(crate) training: bool,
    pub(crate) inputs: Vec<TensorRef<'a>>,
    pub(crate) output: TensorMut<'a>,
    /// Output gradient, only passed to operators that [reset](Operator::resets_gradient) it.
    pub(crate) d_output: Option<&'a mut [f32]>,
    pub(crate) labels: Option<Labels<'a>>,
}

/// Where backward reads the output gradient and writes the input gradients.
pub(crate) enum Gradient<'a> {
    /// The output gradient aliases the gradient of the single input, it is replaced.
    InPlace(&'a mut [f32]),
    /// Separate buffers, `None` inputs do not need a gradient.
    Separate {
        d_output: Option<&'a [f32]>,
        d_inputs: Vec<Option<&'a mut [f32]>>,
    },
}

/// Arguments of [`Operator::backward`].
pub(crate) struct BackwardIo<'a> {
    pub(crate) engine: &'a Engine,
    pub(crate) stream: &'a Stream,
    pub(crate) inputs: Vec<TensorRef<'a>>,
    pub(crate) output: TensorRef<'a>,
    pub(crate) gradient: Gradient<'a>,
    /// Per input, add to the gradient instead of storing.
    pub(crate) accumulate: Vec<bool>,
}

impl<'a> BackwardIo<'a> {
    /// Splits a [`Gradient::Separate`], failing for in place gradients.
    pub(crate) fn separate(
        &mut self,
    ) -> Result<(&'a [f32], Vec<Option<&'a mut [f32]>>)> {
        let gradient = std::mem::replace(
            &mut self.gradient,
            Gradient::Separate {
                d_output: None,
                d_inputs: Vec::new(),
            },
        );
        match gradient {
            Gradient::Separate {
                d_output: Some(d_output),
                d_inputs,
            } => Ok((d_output, d_inputs)),
            Gradient::Separate { d_output: None, .. } => bail!("Missing output gradient!"),
            Gradient::InPlace(_) => bail!("In place gradient not supported!"),
        }
    }
}

/// The contract every layer operator implements.
pub(crate) trait Operator: Send + Sync {
    /// Output dims for `inputs`.
    fn output_dims(&self, inputs: &[Dims]) -> Result<Dims>;
    /// Fan in used by the fillers.
    fn fan_in(&self) -> usize {
        1
    }
    /// Fan out used by the fillers.
    fn fan_out(&self) -> usize {
        1
    }
    /// Chooses the output format and builds primitives for `ctx.batch`.
    fn initialize(&mut self, ctx: &InitContext) -> Result<Format>;
    /// Computes the output. In training, operators that [reset](Self::resets_gradient) the
    /// output gradient receive it in `io.d_output`.
    fn forward(&mut self, io: ForwardIo) -> Result<()>;
    /// Propagates the output gradient into the inputs and the parameter gradients.
    fn backward(&mut self, io: BackwardIo) -> Result<()>;
    /// Whether training forward zeroes the output gradient itself.
    fn resets_gradient(&self) -> bool {
        false
    }
    /// Trainable and persisted buffers, `None` for operators without any.
    fn parameters(&self) -> Option<&Parameters> {
        None
    }
    /// Mutable [`parameters`](Self::parameters).
    fn parameters_mut(&mut self) -> Option<&mut Parameters> {
        None
    }
}

/// The implicit first layer, its neurons are written by the model.
#[derive(Debug)]
pub(crate) struct Input {
    dims: Dims,
}

impl Operator for Input {
    /// The dims set by the model, or the new resolution when given.
    fn output_dims(&self, inputs: &[Dims]) -> Result<Dims> {
        Ok(inputs.first().copied().unwrap_or(self.dims))
    }
    fn initialize(&mut self, _ctx: &InitContext) -> Result<Format> {
        Ok(Format::Plain)
    }
    fn forward(&mut self, _io: ForwardIo) -> Result<()> {
        Ok(())
    }
    fn backward(&mut self, _io: BackwardIo) -> Result<()> {
        Ok(())
    }
}

/// The operator of a layer.
pub(crate) enum LayerKind {
    Input(Input),
    Activation(activation::ActivationLayer),
    Binary(binary::Binary),
    Channel(channel::ChannelMap),
    Conv(conv::Conv),
    Dense(dense::Dense),
    Pool(pool::Pool),
    BatchNorm(norm::BatchNorm),
    LayerNorm(norm::LayerNorm),
    Softmax(softmax::Softmax),
    Resample(resample::Resample),
    Reduction(reduction::Reduction),
    Dropout(dropout::Dropout),
    Cost(cost::Cost),
}

impl LayerKind {
    fn new(
        layer_type: LayerType,
        config: &LayerConfig,
        inputs: &[(LayerType, Dims)],
    ) -> Result<Self> {
        let input = inputs.first().map(|x| x.1).unwrap_or_default();
        let kind = match layer_type {
            LayerType::Input => Self::Input(Input { dims: input }),
            LayerType::Activation => {
                Self::Activation(activation::ActivationLayer::new(config.activation()))
            }
            t if t.is_binary() => Self::Binary(binary::Binary::new(t, inputs)),
            LayerType::Concat
            | LayerType::ChannelSplit
            | LayerType::ChannelSplitRatioLeft
            | LayerType::ChannelSplitRatioRight
            | LayerType::ChannelZeroPad
            | LayerType::Shuffle => Self::Channel(channel::ChannelMap::new(layer_type, config, inputs)?),
            LayerType::Convolution
            | LayerType::DepthwiseConvolution
            | LayerType::PartialDepthwiseConvolution
            | LayerType::ConvolutionTranspose => {
                Self::Conv(conv::Conv::new(layer_type, config, input)?)
            }
            LayerType::Dense => Self::Dense(dense::Dense::new(config, input)?),
            LayerType::MaxPooling
            | LayerType::AvgPooling
            | LayerType::GlobalMaxPooling
            | LayerType::GlobalAvgPooling => Self::Pool(pool::Pool::new(layer_type, config)),
            t if t.is_batch_norm() => Self::BatchNorm(norm::BatchNorm::new(t, config, input)?),
            LayerType::LayerNorm => Self::LayerNorm(norm::LayerNorm::new(config, input)),
            LayerType::Softmax => Self::Softmax(softmax::Softmax::new(false)),
            LayerType::LogSoftmax => Self::Softmax(softmax::Softmax::new(true)),
            LayerType::Resampling => Self::Resample(resample::Resample::new(config)),
            LayerType::Reduction => Self::Reduction(reduction::Reduction::new(config.operation)),
            LayerType::Dropout => Self::Dropout(dropout::Dropout::new(config.dropout)),
            LayerType::Cost => Self::Cost(cost::Cost::new(config, inputs[0].0)),
            t => bail!("Layer type {t} has no operator!"),
        };
        Ok(kind)
    }
    pub(crate) fn operator(&self) -> &dyn Operator {
        match self {
            Self::Input(op) => op,
            Self::Activation(op) => op,
            Self::Binary(op) => op,
            Self::Channel(op) => op,
            Self::Conv(op) => op,
            Self::Dense(op) => op,
            Self::Pool(op) => op,
            Self::BatchNorm(op) => op,
            Self::LayerNorm(op) => op,
            Self::Softmax(op) => op,
            Self::Resample(op) => op,
            Self::Reduction(op) => op,
            Self::Dropout(op) => op,
            Self::Cost(op) => op,
        }
    }
    pub(crate) fn operator_mut(&mut self) -> &mut dyn Operator {
        match self {
            Self::Input(op) => op,
            Self::Activation(op) => op,
            Self::Binary(op) => op,
            Self::Channel(op) => op,
            Self::Conv(op) => op,
            Self::Dense(op) => op,
            Self::Pool(op) => op,
            Self::BatchNorm(op) => op,
            Self::LayerNorm(op) => op,
            Self::Softmax(op) => op,
            Self::Resample(op) => op,
            Self::Reduction(op) => op,
            Self::Dropout(op) => op,
            Self::Cost(op) => op,
        }
    }
}

/// Statistics of the buffers of a layer, refreshed on demand.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LayerStatistics {
    /// Neurons.
    pub neurons: Statistics,
    /// Weights, if any.
    pub weights: Option<Statistics>,
    /// Biases, if any.
    pub biases: Option<Statistics>,
}

/// A node of the model graph.
pub struct Layer {
    name: String,
    layer_type: LayerType,
    inputs: Vec<usize>,
    dims: Dims,
    format: Format,
    locked: bool,
    stats: Mutex<LayerStatistics>,
    pub(crate) kind: LayerKind,
}

impl Layer {
    /// Creates a layer of `layer_type` reading `inputs`, given their types and dims.
    ///
    /// # Panics
    ///
    /// The number of inputs does not fit the type, or a binary layer receives inputs with
    /// different channel counts.
    ///
    /// **Errors**
    ///
    /// The geometry produces no output, ie a kernel larger than the padded input.
    pub fn new(
        name: impl Into<String>,
        layer_type: LayerType,
        config: &LayerConfig,
        inputs: Vec<usize>,
        input_info: &[(LayerType, Dims)],
    ) -> Result<Self> {
        assert!(
            layer_type.arity().accepts(inputs.len()) && inputs.len() == input_info.len(),
            "{layer_type} cannot take {} inputs!",
            inputs.len()
        );
        let kind = LayerKind::new(layer_type, config, input_info)?;
        let input_dims: Vec<Dims> = input_info.iter().map(|x| x.1).collect();
        let dims = kind.operator().output_dims(&input_dims)?;
        Ok(Self {
            name: name.into(),
            layer_type,
            inputs,
            dims,
            format: Format::Plain,
            locked: false,
            stats: Mutex::default(),
            kind,
        })
    }
    /// The implicit input layer.
    pub fn input(dims: Dims) -> Self {
        Self {
            name: "Input".into(),
            layer_type: LayerType::Input,
            inputs: Vec::new(),
            dims,
            format: Format::Plain,
            locked: false,
            stats: Mutex::default(),
            kind: LayerKind::Input(Input { dims }),
        }
    }
    /// The name.
    pub fn name(&self) -> &str {
        &self.name
    }
    /// The type.
    pub fn layer_type(&self) -> LayerType {
        self.layer_type
    }
    /// Indices of the input layers.
    pub fn inputs(&self) -> &[usize] {
        &self.inputs
    }
    /// Output dims per sample.
    pub fn dims(&self) -> Dims {
        self.dims
    }
    /// Negotiated output format.
    pub fn format(&self) -> Format {
        self.format
    }
    /// Whether [`update_weights`](super::Model::update_weights) skips this layer.
    pub fn is_locked(&self) -> bool {
        self.locked
    }
    /// Locks or unlocks weight updates.
    pub fn set_locked(&mut self, locked: bool) {
        self.locked = locked;
    }
    /// Trainable parameters, `None` for layers without any.
    pub fn parameters(&self) -> Option<&Parameters> {
        self.kind.operator().parameters()
    }
    /// Mutable parameters.
    pub fn parameters_mut(&mut self) -> Option<&mut Parameters> {
        self.kind.operator_mut().parameters_mut()
    }
    /// Whether training forward zeroes the output gradient itself.
    pub(crate) fn resets_gradient(&self) -> bool {
        self.kind.operator().resets_gradient()
    }
    /// Number of weights.
    pub fn weight_count(&self) -> usize {
        self.parameters().map_or(0, |p| p.weight_dims.size())
    }
    /// Number of biases.
    pub fn bias_count(&self) -> usize {
        self.parameters().map_or(0, |p| p.biases.len())
    }
    /// Fan in.
    pub fn fan_in(&self) -> usize {
        self.kind.operator().fan_in()
    }
    /// Fan out.
    pub fn fan_out(&self) -> usize {
        self.kind.operator().fan_out()
    }
    /// Cost metrics, `None` unless this is a cost layer.
    pub fn cost_metrics(&self) -> Option<&CostMetrics> {
        match &self.kind {
            LayerKind::Cost(cost) => Some(cost.metrics()),
            _ => None,
        }
    }
    pub(crate) fn cost_mut(&mut self) -> Option<&mut cost::Cost> {
        match &mut self.kind {
            LayerKind::Cost(cost) => Some(cost),
            _ => None,
        }
    }
    /// Weighted mean loss of the last batch scored by a cost layer.
    pub fn batch_loss(&self) -> Option<f32> {
        match &self.kind {
            LayerKind::Cost(cost) => Some(cost.batch_loss()),
            _ => None,
        }
    }
    /// Loss function of a cost layer.
    pub fn cost_function(&self) -> Option<CostFunction> {
        match &self.kind {
            LayerKind::Cost(cost) => Some(cost.function()),
            _ => None,
        }
    }
    pub(crate) fn group_index(&self) -> Option<usize> {
        match &self.kind {
            LayerKind::Cost(cost) => Some(cost.group_index()),
            _ => None,
        }
    }
    /// Last refreshed statistics.
    pub fn statistics(&self) -> LayerStatistics {
        *self.stats.lock()
    }
    /// Recomputes the output dims from the inputs.
    pub(crate) fn update_resolution(&mut self, input_dims: &[Dims]) -> Result<()> {
        self.dims = self.kind.operator().output_dims(input_dims)?;
        if let LayerKind::Input(input) = &mut self.kind {
            input.dims = self.dims;
        }
        Ok(())
    }
    /// Builds primitives for a batch size and returns the output desc.
    pub(crate) fn initialize(
        &mut self,
        engine: &Engine,
        batch: usize,
        inputs: &[MemoryDesc],
    ) -> Result<MemoryDesc> {
        let ctx = InitContext {
            engine,
            name: &self.name,
            batch,
            inputs,
            dims: self.dims,
        };
        self.format = self.kind.operator_mut().initialize(&ctx)?;
        log::debug!("{} {} -> {:?} {}", self.layer_type, self.name, self.dims, self.format);
        Ok(MemoryDesc::new(batch, self.dims, self.format))
    }
    pub(crate) fn forward(&mut self, io: ForwardIo) -> Result<()> {
        self.kind.operator_mut().forward(io)
    }
    pub(crate) fn backward(&mut self, io: BackwardIo) -> Result<()> {
        self.kind.operator_mut().backward(io)
    }
    /// Computes statistics of `neurons` and the parameters, `false` when any blew up.
    ///
    /// Rejected statistics are stored as zero.
    pub(crate) fn refresh_statistics(&self, neurons: &[f32]) -> bool {
        let mut sane = true;
        let mut compute = |data: &[f32]| {
            stats::compute(data).unwrap_or_else(|| {
                sane = false;
                Statistics::default()
            })
        };
        let neurons = compute(neurons);
        let (weights, biases) = match self.parameters() {
            Some(p) if !p.is_empty() => (
                Some(compute(&p.weights)),
                (!p.biases.is_empty()).then(|| compute(&p.biases)),
            ),
            _ => (None, None),
        };
        *self.stats.lock() = LayerStatistics {
            neurons,
            weights,
            biases,
        };
        if !sane {
            log::warn!("Layer {} statistics rejected", self.name);
        }
        sane
    }
}

impl fmt::Debug for Layer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Layer")
            .field("name", &self.name)
            .field("layer_type", &self.layer_type)
            .field("inputs", &self.inputs)
            .field("dims", &self.dims)
            .field("format", &self.format)
            .field("locked", &self.locked)
            .finish()
    }
}

/// Zeroes the channel padding lanes of every sample.
pub(crate) fn zero_padding(desc: &MemoryDesc, data: &mut [f32]) {
    if !desc.has_padding() {
        return;
    }
    let spatial = desc.dims.spatial();
    let sample_len = desc.sample_len();
    let last = desc.blocks() - 1;
    let valid = desc.dims.c % VECTOR_SIZE;
    for sample in data.chunks_mut(sample_len).take(desc.batch) {
        for s in 0..spatial {
            let start = (last * spatial + s) * VECTOR_SIZE;
            sample[start + valid..start + VECTOR_SIZE].fill(0.);
        }
    }
}

/// Stores or adds `src` into `dst`.
pub(crate) fn write_slice(dst: &mut [f32], src: &[f32], accumulate: bool) {
    if accumulate {
        dst.iter_mut().zip(src).for_each(|(y, x)| *y += *x);
    } else {
        dst.copy_from_slice(src);
    }
}

/// Executes a primitive built by [`Operator::initialize`] and waits for it.
pub(crate) fn execute(primitive: Option<&Primitive>, stream: &Stream, args: ExecArgs) -> Result<()> {
    let Some(primitive) = primitive else {
        bail!("Layer executed before initialization!");
    };
    primitive.execute(stream, args)?;
    stream.wait()
}
