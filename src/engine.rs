//! The compute backend.
//!
//! Layers describe an operation with a [`PrimitiveDesc`] (operation kind plus the
//! [`MemoryDesc`]s of its operands), build it into a [`Primitive`] once per batch size, and then
//! [`execute`](Primitive::execute) it on a [`Stream`] with an [`ExecArgs`] binding buffers to
//! [`ArgRole`]s. Execution is synchronous with respect to [`Stream::wait`].
//!
//! The host engine accepts sources in any [`Format`] and writes destinations in the format of the
//! destination desc, so layers only negotiate formats, never convert explicitly.
use crate::tensor::{self, Format, MemoryDesc, WeightDims, WeightFormat};
use anyhow::{bail, format_err, Result};
use derive_more::Display;
use std::{
    str::FromStr,
    sync::atomic::{AtomicUsize, Ordering},
};

mod binary;
mod conv;
mod inner_product;
mod norm;
mod pool;
mod reduction;
mod resample;
mod softmax;

#[cfg(test)]
mod tests;

pub use binary::BinaryAlgorithm;
pub use reduction::ReductionAlgorithm;
pub use resample::ResamplingAlgorithm;

/// Host compute engine.
#[derive(Clone, Debug)]
pub struct Engine {
    format_hint: Format,
}

impl Default for Engine {
    fn default() -> Self {
        Self::host()
    }
}

impl Engine {
    /// The host engine, preferring [`Format::Blocked`] outputs for convolutions.
    pub fn host() -> Self {
        Self {
            format_hint: Format::Blocked,
        }
    }
    /// Overrides the preferred layout.
    pub fn with_format_hint(self, format_hint: Format) -> Self {
        Self { format_hint }
    }
    /// The preferred layout.
    pub fn format_hint(&self) -> Format {
        self.format_hint
    }
    /// Worker threads.
    pub fn threads(&self) -> usize {
        rayon::current_num_threads()
    }
    /// Destination layout the engine chooses for convolution outputs ("any").
    pub fn preferred_format(&self) -> Format {
        self.format_hint
    }
    /// Weight layout the engine consumes for a convolution writing `dst`.
    pub fn preferred_weight_format(&self, dst: Format) -> WeightFormat {
        match dst {
            Format::Plain => WeightFormat::Oihw,
            Format::Blocked => WeightFormat::Blocked,
        }
    }
    /// Creates a stream.
    pub fn stream(&self) -> Stream {
        Stream::default()
    }
    /// Converts activations between layouts.
    pub fn reorder(
        &self,
        src: &MemoryDesc,
        src_data: &[f32],
        dst: &MemoryDesc,
        dst_data: &mut [f32],
    ) -> Result<()> {
        tensor::reorder(src, src_data, dst, dst_data)
    }
    /// Converts weights between layouts.
    pub fn reorder_weights(
        &self,
        dims: &WeightDims,
        src_format: WeightFormat,
        src: &[f32],
        dst_format: WeightFormat,
    ) -> Result<Vec<f32>> {
        tensor::reordered_weights(dims, src_format, src, dst_format)
    }
}

/// A queue of primitive executions.
#[derive(Debug, Default)]
pub struct Stream {
    submitted: AtomicUsize,
    completed: AtomicUsize,
}

impl Stream {
    /// Blocks until every submitted primitive finished.
    ///
    /// **Errors**
    ///
    /// A submitted primitive did not complete.
    pub fn wait(&self) -> Result<()> {
        let submitted = self.submitted.load(Ordering::Acquire);
        let completed = self.completed.load(Ordering::Acquire);
        if submitted != completed {
            bail!("Stream has {} unfinished primitives!", submitted - completed);
        }
        Ok(())
    }
    /// Primitives executed so far.
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::Acquire)
    }
}

/// Role a buffer plays in a primitive execution.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq, Hash)]
pub enum ArgRole {
    /// Source.
    Src,
    /// Second source of a binary op.
    Src1,
    /// Weights.
    Weights,
    /// Bias.
    Bias,
    /// Destination.
    Dst,
    /// Gradient of the destination.
    DiffDst,
    /// Gradient of the source.
    DiffSrc,
    /// Gradient of the weights.
    DiffWeights,
    /// Gradient of the bias.
    DiffBias,
    /// Normalization mean.
    Mean,
    /// Normalization variance.
    Variance,
    /// Normalization scale.
    Scale,
    /// Normalization shift.
    Shift,
    /// Scratch kept between forward and backward.
    Workspace,
}

/// Buffers bound to roles for one execution.
#[derive(Default)]
pub struct ExecArgs<'a> {
    inputs: Vec<(ArgRole, &'a [f32])>,
    outputs: Vec<(ArgRole, &'a mut [f32])>,
    accumulate: bool,
}

impl<'a> ExecArgs<'a> {
    /// Empty bindings.
    pub fn new() -> Self {
        Self::default()
    }
    /// Binds a read only buffer.
    pub fn input(mut self, role: ArgRole, data: &'a [f32]) -> Self {
        self.inputs.push((role, data));
        self
    }
    /// Binds a written buffer.
    pub fn output(mut self, role: ArgRole, data: &'a mut [f32]) -> Self {
        self.outputs.push((role, data));
        self
    }
    /// Adds to [`ArgRole::DiffSrc`] instead of overwriting it.
    pub fn accumulate(mut self, accumulate: bool) -> Self {
        self.accumulate = accumulate;
        self
    }
    fn get(&self, role: ArgRole) -> Result<&'a [f32]> {
        self.try_get(role)
            .ok_or_else(|| format_err!("Missing argument {role}!"))
    }
    fn try_get(&self, role: ArgRole) -> Option<&'a [f32]> {
        self.inputs
            .iter()
            .find(|(r, _)| *r == role)
            .map(|(_, data)| *data)
    }
    fn take(&mut self, role: ArgRole) -> Result<&'a mut [f32]> {
        self.try_take(role)
            .ok_or_else(|| format_err!("Missing argument {role}!"))
    }
    fn try_take(&mut self, role: ArgRole) -> Option<&'a mut [f32]> {
        let index = self.outputs.iter().position(|(r, _)| *r == role)?;
        Some(self.outputs.swap_remove(index).1)
    }
}

fn check_len(role: ArgRole, data: &[f32], len: usize) -> Result<()> {
    if data.len() < len {
        bail!("{role} has {} elements, expected {len}!", data.len());
    }
    Ok(())
}

/// Which pass a primitive computes.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq, Hash)]
pub enum Propagation {
    /// Forward training or inference.
    Forward,
    /// Gradient of the source.
    BackwardData,
    /// Gradient of the weights and bias.
    BackwardWeights,
}

/// Convolution geometry shared by convolution and deconvolution.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ConvDesc {
    /// Source.
    pub src: MemoryDesc,
    /// Destination.
    pub dst: MemoryDesc,
    /// Weight dims, `i` is per group.
    pub weights: WeightDims,
    /// Physical weight layout.
    pub weight_format: WeightFormat,
    /// Whether a bias is added.
    pub bias: bool,
    /// Stride `[h, w]`.
    pub stride: [usize; 2],
    /// Dilation `[h, w]`, 1 is dense.
    pub dilation: [usize; 2],
    /// Padding `[h, w]`.
    pub pad: [usize; 2],
    /// Groups.
    pub groups: usize,
    /// First source channel read.
    pub src_channel_offset: usize,
    /// Source channels read.
    pub src_channels: usize,
}

/// Output extent of a convolution, `None` when the window does not fit.
pub fn conv_output_size(
    input: usize,
    kernel: usize,
    stride: usize,
    dilation: usize,
    pad: usize,
) -> Option<usize> {
    let span = dilation * kernel.checked_sub(1)? + 1;
    if stride == 0 {
        return None;
    }
    (input + 2 * pad)
        .checked_sub(span)
        .map(|x| x / stride + 1)
}

/// Output extent of a transposed convolution.
pub fn deconv_output_size(
    input: usize,
    kernel: usize,
    stride: usize,
    dilation: usize,
    pad: usize,
) -> Option<usize> {
    let span = dilation * kernel.checked_sub(1)? + 1;
    (input.checked_sub(1)? * stride + span).checked_sub(2 * pad)
}

impl ConvDesc {
    fn validate(&self, transposed: bool) -> Result<()> {
        let Self {
            src,
            dst,
            weights,
            groups,
            src_channel_offset,
            src_channels,
            stride,
            dilation,
            pad,
            ..
        } = self;
        if src.batch != dst.batch {
            bail!("Batch mismatch {} != {}!", src.batch, dst.batch);
        }
        if src.dims.d != 1 || dst.dims.d != 1 {
            bail!("Only 2d convolutions are supported!");
        }
        if *groups == 0 || src_channels % groups != 0 || dst.dims.c % groups != 0 {
            bail!(
                "Channels {} -> {} not divisible by groups {groups}!",
                src_channels,
                dst.dims.c
            );
        }
        if src_channel_offset + src_channels > src.dims.c {
            bail!(
                "Channel slice {src_channel_offset}..{} out of range {}!",
                src_channel_offset + src_channels,
                src.dims.c
            );
        }
        if weights.o != dst.dims.c || weights.i != src_channels / groups {
            bail!("Weights {weights:?} do not match {src_channels} -> {}!", dst.dims.c);
        }
        for (axis, (i, o)) in [(src.dims.h, dst.dims.h), (src.dims.w, dst.dims.w)]
            .into_iter()
            .enumerate()
        {
            let k = [weights.kh, weights.kw][axis];
            let expected = if transposed {
                deconv_output_size(i, k, stride[axis], dilation[axis], pad[axis])
            } else {
                conv_output_size(i, k, stride[axis], dilation[axis], pad[axis])
            };
            if expected != Some(o) {
                bail!("Convolution output {o} does not match {expected:?} for input {i}!");
            }
        }
        Ok(())
    }
}

/// Inner product with flattened source.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct InnerProductDesc {
    /// Source.
    pub src: MemoryDesc,
    /// Destination, unit spatial.
    pub dst: MemoryDesc,
    /// Whether a bias is added.
    pub bias: bool,
}

/// Pooling algorithm.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq, Hash)]
pub enum PoolingAlgorithm {
    /// Max, records the argmax in the workspace.
    Max,
    /// Average over the window positions inside the source.
    AvgExcludePadding,
}

/// Pooling geometry.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PoolDesc {
    /// Source.
    pub src: MemoryDesc,
    /// Destination.
    pub dst: MemoryDesc,
    /// Algorithm.
    pub algorithm: PoolingAlgorithm,
    /// Kernel `[h, w]`.
    pub kernel: [usize; 2],
    /// Stride `[h, w]`.
    pub stride: [usize; 2],
    /// Padding `[h, w]`.
    pub pad: [usize; 2],
}

/// Normalization with given statistics.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NormDesc {
    /// Source and destination.
    pub desc: MemoryDesc,
    /// Added to the variance.
    pub eps: f32,
    /// Whether scale and shift are applied.
    pub scale_shift: bool,
}

/// Softmax over channels.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SoftmaxDesc {
    /// Source and destination.
    pub desc: MemoryDesc,
    /// Computes log softmax.
    pub log: bool,
}

/// Elementwise binary op, either source may be spatially broadcast.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BinaryDesc {
    /// First source.
    pub src0: MemoryDesc,
    /// Second source.
    pub src1: MemoryDesc,
    /// Destination.
    pub dst: MemoryDesc,
    /// Operation.
    pub algorithm: BinaryAlgorithm,
    /// Computes `src1 op src0` instead of `src0 op src1`.
    pub reversed: bool,
}

/// Spatial resampling.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ResamplingDesc {
    /// Source.
    pub src: MemoryDesc,
    /// Destination.
    pub dst: MemoryDesc,
    /// Interpolation.
    pub algorithm: ResamplingAlgorithm,
}

/// Reduction over channels.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ReductionDesc {
    /// Source.
    pub src: MemoryDesc,
    /// Destination, one channel.
    pub dst: MemoryDesc,
    /// Operation.
    pub algorithm: ReductionAlgorithm,
}

/// Description of an operation, built into a [`Primitive`].
#[derive(Clone, Debug, PartialEq)]
pub enum PrimitiveDesc {
    /// Convolution.
    Convolution(ConvDesc, Propagation),
    /// Transposed convolution.
    Deconvolution(ConvDesc, Propagation),
    /// Inner product.
    InnerProduct(InnerProductDesc, Propagation),
    /// Pooling, forward or backward data.
    Pooling(PoolDesc, Propagation),
    /// Batch normalization with global statistics.
    BatchNorm(NormDesc),
    /// Layer normalization.
    LayerNorm(NormDesc),
    /// Softmax.
    Softmax(SoftmaxDesc),
    /// Binary.
    Binary(BinaryDesc),
    /// Resampling, forward or backward data.
    Resampling(ResamplingDesc, Propagation),
    /// Reduction.
    Reduction(ReductionDesc),
}

/// A validated, executable [`PrimitiveDesc`].
#[derive(Clone, Debug)]
pub struct Primitive {
    desc: PrimitiveDesc,
    threads: usize,
}

impl Primitive {
    /// Builds the primitive.
    ///
    /// **Errors**
    ///
    /// The layouts are structurally incompatible.
    pub fn new(engine: &Engine, desc: PrimitiveDesc) -> Result<Self> {
        match &desc {
            PrimitiveDesc::Convolution(conv, _) => conv.validate(false)?,
            PrimitiveDesc::Deconvolution(conv, _) => conv.validate(true)?,
            PrimitiveDesc::InnerProduct(ip, _) => {
                if ip.src.batch != ip.dst.batch || !ip.dst.dims.is_unit_spatial() {
                    bail!("Inner product {:?} -> {:?} not supported!", ip.src, ip.dst);
                }
            }
            PrimitiveDesc::Pooling(pool, _) => pool::validate(pool)?,
            PrimitiveDesc::BatchNorm(_) | PrimitiveDesc::LayerNorm(_) => (),
            PrimitiveDesc::Softmax(_) => (),
            PrimitiveDesc::Binary(binary) => binary::validate(binary)?,
            PrimitiveDesc::Resampling(resampling, propagation) => {
                if *propagation == Propagation::BackwardWeights
                    || resampling.src.dims.c != resampling.dst.dims.c
                {
                    bail!("Resampling {resampling:?} {propagation} not supported!");
                }
            }
            PrimitiveDesc::Reduction(reduction) => {
                if reduction.dst.dims.c != 1 || reduction.src.dims.spatial() != reduction.dst.dims.spatial() {
                    bail!("Reduction {:?} -> {:?} not supported!", reduction.src, reduction.dst);
                }
            }
        }
        Ok(Self {
            desc,
            threads: engine.threads(),
        })
    }
    /// The description.
    pub fn desc(&self) -> &PrimitiveDesc {
        &self.desc
    }
    /// Executes on `stream`.
    ///
    /// **Errors**
    ///
    /// A required argument is missing or too small.
    pub fn execute(&self, stream: &Stream, args: ExecArgs) -> Result<()> {
        stream.submitted.fetch_add(1, Ordering::AcqRel);
        let result = self.execute_impl(args);
        stream.completed.fetch_add(1, Ordering::AcqRel);
        result
    }
    fn execute_impl(&self, mut args: ExecArgs) -> Result<()> {
        let threads = self.threads;
        match &self.desc {
            PrimitiveDesc::Convolution(desc, propagation) => match propagation {
                Propagation::Forward => conv::forward(desc, threads, &mut args),
                Propagation::BackwardData => conv::backward_data(desc, threads, &mut args),
                Propagation::BackwardWeights => conv::backward_weights(desc, threads, &mut args),
            },
            PrimitiveDesc::Deconvolution(desc, propagation) => match propagation {
                Propagation::Forward => conv::deconv_forward(desc, threads, &mut args),
                Propagation::BackwardData => conv::deconv_backward_data(desc, threads, &mut args),
                Propagation::BackwardWeights => {
                    conv::deconv_backward_weights(desc, threads, &mut args)
                }
            },
            PrimitiveDesc::InnerProduct(desc, propagation) => match propagation {
                Propagation::Forward => inner_product::forward(desc, &mut args),
                Propagation::BackwardData => inner_product::backward_data(desc, &mut args),
                Propagation::BackwardWeights => inner_product::backward_weights(desc, &mut args),
            },
            PrimitiveDesc::Pooling(desc, propagation) => match propagation {
                Propagation::Forward => pool::forward(desc, threads, &mut args),
                Propagation::BackwardData => pool::backward(desc, threads, &mut args),
                Propagation::BackwardWeights => bail!("Pooling has no weights!"),
            },
            PrimitiveDesc::BatchNorm(desc) => norm::batch_norm_inference(desc, threads, &mut args),
            PrimitiveDesc::LayerNorm(desc) => norm::layer_norm_inference(desc, threads, &mut args),
            PrimitiveDesc::Softmax(desc) => softmax::forward(desc, threads, &mut args),
            PrimitiveDesc::Binary(desc) => binary::forward(desc, threads, &mut args),
            PrimitiveDesc::Resampling(desc, propagation) => match propagation {
                Propagation::Forward => resample::forward(desc, threads, &mut args),
                _ => resample::backward(desc, threads, &mut args),
            },
            PrimitiveDesc::Reduction(desc) => reduction::forward(desc, threads, &mut args),
        }
    }
}

/// Parses an enum from its exact name.
pub(crate) fn parse_variant<T: Copy>(s: &str, variants: &[(&str, T)], what: &str) -> Result<T> {
    variants
        .iter()
        .find(|(name, _)| *name == s)
        .map(|(_, x)| *x)
        .ok_or_else(|| format_err!("Unknown {what} {s:?}!"))
}

impl FromStr for PoolingAlgorithm {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        parse_variant(
            s,
            &[("Max", Self::Max), ("Avg", Self::AvgExcludePadding)],
            "pooling algorithm",
        )
    }
}
