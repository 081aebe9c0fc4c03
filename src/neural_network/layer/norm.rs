//! Batch normalization (optionally fused with an activation and dropout) and layer normalization.
//!
//! Training runs hand written kernels on batch statistics, generic over [`Lane`] so plain and
//! blocked layouts share one body: a plain channel is a lane group of width 1, a blocked channel
//! block a group of width 8. Inference delegates to the engine with the running statistics.
use super::{
    dropout::fill_mask, execute, lane::Lane, zero_padding, Activation, BackwardIo, ForwardIo,
    Gradient, InitContext, LayerConfig, LayerType, Operator, Parameters, TensorRef,
};
use crate::{
    engine::{ArgRole, ExecArgs, NormDesc, Primitive, PrimitiveDesc},
    neural_network::filler::Filler,
    tensor::{
        parallel::{for_i, get_threads, SyncSliceMut},
        Dims, Format, MemoryDesc, WeightDims,
    },
};
use anyhow::{bail, Result};
use wide::f32x8;

/// Scale and shift of a norm layer, fixed to 1 and 0 unless `scaling`.
fn norm_parameters(config: &LayerConfig, channels: usize) -> Parameters {
    let (weights, biases) = if config.scaling {
        (WeightDims::new(channels, 1, 1, 1), channels)
    } else {
        (WeightDims::new(0, 1, 1, 1), 0)
    };
    let fillers = (
        config.weights_filler.unwrap_or(Filler::Constant(1.)),
        config.biases_filler.unwrap_or(Filler::Constant(0.)),
    );
    Parameters::new(weights, biases, fillers, config, (1, 1))
}

/// Per channel scale and shift padded to `stored` channels, padding lanes are 0.
fn padded_scale_shift(parameters: &Parameters, channels: usize, stored: usize) -> (Vec<f32>, Vec<f32>) {
    let mut scale = vec![0.; stored];
    let mut shift = vec![0.; stored];
    if parameters.weights.is_empty() {
        scale[..channels].fill(1.);
    } else {
        scale[..channels].copy_from_slice(&parameters.weights[..channels]);
        shift[..channels].copy_from_slice(&parameters.biases[..channels]);
    }
    (scale, shift)
}

/// Index math of a lane group, `groups` groups of `L::WIDTH` channels.
#[derive(Clone, Copy)]
struct Groups {
    batch: usize,
    groups: usize,
    spatial: usize,
    width: usize,
}

impl Groups {
    fn new<L: Lane>(desc: &MemoryDesc) -> Self {
        Self {
            batch: desc.batch,
            groups: desc.stored_c() / L::WIDTH,
            spatial: desc.dims.spatial(),
            width: L::WIDTH,
        }
    }
    /// Offset of `(g, s)` inside a sample.
    #[inline]
    fn offset(&self, g: usize, s: usize) -> usize {
        (g * self.spatial + s) * self.width
    }
    fn sample_len(&self) -> usize {
        self.groups * self.spatial * self.width
    }
    /// Per group sums of `f(n, offset)` over the batch and positions.
    fn sum<L: Lane>(&self, threads: usize, f: impl Fn(usize) -> L + Sync) -> Vec<f32> {
        let mut out = vec![0.; self.groups * self.width];
        let sums = SyncSliceMut::new(&mut out);
        let sample_len = self.sample_len();
        for_i(self.groups, threads, |g| {
            let mut acc = L::default();
            for n in 0..self.batch {
                for s in 0..self.spatial {
                    acc = acc + f(n * sample_len + self.offset(g, s));
                }
            }
            acc.store(unsafe { sums.slice_mut(g * self.width, self.width) });
        });
        out
    }
}

/// BatchNorm, BatchNormActivation and BatchNormActivationDropout.
#[derive(Debug)]
pub(crate) struct BatchNorm {
    channels: usize,
    activation: Option<Activation>,
    dropout: f32,
    momentum: f32,
    eps: f32,
    /// Scale, shift and the running mean and variance.
    parameters: Parameters,
    /// Batch mean of the last training forward, padded.
    mean: Vec<f32>,
    /// `1 / sqrt(var + eps)` of the last training forward, padded.
    inv_std: Vec<f32>,
    mask: Vec<f32>,
    inference: Option<Primitive>,
}

impl BatchNorm {
    pub(crate) fn new(layer_type: LayerType, config: &LayerConfig, input: Dims) -> Result<Self> {
        if !layer_type.is_batch_norm() {
            bail!("{layer_type} is not a batch norm!");
        }
        let channels = input.c;
        let activation = layer_type.has_activation().then(|| config.activation());
        let dropout = if layer_type.has_dropout() {
            config.dropout
        } else {
            0.
        };
        let parameters = norm_parameters(config, channels)
            .with_running(channels, 0.)
            .with_running(channels, 1.);
        Ok(Self {
            channels,
            activation,
            dropout,
            momentum: config.momentum,
            eps: config.eps,
            parameters,
            mean: Vec::new(),
            inv_std: Vec::new(),
            mask: Vec::new(),
            inference: None,
        })
    }
    fn forward_training<L: Lane>(
        &mut self,
        x: TensorRef,
        y: &mut [f32],
        d_y: Option<&mut [f32]>,
    ) -> Result<()> {
        let desc = x.desc;
        let groups = Groups::new::<L>(&desc);
        let count = (desc.batch * groups.spatial) as f32;
        let threads = get_threads(desc.len(), 2);
        let data = x.data;
        let mean = groups.sum(threads, |i| L::load(&data[i..]) / L::splat(count));
        let variance = groups.sum(threads, |i| {
            let g = (i % groups.sample_len()) / (groups.spatial * groups.width);
            let d = L::load(&data[i..]) - L::load(&mean[g * groups.width..]);
            d * d / L::splat(count)
        });
        let unbias = if count > 1. {
            count / (count - 1.)
        } else {
            1.
        };
        let momentum = self.momentum;
        if let [running_mean, running_variance] = self.parameters.running.as_mut_slice() {
            for c in 0..self.channels {
                running_mean[c] = momentum * running_mean[c] + (1. - momentum) * mean[c];
                running_variance[c] =
                    momentum * running_variance[c] + (1. - momentum) * variance[c] * unbias;
            }
        }
        let eps = self.eps;
        self.inv_std = variance.iter().map(|v| (v + eps).sqrt().recip()).collect();
        self.mean = mean;
        if self.dropout > 0. {
            self.mask.resize(desc.len(), 0.);
            fill_mask(&mut self.mask, self.dropout)?;
        } else {
            self.mask.clear();
        }
        let (scale, shift) = padded_scale_shift(&self.parameters, self.channels, desc.stored_c());
        let (mean, inv_std, mask) = (&self.mean, &self.inv_std, &self.mask);
        let activation = self.activation;
        let sample_len = groups.sample_len();
        let width = groups.width;
        let y = SyncSliceMut::new(y);
        let d_y = d_y.map(SyncSliceMut::new);
        for_i(desc.batch, threads, |n| {
            let y = unsafe { y.slice_mut(n * sample_len, sample_len) };
            for g in 0..groups.groups {
                let c = g * width;
                let (mu, inv) = (L::load(&mean[c..]), L::load(&inv_std[c..]));
                let (a, b) = (L::load(&scale[c..]), L::load(&shift[c..]));
                for s in 0..groups.spatial {
                    let o = groups.offset(g, s);
                    let i = n * sample_len + o;
                    let mut v = a * (L::load(&data[i..]) - mu) * inv + b;
                    if let Some(activation) = activation.as_ref() {
                        v = v.map(|z| activation.f(z));
                    }
                    if !mask.is_empty() {
                        v = v * L::load(&mask[i..]);
                    }
                    v.store(&mut y[o..]);
                }
            }
            zero_padding(&desc.with_batch(1), y);
            if let Some(d_y) = d_y.as_ref() {
                unsafe { d_y.slice_mut(n * sample_len, sample_len) }.fill(0.);
            }
        });
        Ok(())
    }
    fn backward_training<L: Lane>(&mut self, io: BackwardIo) -> Result<()> {
        let BackwardIo {
            inputs,
            gradient,
            accumulate,
            ..
        } = io;
        let x = inputs[0];
        let desc = x.desc;
        let groups = Groups::new::<L>(&desc);
        let count = (desc.batch * groups.spatial) as f32;
        let threads = get_threads(desc.len(), 4);
        let sample_len = groups.sample_len();
        let width = groups.width;
        let mut scratch = Vec::new();
        let (dz, dx) = match gradient {
            Gradient::InPlace(d) => (d, None),
            Gradient::Separate {
                d_output: Some(dy),
                d_inputs,
            } => {
                scratch.extend_from_slice(&dy[..desc.len()]);
                (
                    scratch.as_mut_slice(),
                    d_inputs.into_iter().next().flatten(),
                )
            }
            Gradient::Separate { d_output: None, .. } => bail!("Missing output gradient!"),
        };
        let (scale, shift) = padded_scale_shift(&self.parameters, self.channels, desc.stored_c());
        let (mean, inv_std, mask) = (&self.mean, &self.inv_std, &self.mask);
        let data = x.data;
        let x_hat = |i: usize, g: usize| {
            let c = g * width;
            (L::load(&data[i..]) - L::load(&mean[c..])) * L::load(&inv_std[c..])
        };
        // gradient of the normalized, scaled and shifted value
        let activation = self.activation;
        {
            let dz = SyncSliceMut::new(&mut *dz);
            for_i(desc.batch, threads, |n| {
                let dz = unsafe { dz.slice_mut(n * sample_len, sample_len) };
                for g in 0..groups.groups {
                    let c = g * width;
                    let (a, b) = (L::load(&scale[c..]), L::load(&shift[c..]));
                    for s in 0..groups.spatial {
                        let o = groups.offset(g, s);
                        let i = n * sample_len + o;
                        let mut d = L::load(&dz[o..]);
                        if !mask.is_empty() {
                            d = d * L::load(&mask[i..]);
                        }
                        if let Some(activation) = activation.as_ref() {
                            let z = a * x_hat(i, g) + b;
                            d = z.zip_map(d, |z, d| activation.backward(z, d));
                        }
                        d.store(&mut dz[o..]);
                    }
                }
            });
        }
        let dz_ref = &*dz;
        let group_of = |i: usize| (i % sample_len) / (groups.spatial * width);
        let sum_dz = groups.sum(threads, |i| L::load(&dz_ref[i..]));
        let sum_dz_x_hat = groups.sum(threads, |i| L::load(&dz_ref[i..]) * x_hat(i, group_of(i)));
        if !self.parameters.weights.is_empty() {
            let c = self.channels;
            self.parameters.weights_d1[..c].copy_from_slice(&sum_dz_x_hat[..c]);
            self.parameters.biases_d1[..c].copy_from_slice(&sum_dz[..c]);
        }
        let dx_of = |i: usize, g: usize, dz: L| {
            let c = g * width;
            let k = L::load(&scale[c..]) * L::load(&inv_std[c..]) / L::splat(count);
            k * (dz * L::splat(count)
                - L::load(&sum_dz[c..])
                - x_hat(i, g) * L::load(&sum_dz_x_hat[c..]))
        };
        match dx {
            None => {
                let dz = SyncSliceMut::new(dz);
                for_i(desc.batch, threads, |n| {
                    let dz = unsafe { dz.slice_mut(n * sample_len, sample_len) };
                    for g in 0..groups.groups {
                        for s in 0..groups.spatial {
                            let o = groups.offset(g, s);
                            dx_of(n * sample_len + o, g, L::load(&dz[o..])).store(&mut dz[o..]);
                        }
                    }
                });
            }
            Some(dx) => {
                let accumulate = accumulate[0];
                let dx = SyncSliceMut::new(dx);
                for_i(desc.batch, threads, |n| {
                    let dx = unsafe { dx.slice_mut(n * sample_len, sample_len) };
                    for g in 0..groups.groups {
                        for s in 0..groups.spatial {
                            let o = groups.offset(g, s);
                            let i = n * sample_len + o;
                            dx_of(i, g, L::load(&dz_ref[i..])).write(&mut dx[o..], accumulate);
                        }
                    }
                });
            }
        }
        Ok(())
    }
}

impl Operator for BatchNorm {
    fn output_dims(&self, inputs: &[Dims]) -> Result<Dims> {
        if inputs[0].c != self.channels {
            bail!(
                "Batch norm over {} channels cannot take {}!",
                self.channels,
                inputs[0].c
            );
        }
        Ok(inputs[0])
    }
    fn initialize(&mut self, ctx: &InitContext) -> Result<Format> {
        let format = ctx.input_format();
        let desc = NormDesc {
            desc: ctx.output(format),
            eps: self.eps,
            scale_shift: !self.parameters.weights.is_empty(),
        };
        self.inference = Some(Primitive::new(ctx.engine, PrimitiveDesc::BatchNorm(desc))?);
        Ok(format)
    }
    fn resets_gradient(&self) -> bool {
        true
    }
    fn forward(&mut self, io: ForwardIo) -> Result<()> {
        let ForwardIo {
            stream,
            training,
            inputs,
            output,
            d_output,
            ..
        } = io;
        let x = inputs[0];
        if training {
            return match x.desc.format {
                Format::Plain => self.forward_training::<f32>(x, output.data, d_output),
                Format::Blocked => self.forward_training::<f32x8>(x, output.data, d_output),
            };
        }
        let [mean, variance] = self.parameters.running.as_slice() else {
            bail!("Batch norm running statistics missing!");
        };
        let mut args = ExecArgs::new()
            .input(ArgRole::Src, x.data)
            .input(ArgRole::Mean, mean)
            .input(ArgRole::Variance, variance);
        if !self.parameters.weights.is_empty() {
            args = args
                .input(ArgRole::Scale, &self.parameters.weights)
                .input(ArgRole::Shift, &self.parameters.biases);
        }
        let args = args.output(ArgRole::Dst, output.data);
        execute(self.inference.as_ref(), stream, args)?;
        if let Some(activation) = self.activation {
            let len = output.desc.len();
            output.data[..len]
                .iter_mut()
                .for_each(|y| *y = activation.f(*y));
            zero_padding(&output.desc, output.data);
        }
        Ok(())
    }
    fn backward(&mut self, io: BackwardIo) -> Result<()> {
        match io.inputs[0].desc.format {
            Format::Plain => self.backward_training::<f32>(io),
            Format::Blocked => self.backward_training::<f32x8>(io),
        }
    }
    fn parameters(&self) -> Option<&Parameters> {
        Some(&self.parameters)
    }
    fn parameters_mut(&mut self) -> Option<&mut Parameters> {
        Some(&mut self.parameters)
    }
}

/// Normalizes every sample over its channels and positions, per channel scale and shift.
#[derive(Debug)]
pub(crate) struct LayerNorm {
    channels: usize,
    eps: f32,
    parameters: Parameters,
    /// Per sample `(mean, 1 / sqrt(var + eps))` of the last training forward.
    moments: Vec<(f32, f32)>,
    inference: Option<Primitive>,
}

impl LayerNorm {
    pub(crate) fn new(config: &LayerConfig, input: Dims) -> Self {
        Self {
            channels: input.c,
            eps: config.eps,
            parameters: norm_parameters(config, input.c),
            moments: Vec::new(),
            inference: None,
        }
    }
}

impl Operator for LayerNorm {
    fn output_dims(&self, inputs: &[Dims]) -> Result<Dims> {
        if inputs[0].c != self.channels {
            bail!(
                "Layer norm over {} channels cannot take {}!",
                self.channels,
                inputs[0].c
            );
        }
        Ok(inputs[0])
    }
    fn initialize(&mut self, ctx: &InitContext) -> Result<Format> {
        let format = ctx.input_format();
        let desc = NormDesc {
            desc: ctx.output(format),
            eps: self.eps,
            scale_shift: !self.parameters.weights.is_empty(),
        };
        self.inference = Some(Primitive::new(ctx.engine, PrimitiveDesc::LayerNorm(desc))?);
        Ok(format)
    }
    fn forward(&mut self, io: ForwardIo) -> Result<()> {
        let x = io.inputs[0];
        if !io.training {
            let mut args = ExecArgs::new().input(ArgRole::Src, x.data);
            if !self.parameters.weights.is_empty() {
                args = args
                    .input(ArgRole::Scale, &self.parameters.weights)
                    .input(ArgRole::Shift, &self.parameters.biases);
            }
            let args = args.output(ArgRole::Dst, io.output.data);
            return execute(self.inference.as_ref(), io.stream, args);
        }
        let desc = x.desc;
        let (channels, spatial) = (desc.dims.c, desc.dims.spatial());
        let sample_len = desc.sample_len();
        let count = desc.dims.size() as f32;
        let eps = self.eps;
        let (scale, shift) = padded_scale_shift(&self.parameters, channels, channels);
        self.moments.resize(desc.batch, (0., 1.));
        let moments = SyncSliceMut::new(&mut self.moments);
        let y = SyncSliceMut::new(io.output.data);
        for_i(desc.batch, get_threads(desc.len(), 3), |n| {
            let x = &x.data[n * sample_len..(n + 1) * sample_len];
            let y = unsafe { y.slice_mut(n * sample_len, sample_len) };
            let logical = || (0..channels).flat_map(|c| (0..spatial).map(move |s| (c, s)));
            let mean = logical().map(|(c, s)| x[desc.offset(0, c, s)]).sum::<f32>() / count;
            let variance = logical()
                .map(|(c, s)| {
                    let d = x[desc.offset(0, c, s)] - mean;
                    d * d
                })
                .sum::<f32>()
                / count;
            let inv = (variance + eps).sqrt().recip();
            for (c, s) in logical() {
                let o = desc.offset(0, c, s);
                y[o] = scale[c] * (x[o] - mean) * inv + shift[c];
            }
            unsafe {
                *moments.get_mut(n) = (mean, inv);
            }
        });
        Ok(())
    }
    fn backward(&mut self, mut io: BackwardIo) -> Result<()> {
        let (dy, d_inputs) = io.separate()?;
        let x = io.inputs[0];
        let desc = x.desc;
        let (channels, spatial) = (desc.dims.c, desc.dims.spatial());
        let sample_len = desc.sample_len();
        let count = desc.dims.size() as f32;
        let (scale, _) = padded_scale_shift(&self.parameters, channels, channels);
        let dx = d_inputs.into_iter().next().flatten().map(SyncSliceMut::new);
        let accumulate = io.accumulate[0];
        // per sample partial sums of the scale and shift gradients
        let mut partial = vec![0f32; desc.batch * 2 * channels];
        let partial_sums = SyncSliceMut::new(&mut partial);
        let moments = &self.moments;
        for_i(desc.batch, get_threads(desc.len(), 4), |n| {
            let (mean, inv) = moments[n];
            let base = n * sample_len;
            let x_hat = |c, s| (x.data[base + desc.offset(0, c, s)] - mean) * inv;
            let g = |c, s| dy[base + desc.offset(0, c, s)] * scale[c];
            let partial = unsafe { partial_sums.slice_mut(n * 2 * channels, 2 * channels) };
            let (mut sum_g, mut sum_g_x_hat) = (0f32, 0f32);
            for c in 0..channels {
                for s in 0..spatial {
                    let (xh, dyv) = (x_hat(c, s), dy[base + desc.offset(0, c, s)]);
                    partial[c] += dyv * xh;
                    partial[channels + c] += dyv;
                    sum_g += g(c, s);
                    sum_g_x_hat += g(c, s) * xh;
                }
            }
            if let Some(dx) = dx.as_ref() {
                let dx = unsafe { dx.slice_mut(base, sample_len) };
                for c in 0..channels {
                    for s in 0..spatial {
                        let o = desc.offset(0, c, s);
                        let v = inv / count * (count * g(c, s) - sum_g - x_hat(c, s) * sum_g_x_hat);
                        if accumulate {
                            dx[o] += v;
                        } else {
                            dx[o] = v;
                        }
                    }
                }
            }
        });
        if !self.parameters.weights.is_empty() {
            let params = &mut self.parameters;
            params.weights_d1.fill(0.);
            params.biases_d1.fill(0.);
            for sample in partial.chunks(2 * channels) {
                for c in 0..channels {
                    params.weights_d1[c] += sample[c];
                    params.biases_d1[c] += sample[channels + c];
                }
            }
        }
        Ok(())
    }
    fn parameters(&self) -> Option<&Parameters> {
        Some(&self.parameters)
    }
    fn parameters_mut(&mut self) -> Option<&mut Parameters> {
        Some(&mut self.parameters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{engine::Engine, neural_network::layer::TensorMut};
    use approx::assert_relative_eq;

    fn random(len: usize, seed: u64) -> Vec<f32> {
        use rand::{rngs::StdRng, Rng, SeedableRng};
        let mut rng = StdRng::seed_from_u64(seed);
        (0..len).map(|_| rng.gen_range(-2f32..2.)).collect()
    }

    fn batch_norm_output(format: Format, config: &LayerConfig) -> Result<Vec<f32>> {
        let dims = Dims::new(11, 1, 3, 3);
        let plain = MemoryDesc::new(4, dims, Format::Plain);
        let desc = plain.with_format(format);
        let x_plain = random(plain.len(), 7);
        let mut x = vec![0.; desc.len()];
        crate::tensor::reorder(&plain, &x_plain, &desc, &mut x)?;
        let mut bn = BatchNorm::new(LayerType::BatchNormActivation, config, dims)?;
        bn.parameters.reset()?;
        let engine = Engine::host();
        let stream = engine.stream();
        let mut y = vec![0.; desc.len()];
        bn.forward(ForwardIo {
            engine: &engine,
            stream: &stream,
            training: true,
            inputs: vec![TensorRef { desc, data: &x }],
            output: TensorMut {
                desc,
                data: &mut y,
            },
            d_output: None,
            labels: None,
        })?;
        let mut y_plain = vec![0.; plain.len()];
        crate::tensor::reorder(&desc, &y, &plain, &mut y_plain)?;
        Ok(y_plain)
    }

    #[test]
    fn batch_norm_plain_blocked_agree() -> Result<()> {
        let config = LayerConfig {
            activation: crate::neural_network::layer::ActivationKind::Logistic,
            ..LayerConfig::default()
        };
        let plain = batch_norm_output(Format::Plain, &config)?;
        let blocked = batch_norm_output(Format::Blocked, &config)?;
        for (a, b) in plain.iter().zip(blocked.iter()) {
            assert_relative_eq!(a, b, epsilon = 1e-5);
        }
        Ok(())
    }

    #[test]
    fn batch_norm_updates_running_statistics() -> Result<()> {
        let dims = Dims::new(2, 1, 2, 2);
        let desc = MemoryDesc::new(2, dims, Format::Plain);
        let x: Vec<f32> = (0..desc.len()).map(|x| x as f32).collect();
        let config = LayerConfig {
            momentum: 0.5,
            ..LayerConfig::default()
        };
        let mut bn = BatchNorm::new(LayerType::BatchNorm, &config, dims)?;
        bn.parameters.reset()?;
        let engine = Engine::host();
        let stream = engine.stream();
        let mut y = vec![0.; desc.len()];
        bn.forward(ForwardIo {
            engine: &engine,
            stream: &stream,
            training: true,
            inputs: vec![TensorRef { desc, data: &x }],
            output: TensorMut {
                desc,
                data: &mut y,
            },
            d_output: None,
            labels: None,
        })?;
        // channel 0 holds 0..4 and 8..12
        let running = bn.parameters.running();
        assert_relative_eq!(running[0][0], 0.5 * 5.5);
        let values = [0f32, 1., 2., 3., 8., 9., 10., 11.];
        let unbiased = values.iter().map(|x| (x - 5.5).powi(2)).sum::<f32>() / 7.;
        assert_relative_eq!(running[1][0], 0.5 + 0.5 * unbiased, epsilon = 1e-4);
        let mean: f32 = [0, 1, 2, 3, 8, 9, 10, 11].iter().map(|i| y[*i]).sum::<f32>() / 8.;
        assert_relative_eq!(mean, 0., epsilon = 1e-5);
        Ok(())
    }

    #[test]
    fn scale_shift_only_with_scaling() -> Result<()> {
        let dims = Dims::new(3, 1, 1, 1);
        let config = LayerConfig {
            scaling: false,
            ..LayerConfig::default()
        };
        let bn = BatchNorm::new(LayerType::BatchNorm, &config, dims)?;
        assert!(bn.parameters.weights().is_empty());
        assert_eq!(bn.parameters.running().len(), 2);
        let ln = LayerNorm::new(&LayerConfig::default(), dims);
        assert_eq!(ln.parameters.weights().len(), 3);
        Ok(())
    }
}
