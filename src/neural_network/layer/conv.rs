//! Convolution, DepthwiseConvolution, PartialDepthwiseConvolution and ConvolutionTranspose.
use super::{
    execute, BackwardIo, ForwardIo, InitContext, LayerConfig, LayerType, Operator, Parameters,
};
use crate::{
    engine::{
        conv_output_size, deconv_output_size, ArgRole, ConvDesc, ExecArgs, Primitive,
        PrimitiveDesc, Propagation,
    },
    tensor::{Dims, Format, WeightDims},
};
use anyhow::{bail, format_err, Result};

/// A 2d (transposed) convolution over a contiguous slice of the input channels.
#[derive(Debug)]
pub(crate) struct Conv {
    layer_type: LayerType,
    /// Output channels.
    channels: usize,
    groups: usize,
    src_channel_offset: usize,
    src_channels: usize,
    kernel: [usize; 2],
    stride: [usize; 2],
    pad: [usize; 2],
    dilation: [usize; 2],
    parameters: Parameters,
    forward: Option<Primitive>,
    backward_data: Option<Primitive>,
    backward_weights: Option<Primitive>,
}

impl Conv {
    pub(crate) fn new(layer_type: LayerType, config: &LayerConfig, input: Dims) -> Result<Self> {
        let c = input.c;
        let (channels, groups, src_channel_offset, src_channels) = match layer_type {
            LayerType::Convolution | LayerType::ConvolutionTranspose => {
                (config.channels, config.groups, 0, c)
            }
            LayerType::DepthwiseConvolution => (c * config.multiplier, c, 0, c),
            LayerType::PartialDepthwiseConvolution => {
                let (groups, group) = (config.groups, config.group);
                if groups == 0 || c % groups != 0 || group == 0 || group > groups {
                    bail!("Cannot select group {group} of {groups} from {c} channels!");
                }
                let len = c / groups;
                (len * config.multiplier, len, (group - 1) * len, len)
            }
            t => bail!("{t} is not a convolution!"),
        };
        if channels == 0 {
            bail!("{layer_type} needs Channels!");
        }
        if groups == 0 || src_channels % groups != 0 || channels % groups != 0 {
            bail!("Channels {src_channels} -> {channels} not divisible by groups {groups}!");
        }
        let [kh, kw] = config.kernel;
        let weight_dims = WeightDims::new(channels, src_channels / groups, kh, kw);
        let fan_in = weight_dims.i * kh * kw;
        let fan_out = channels / groups * kh * kw;
        let bias_len = if config.biases { channels } else { 0 };
        let fillers = (
            config
                .weights_filler
                .unwrap_or(config.default_weights_filler),
            config.biases_filler.unwrap_or(config.default_biases_filler),
        );
        let parameters =
            Parameters::new(weight_dims, bias_len, fillers, config, (fan_in, fan_out));
        Ok(Self {
            layer_type,
            channels,
            groups,
            src_channel_offset,
            src_channels,
            kernel: config.kernel,
            stride: config.stride,
            pad: config.pad,
            dilation: config.dilation,
            parameters,
            forward: None,
            backward_data: None,
            backward_weights: None,
        })
    }
    fn is_transposed(&self) -> bool {
        self.layer_type == LayerType::ConvolutionTranspose
    }
    fn extent(&self, axis: usize, input: usize) -> Option<usize> {
        let size = if self.is_transposed() {
            deconv_output_size
        } else {
            conv_output_size
        };
        size(
            input,
            self.kernel[axis],
            self.stride[axis],
            self.dilation[axis],
            self.pad[axis],
        )
    }
    fn primitive(&self, desc: ConvDesc, propagation: Propagation) -> PrimitiveDesc {
        if self.is_transposed() {
            PrimitiveDesc::Deconvolution(desc, propagation)
        } else {
            PrimitiveDesc::Convolution(desc, propagation)
        }
    }
}

impl Operator for Conv {
    fn output_dims(&self, inputs: &[Dims]) -> Result<Dims> {
        let input = inputs[0];
        if input.d != 1 {
            bail!("{} only supports 2d inputs!", self.layer_type);
        }
        if self.src_channel_offset + self.src_channels > input.c {
            bail!(
                "{} reads {} channels but the input has {}!",
                self.layer_type,
                self.src_channel_offset + self.src_channels,
                input.c
            );
        }
        let fit = |axis, len| {
            self.extent(axis, len).filter(|x| *x > 0).ok_or_else(|| {
                format_err!(
                    "Kernel {:?} does not fit input {}x{} with padding {:?}!",
                    self.kernel,
                    input.h,
                    input.w,
                    self.pad
                )
            })
        };
        Ok(Dims::new(self.channels, 1, fit(0, input.h)?, fit(1, input.w)?))
    }
    fn fan_in(&self) -> usize {
        self.parameters.fan.0
    }
    fn fan_out(&self) -> usize {
        self.parameters.fan.1
    }
    fn initialize(&mut self, ctx: &InitContext) -> Result<Format> {
        let engine = ctx.engine;
        let format = engine.preferred_format();
        self.parameters
            .set_weight_format(engine, engine.preferred_weight_format(format))?;
        let desc = ConvDesc {
            src: ctx.inputs[0],
            dst: ctx.output(format),
            weights: self.parameters.weight_dims(),
            weight_format: self.parameters.weight_format(),
            bias: !self.parameters.biases.is_empty(),
            stride: self.stride,
            dilation: self.dilation,
            pad: self.pad,
            groups: self.groups,
            src_channel_offset: self.src_channel_offset,
            src_channels: self.src_channels,
        };
        self.forward = Some(Primitive::new(
            engine,
            self.primitive(desc, Propagation::Forward),
        )?);
        self.backward_data = Some(Primitive::new(
            engine,
            self.primitive(desc, Propagation::BackwardData),
        )?);
        self.backward_weights = Some(Primitive::new(
            engine,
            self.primitive(desc, Propagation::BackwardWeights),
        )?);
        Ok(format)
    }
    fn forward(&mut self, io: ForwardIo) -> Result<()> {
        let mut args = ExecArgs::new()
            .input(ArgRole::Src, io.inputs[0].data)
            .input(ArgRole::Weights, &self.parameters.weights);
        if !self.parameters.biases.is_empty() {
            args = args.input(ArgRole::Bias, &self.parameters.biases);
        }
        let args = args.output(ArgRole::Dst, io.output.data);
        execute(self.forward.as_ref(), io.stream, args)
    }
    fn backward(&mut self, mut io: BackwardIo) -> Result<()> {
        let (dy, d_inputs) = io.separate()?;
        let params = &mut self.parameters;
        let mut args = ExecArgs::new()
            .input(ArgRole::Src, io.inputs[0].data)
            .input(ArgRole::DiffDst, dy)
            .output(ArgRole::DiffWeights, &mut params.weights_d1);
        if !params.biases.is_empty() {
            args = args.output(ArgRole::DiffBias, &mut params.biases_d1);
        }
        execute(self.backward_weights.as_ref(), io.stream, args)?;
        let Some(dx) = d_inputs.into_iter().next().flatten() else {
            return Ok(());
        };
        let mut accumulate = io.accumulate[0];
        if !accumulate && self.src_channels != io.inputs[0].desc.dims.c {
            // only the selected channel slice is written
            dx.fill(0.);
            accumulate = true;
        }
        let args = ExecArgs::new()
            .input(ArgRole::DiffDst, dy)
            .input(ArgRole::Weights, &self.parameters.weights)
            .output(ArgRole::DiffSrc, dx)
            .accumulate(accumulate);
        execute(self.backward_data.as_ref(), io.stream, args)
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

    fn conv(layer_type: LayerType, config: LayerConfig, input: Dims) -> (Conv, Dims) {
        let conv = Conv::new(layer_type, &config, input).unwrap();
        let dims = conv.output_dims(&[input]).unwrap();
        (conv, dims)
    }

    #[test]
    fn convolution_output() {
        let config = LayerConfig {
            channels: 16,
            kernel: [3, 3],
            stride: [2, 2],
            pad: [1, 1],
            ..LayerConfig::default()
        };
        let (conv, dims) = conv(LayerType::Convolution, config, Dims::new(3, 1, 32, 32));
        assert_eq!(dims, Dims::new(16, 1, 16, 16));
        assert_eq!(conv.parameters.weight_dims(), WeightDims::new(16, 3, 3, 3));
        assert_eq!(conv.fan_in(), 27);
        assert_eq!(conv.fan_out(), 144);
    }

    #[test]
    fn depthwise_multiplies_channels() {
        let config = LayerConfig {
            multiplier: 2,
            kernel: [3, 3],
            pad: [1, 1],
            biases: false,
            ..LayerConfig::default()
        };
        let (conv, dims) = conv(
            LayerType::DepthwiseConvolution,
            config,
            Dims::new(5, 1, 8, 8),
        );
        assert_eq!(dims, Dims::new(10, 1, 8, 8));
        assert_eq!(conv.parameters.weight_dims(), WeightDims::new(10, 1, 3, 3));
        assert!(conv.parameters.biases().is_empty());
    }

    #[test]
    fn partial_depthwise_selects_group() {
        let config = LayerConfig {
            groups: 3,
            group: 3,
            kernel: [3, 3],
            pad: [1, 1],
            ..LayerConfig::default()
        };
        let (conv, dims) = conv(
            LayerType::PartialDepthwiseConvolution,
            config,
            Dims::new(12, 1, 4, 4),
        );
        assert_eq!(dims, Dims::new(4, 1, 4, 4));
        assert_eq!(conv.src_channel_offset, 8);
        assert_eq!(conv.src_channels, 4);
        assert_eq!(conv.groups, 4);
    }

    #[test]
    fn transposed_upsamples() {
        let config = LayerConfig {
            channels: 4,
            kernel: [2, 2],
            stride: [2, 2],
            ..LayerConfig::default()
        };
        let (_, dims) = conv(
            LayerType::ConvolutionTranspose,
            config,
            Dims::new(8, 1, 5, 5),
        );
        assert_eq!(dims, Dims::new(4, 1, 10, 10));
    }

    #[test]
    fn kernel_larger_than_input() {
        let config = LayerConfig {
            channels: 4,
            kernel: [7, 7],
            ..LayerConfig::default()
        };
        let input = Dims::new(3, 1, 4, 4);
        let conv = Conv::new(LayerType::Convolution, &config, input).unwrap();
        assert!(conv.output_dims(&[input]).is_err());
    }
}
