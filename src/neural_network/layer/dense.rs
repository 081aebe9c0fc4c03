use super::{
    execute, BackwardIo, ForwardIo, InitContext, LayerConfig, Operator, Parameters,
};
use crate::{
    engine::{ArgRole, ExecArgs, InnerProductDesc, Primitive, PrimitiveDesc, Propagation},
    tensor::{Dims, Format, WeightDims},
};
use anyhow::{bail, Result};

/// Fully connected layer over the flattened input.
///
/// Weights are `[channels, c * d * h * w]` in logical channel major order, independent of the
/// input format.
#[derive(Debug)]
pub(crate) struct Dense {
    channels: usize,
    features: usize,
    parameters: Parameters,
    forward: Option<Primitive>,
    backward_data: Option<Primitive>,
    backward_weights: Option<Primitive>,
}

impl Dense {
    pub(crate) fn new(config: &LayerConfig, input: Dims) -> Result<Self> {
        let channels = config.channels;
        if channels == 0 {
            bail!("Dense needs Channels!");
        }
        let features = input.size();
        let fillers = (
            config
                .weights_filler
                .unwrap_or(config.default_weights_filler),
            config.biases_filler.unwrap_or(config.default_biases_filler),
        );
        let bias_len = if config.biases { channels } else { 0 };
        let parameters = Parameters::new(
            WeightDims::new(channels, features, 1, 1),
            bias_len,
            fillers,
            config,
            (features, channels),
        );
        Ok(Self {
            channels,
            features,
            parameters,
            forward: None,
            backward_data: None,
            backward_weights: None,
        })
    }
}

impl Operator for Dense {
    fn output_dims(&self, inputs: &[Dims]) -> Result<Dims> {
        let features = inputs[0].size();
        if features != self.features {
            bail!(
                "Dense expects {} input features, found {features}!",
                self.features
            );
        }
        Ok(Dims::new(self.channels, 1, 1, 1))
    }
    fn fan_in(&self) -> usize {
        self.features
    }
    fn fan_out(&self) -> usize {
        self.channels
    }
    fn initialize(&mut self, ctx: &InitContext) -> Result<Format> {
        let desc = InnerProductDesc {
            src: ctx.inputs[0],
            dst: ctx.output(Format::Plain),
            bias: !self.parameters.biases.is_empty(),
        };
        let build = |propagation| {
            Primitive::new(ctx.engine, PrimitiveDesc::InnerProduct(desc, propagation))
        };
        self.forward = Some(build(Propagation::Forward)?);
        self.backward_data = Some(build(Propagation::BackwardData)?);
        self.backward_weights = Some(build(Propagation::BackwardWeights)?);
        Ok(Format::Plain)
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
        if let Some(dx) = d_inputs.into_iter().next().flatten() {
            let args = ExecArgs::new()
                .input(ArgRole::DiffDst, dy)
                .input(ArgRole::Weights, &self.parameters.weights)
                .output(ArgRole::DiffSrc, dx)
                .accumulate(io.accumulate[0]);
            execute(self.backward_data.as_ref(), io.stream, args)?;
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
