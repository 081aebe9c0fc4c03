use super::{execute, BackwardIo, ForwardIo, InitContext, LayerConfig, LayerType, Operator};
use crate::{
    engine::{
        conv_output_size, ArgRole, ExecArgs, PoolDesc, PoolingAlgorithm, Primitive,
        PrimitiveDesc, Propagation,
    },
    tensor::{Dims, Format},
};
use anyhow::{format_err, Result};

/// Max and average pooling, global variants pool the whole plane.
#[derive(Debug)]
pub(crate) struct Pool {
    algorithm: PoolingAlgorithm,
    global: bool,
    kernel: [usize; 2],
    stride: [usize; 2],
    pad: [usize; 2],
    /// Argmax of max pooling, written in forward and read in backward.
    workspace: Vec<f32>,
    forward: Option<Primitive>,
    backward: Option<Primitive>,
}

impl Pool {
    pub(crate) fn new(layer_type: LayerType, config: &LayerConfig) -> Self {
        let algorithm = match layer_type {
            LayerType::MaxPooling | LayerType::GlobalMaxPooling => PoolingAlgorithm::Max,
            _ => PoolingAlgorithm::AvgExcludePadding,
        };
        let global = matches!(
            layer_type,
            LayerType::GlobalMaxPooling | LayerType::GlobalAvgPooling
        );
        Self {
            algorithm,
            global,
            kernel: config.kernel,
            stride: config.stride,
            pad: config.pad,
            workspace: Vec::new(),
            forward: None,
            backward: None,
        }
    }
}

impl Operator for Pool {
    fn output_dims(&self, inputs: &[Dims]) -> Result<Dims> {
        let input = inputs[0];
        if self.global {
            return Ok(Dims::new(input.c, 1, 1, 1));
        }
        let fit = |axis: usize, len| {
            conv_output_size(len, self.kernel[axis], self.stride[axis], 1, self.pad[axis])
                .filter(|x| *x > 0)
                .ok_or_else(|| {
                    format_err!(
                        "Pooling kernel {:?} does not fit input {}x{}!",
                        self.kernel,
                        input.h,
                        input.w
                    )
                })
        };
        Ok(Dims::new(input.c, 1, fit(0, input.h)?, fit(1, input.w)?))
    }
    fn initialize(&mut self, ctx: &InitContext) -> Result<Format> {
        let src = ctx.inputs[0];
        let format = src.format;
        let dst = ctx.output(format);
        let (kernel, stride, pad) = if self.global {
            ([src.dims.h, src.dims.w], [1, 1], [0, 0])
        } else {
            (self.kernel, self.stride, self.pad)
        };
        let desc = PoolDesc {
            src,
            dst,
            algorithm: self.algorithm,
            kernel,
            stride,
            pad,
        };
        self.forward = Some(Primitive::new(
            ctx.engine,
            PrimitiveDesc::Pooling(desc, Propagation::Forward),
        )?);
        self.backward = Some(Primitive::new(
            ctx.engine,
            PrimitiveDesc::Pooling(desc, Propagation::BackwardData),
        )?);
        self.workspace = match self.algorithm {
            PoolingAlgorithm::Max => vec![0.; dst.len()],
            PoolingAlgorithm::AvgExcludePadding => Vec::new(),
        };
        Ok(format)
    }
    fn forward(&mut self, io: ForwardIo) -> Result<()> {
        let mut args = ExecArgs::new()
            .input(ArgRole::Src, io.inputs[0].data)
            .output(ArgRole::Dst, io.output.data);
        if self.algorithm == PoolingAlgorithm::Max {
            args = args.output(ArgRole::Workspace, &mut self.workspace);
        }
        execute(self.forward.as_ref(), io.stream, args)
    }
    fn backward(&mut self, mut io: BackwardIo) -> Result<()> {
        let (dy, d_inputs) = io.separate()?;
        let Some(dx) = d_inputs.into_iter().next().flatten() else {
            return Ok(());
        };
        let mut args = ExecArgs::new()
            .input(ArgRole::DiffDst, dy)
            .output(ArgRole::DiffSrc, dx)
            .accumulate(io.accumulate[0]);
        if self.algorithm == PoolingAlgorithm::Max {
            args = args.input(ArgRole::Workspace, &self.workspace);
        }
        execute(self.backward.as_ref(), io.stream, args)
    }
}
