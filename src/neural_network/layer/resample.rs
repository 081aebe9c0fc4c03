use super::{execute, BackwardIo, ForwardIo, InitContext, LayerConfig, Operator};
use crate::{
    engine::{
        ArgRole, ExecArgs, Primitive, PrimitiveDesc, Propagation, ResamplingAlgorithm,
        ResamplingDesc,
    },
    tensor::{Dims, Format},
};
use anyhow::{bail, Result};

/// Spatial resampling by a factor per axis, the output extent is rounded down.
#[derive(Debug)]
pub(crate) struct Resample {
    factor: [f32; 2],
    algorithm: ResamplingAlgorithm,
    forward: Option<Primitive>,
    backward: Option<Primitive>,
}

impl Resample {
    pub(crate) fn new(config: &LayerConfig) -> Self {
        Self {
            factor: config.factor,
            algorithm: config.algorithm,
            forward: None,
            backward: None,
        }
    }
}

impl Operator for Resample {
    fn output_dims(&self, inputs: &[Dims]) -> Result<Dims> {
        let input = inputs[0];
        let h = (input.h as f32 * self.factor[0]).floor() as usize;
        let w = (input.w as f32 * self.factor[1]).floor() as usize;
        if h == 0 || w == 0 {
            bail!(
                "Resampling {}x{} by {:?} leaves no output!",
                input.h,
                input.w,
                self.factor
            );
        }
        Ok(Dims { h, w, ..input })
    }
    fn initialize(&mut self, ctx: &InitContext) -> Result<Format> {
        let format = ctx.input_format();
        let desc = ResamplingDesc {
            src: ctx.inputs[0],
            dst: ctx.output(format),
            algorithm: self.algorithm,
        };
        self.forward = Some(Primitive::new(
            ctx.engine,
            PrimitiveDesc::Resampling(desc, Propagation::Forward),
        )?);
        self.backward = Some(Primitive::new(
            ctx.engine,
            PrimitiveDesc::Resampling(desc, Propagation::BackwardData),
        )?);
        Ok(format)
    }
    fn forward(&mut self, io: ForwardIo) -> Result<()> {
        let args = ExecArgs::new()
            .input(ArgRole::Src, io.inputs[0].data)
            .output(ArgRole::Dst, io.output.data);
        execute(self.forward.as_ref(), io.stream, args)
    }
    fn backward(&mut self, mut io: BackwardIo) -> Result<()> {
        let (dy, d_inputs) = io.separate()?;
        let Some(dx) = d_inputs.into_iter().next().flatten() else {
            return Ok(());
        };
        let args = ExecArgs::new()
            .input(ArgRole::DiffDst, dy)
            .output(ArgRole::DiffSrc, dx)
            .accumulate(io.accumulate[0]);
        execute(self.backward.as_ref(), io.stream, args)
    }
}
