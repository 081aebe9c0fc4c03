use super::{execute, BackwardIo, ForwardIo, InitContext, Operator};
use crate::{
    engine::{ArgRole, ExecArgs, Primitive, PrimitiveDesc, SoftmaxDesc},
    tensor::{
        parallel::{for_i, get_threads, SyncSliceMut},
        Dims, Format,
    },
};
use anyhow::Result;

/// Softmax or log softmax over the channels of every position.
#[derive(Debug)]
pub(crate) struct Softmax {
    log: bool,
    forward: Option<Primitive>,
}

impl Softmax {
    pub(crate) fn new(log: bool) -> Self {
        Self { log, forward: None }
    }
}

impl Operator for Softmax {
    fn output_dims(&self, inputs: &[Dims]) -> Result<Dims> {
        Ok(inputs[0])
    }
    fn initialize(&mut self, ctx: &InitContext) -> Result<Format> {
        let format = ctx.input_format();
        let desc = SoftmaxDesc {
            desc: ctx.output(format),
            log: self.log,
        };
        self.forward = Some(Primitive::new(ctx.engine, PrimitiveDesc::Softmax(desc))?);
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
        let (y, desc) = (io.output.data, io.output.desc);
        let (channels, spatial) = (desc.dims.c, desc.dims.spatial());
        let sample_len = desc.sample_len();
        let (log, accumulate) = (self.log, io.accumulate[0]);
        let dx = SyncSliceMut::new(dx);
        for_i(desc.batch, get_threads(desc.len(), 3), |n| {
            let dx = unsafe { dx.slice_mut(n * sample_len, sample_len) };
            let base = n * sample_len;
            for s in 0..spatial {
                let offsets = (0..channels).map(|c| desc.offset(0, c, s));
                let sum: f32 = if log {
                    offsets.clone().map(|o| dy[base + o]).sum()
                } else {
                    offsets.clone().map(|o| dy[base + o] * y[base + o]).sum()
                };
                for o in offsets {
                    let (y, dy) = (y[base + o], dy[base + o]);
                    let g = if log {
                        dy - y.exp() * sum
                    } else {
                        y * (dy - sum)
                    };
                    if accumulate {
                        dx[o] += g;
                    } else {
                        dx[o] = g;
                    }
                }
            }
        });
        Ok(())
    }
}
