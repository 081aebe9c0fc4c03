use super::{execute, BackwardIo, ForwardIo, InitContext, Operator};
use crate::{
    engine::{ArgRole, ExecArgs, Primitive, PrimitiveDesc, ReductionAlgorithm, ReductionDesc},
    tensor::{
        parallel::{for_i, get_threads, SyncSliceMut},
        Dims, Format,
    },
};
use anyhow::Result;

/// Reduces the channels of every position to one.
#[derive(Debug)]
pub(crate) struct Reduction {
    algorithm: ReductionAlgorithm,
    forward: Option<Primitive>,
}

impl Reduction {
    pub(crate) fn new(algorithm: ReductionAlgorithm) -> Self {
        Self {
            algorithm,
            forward: None,
        }
    }
}

impl Operator for Reduction {
    fn output_dims(&self, inputs: &[Dims]) -> Result<Dims> {
        Ok(Dims { c: 1, ..inputs[0] })
    }
    fn initialize(&mut self, ctx: &InitContext) -> Result<Format> {
        let desc = ReductionDesc {
            src: ctx.inputs[0],
            dst: ctx.output(Format::Plain),
            algorithm: self.algorithm,
        };
        self.forward = Some(Primitive::new(ctx.engine, PrimitiveDesc::Reduction(desc))?);
        Ok(Format::Plain)
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
        let (x, y) = (io.inputs[0], io.output);
        let src = x.desc;
        let (channels, spatial) = (src.dims.c, src.dims.spatial());
        let sample_len = src.sample_len();
        let (algorithm, accumulate) = (self.algorithm, io.accumulate[0]);
        let dx = SyncSliceMut::new(dx);
        for_i(src.batch, get_threads(src.len(), 1), |n| {
            let dx = unsafe { dx.slice_mut(n * sample_len, sample_len) };
            for s in 0..spatial {
                let o = y.desc.offset(n, 0, s);
                let g = dy[o];
                // max and min route the gradient to the first matching channel
                let selected = match algorithm {
                    ReductionAlgorithm::Max | ReductionAlgorithm::Min => {
                        (0..channels).find(|c| x.data[src.offset(n, *c, s)] == y.data[o])
                    }
                    ReductionAlgorithm::Avg | ReductionAlgorithm::Sum => None,
                };
                for c in 0..channels {
                    let v = match algorithm {
                        ReductionAlgorithm::Sum => g,
                        ReductionAlgorithm::Avg => g / channels as f32,
                        ReductionAlgorithm::Max | ReductionAlgorithm::Min => {
                            if selected == Some(c) {
                                g
                            } else {
                                0.
                            }
                        }
                    };
                    let dx = &mut dx[src.offset(0, c, s)];
                    if accumulate {
                        *dx += v;
                    } else {
                        *dx = v;
                    }
                }
            }
        });
        Ok(())
    }
}
