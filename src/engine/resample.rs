use super::{check_len, parse_variant, ArgRole, ExecArgs, ResamplingDesc};
use crate::tensor::parallel::{for_i, get_threads, SyncSliceMut};
use anyhow::Result;
use derive_more::Display;
use std::str::FromStr;

/// Spatial interpolation.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq, Hash)]
pub enum ResamplingAlgorithm {
    /// Nearest neighbor.
    Nearest,
    /// Bilinear, half pixel centers.
    Linear,
}

impl FromStr for ResamplingAlgorithm {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        parse_variant(
            s,
            &[("Nearest", Self::Nearest), ("Linear", Self::Linear)],
            "resampling algorithm",
        )
    }
}

/// Source taps `(index, weight)` of output position `o` along one axis.
fn taps(algorithm: ResamplingAlgorithm, o: usize, input: usize, output: usize) -> [(usize, f32); 2] {
    let scale = input as f32 / output as f32;
    match algorithm {
        ResamplingAlgorithm::Nearest => {
            let i = (((o as f32 + 0.5) * scale) as usize).min(input - 1);
            [(i, 1.), (i, 0.)]
        }
        ResamplingAlgorithm::Linear => {
            let x = ((o as f32 + 0.5) * scale - 0.5).max(0.);
            let i0 = (x as usize).min(input - 1);
            let i1 = (i0 + 1).min(input - 1);
            let t = x - i0 as f32;
            [(i0, 1. - t), (i1, t)]
        }
    }
}

pub(super) fn forward(desc: &ResamplingDesc, threads: usize, args: &mut ExecArgs) -> Result<()> {
    let ResamplingDesc {
        src,
        dst,
        algorithm,
    } = *desc;
    let x = args.get(ArgRole::Src)?;
    check_len(ArgRole::Src, x, src.len())?;
    let y = args.take(ArgRole::Dst)?;
    check_len(ArgRole::Dst, y, dst.len())?;
    let sample_len = dst.sample_len();
    let y = SyncSliceMut::new(y);
    for_i(dst.batch, threads.min(get_threads(dst.len(), 4)), |n| {
        let y = unsafe { y.slice_mut(n * sample_len, sample_len) };
        for c in 0..dst.dims.c {
            for oy in 0..dst.dims.h {
                let ty = taps(algorithm, oy, src.dims.h, dst.dims.h);
                for ox in 0..dst.dims.w {
                    let tx = taps(algorithm, ox, src.dims.w, dst.dims.w);
                    let mut acc = 0f32;
                    for (iy, wy) in ty {
                        for (ix, wx) in tx {
                            acc += wy * wx * x[src.offset(n, c, iy * src.dims.w + ix)];
                        }
                    }
                    y[dst.offset(0, c, oy * dst.dims.w + ox)] = acc;
                }
            }
        }
    });
    Ok(())
}

pub(super) fn backward(desc: &ResamplingDesc, threads: usize, args: &mut ExecArgs) -> Result<()> {
    let ResamplingDesc {
        src,
        dst,
        algorithm,
    } = *desc;
    let dy = args.get(ArgRole::DiffDst)?;
    check_len(ArgRole::DiffDst, dy, dst.len())?;
    let accumulate = args.accumulate;
    let dx = args.take(ArgRole::DiffSrc)?;
    check_len(ArgRole::DiffSrc, dx, src.len())?;
    let sample_len = src.sample_len();
    let dx = SyncSliceMut::new(dx);
    for_i(src.batch, threads.min(get_threads(dst.len(), 4)), |n| {
        let dx = unsafe { dx.slice_mut(n * sample_len, sample_len) };
        for c in 0..src.dims.c {
            if !accumulate {
                for s in 0..src.dims.spatial() {
                    dx[src.offset(0, c, s)] = 0.;
                }
            }
            for oy in 0..dst.dims.h {
                let ty = taps(algorithm, oy, src.dims.h, dst.dims.h);
                for ox in 0..dst.dims.w {
                    let tx = taps(algorithm, ox, src.dims.w, dst.dims.w);
                    let g = dy[dst.offset(n, c, oy * dst.dims.w + ox)];
                    for (iy, wy) in ty {
                        for (ix, wx) in tx {
                            dx[src.offset(0, c, iy * src.dims.w + ix)] += wy * wx * g;
                        }
                    }
                }
            }
        }
    });
    Ok(())
}
