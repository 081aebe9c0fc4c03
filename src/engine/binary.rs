use super::{check_len, ArgRole, BinaryDesc, ExecArgs};
use crate::tensor::parallel::{for_i, get_threads, SyncSliceMut};
use anyhow::{bail, Result};
use derive_more::Display;

/// Elementwise binary operation.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq, Hash)]
pub enum BinaryAlgorithm {
    /// `a + b`
    Add,
    /// `a - b`
    Sub,
    /// `a * b`
    Mul,
    /// `a / b`
    Div,
    /// `max(a, b)`
    Max,
    /// `min(a, b)`
    Min,
    /// `(a + b) / 2`
    Avg,
}

impl BinaryAlgorithm {
    /// Applies the operation.
    #[inline]
    pub fn apply(self, a: f32, b: f32) -> f32 {
        match self {
            Self::Add => a + b,
            Self::Sub => a - b,
            Self::Mul => a * b,
            Self::Div => a / b,
            Self::Max => a.max(b),
            Self::Min => a.min(b),
            Self::Avg => 0.5 * (a + b),
        }
    }
}

pub(super) fn validate(desc: &BinaryDesc) -> Result<()> {
    let BinaryDesc { src0, src1, dst, .. } = desc;
    if src0.dims != dst.dims || src0.batch != dst.batch || src1.batch != dst.batch {
        bail!("Binary {src0:?} -> {dst:?} not supported!");
    }
    if src1.dims.c != src0.dims.c
        || (src1.dims.spatial() != src0.dims.spatial() && !src1.dims.is_unit_spatial())
    {
        bail!("Cannot broadcast {src1:?} to {src0:?}!");
    }
    Ok(())
}

pub(super) fn forward(desc: &BinaryDesc, threads: usize, args: &mut ExecArgs) -> Result<()> {
    let BinaryDesc {
        src0,
        src1,
        dst,
        algorithm,
        reversed,
    } = *desc;
    let a = args.get(ArgRole::Src)?;
    let b = args.get(ArgRole::Src1)?;
    check_len(ArgRole::Src, a, src0.len())?;
    check_len(ArgRole::Src1, b, src1.len())?;
    let y = args.take(ArgRole::Dst)?;
    check_len(ArgRole::Dst, y, dst.len())?;
    let sample_len = dst.sample_len();
    let broadcast = src1.dims.is_unit_spatial() && !src0.dims.is_unit_spatial();
    let y = SyncSliceMut::new(y);
    for_i(dst.batch, threads.min(get_threads(dst.len(), 1)), |n| {
        let y = unsafe { y.slice_mut(n * sample_len, sample_len) };
        for c in 0..dst.dims.c {
            for s in 0..dst.dims.spatial() {
                let a = a[src0.offset(n, c, s)];
                let b = b[src1.offset(n, c, if broadcast { 0 } else { s })];
                y[dst.offset(0, c, s)] = if reversed {
                    algorithm.apply(b, a)
                } else {
                    algorithm.apply(a, b)
                };
            }
        }
    });
    Ok(())
}
