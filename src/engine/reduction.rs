use super::{check_len, parse_variant, ArgRole, ExecArgs, ReductionDesc};
use crate::tensor::parallel::{for_i, get_threads, SyncSliceMut};
use anyhow::Result;
use derive_more::Display;
use std::str::FromStr;

/// Reduction over the channel axis.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq, Hash)]
pub enum ReductionAlgorithm {
    /// Mean.
    Avg,
    /// Maximum.
    Max,
    /// Minimum.
    Min,
    /// Sum.
    Sum,
}

impl FromStr for ReductionAlgorithm {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        parse_variant(
            s,
            &[
                ("Avg", Self::Avg),
                ("Max", Self::Max),
                ("Min", Self::Min),
                ("Sum", Self::Sum),
            ],
            "reduction operation",
        )
    }
}

impl ReductionAlgorithm {
    /// Reduces `values`.
    pub fn reduce(self, values: impl Iterator<Item = f32>) -> f32 {
        match self {
            Self::Avg => {
                let (sum, count) = values.fold((0f32, 0usize), |(s, n), x| (s + x, n + 1));
                if count > 0 {
                    sum / count as f32
                } else {
                    0.
                }
            }
            Self::Max => values.fold(f32::NEG_INFINITY, f32::max),
            Self::Min => values.fold(f32::INFINITY, f32::min),
            Self::Sum => values.sum(),
        }
    }
}

pub(super) fn forward(desc: &ReductionDesc, threads: usize, args: &mut ExecArgs) -> Result<()> {
    let ReductionDesc {
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
    for_i(dst.batch, threads.min(get_threads(src.len(), 1)), |n| {
        let y = unsafe { y.slice_mut(n * sample_len, sample_len) };
        for s in 0..dst.dims.spatial() {
            y[dst.offset(0, 0, s)] =
                algorithm.reduce((0..src.dims.c).map(|c| x[src.offset(n, c, s)]));
        }
    });
    Ok(())
}
