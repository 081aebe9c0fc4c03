use super::{check_len, ArgRole, ExecArgs, NormDesc};
use crate::tensor::parallel::{for_i, get_threads, SyncSliceMut};
use anyhow::Result;

fn scale_shift<'a>(
    desc: &NormDesc,
    args: &ExecArgs<'a>,
) -> Result<Option<(&'a [f32], &'a [f32])>> {
    if !desc.scale_shift {
        return Ok(None);
    }
    let c = desc.desc.dims.c;
    let scale = args.get(ArgRole::Scale)?;
    let shift = args.get(ArgRole::Shift)?;
    check_len(ArgRole::Scale, scale, c)?;
    check_len(ArgRole::Shift, shift, c)?;
    Ok(Some((scale, shift)))
}

/// Normalizes with the running statistics bound to [`ArgRole::Mean`] / [`ArgRole::Variance`].
pub(super) fn batch_norm_inference(
    desc: &NormDesc,
    threads: usize,
    args: &mut ExecArgs,
) -> Result<()> {
    let NormDesc {
        desc: memory, eps, ..
    } = *desc;
    let channels = memory.dims.c;
    let x = args.get(ArgRole::Src)?;
    let mean = args.get(ArgRole::Mean)?;
    let variance = args.get(ArgRole::Variance)?;
    check_len(ArgRole::Src, x, memory.len())?;
    check_len(ArgRole::Mean, mean, channels)?;
    check_len(ArgRole::Variance, variance, channels)?;
    let scale_shift = scale_shift(desc, args)?;
    let y = args.take(ArgRole::Dst)?;
    check_len(ArgRole::Dst, y, memory.len())?;
    let sample_len = memory.sample_len();
    let spatial = memory.dims.spatial();
    let y = SyncSliceMut::new(y);
    for_i(memory.batch, threads.min(get_threads(memory.len(), 2)), |n| {
        let y = unsafe { y.slice_mut(n * sample_len, sample_len) };
        for c in 0..channels {
            let inv = (variance[c] + eps).sqrt().recip();
            let (a, b) = scale_shift.map_or((1., 0.), |(scale, shift)| (scale[c], shift[c]));
            for s in 0..spatial {
                let o = memory.offset(0, c, s);
                y[o] = a * (x[n * sample_len + o] - mean[c]) * inv + b;
            }
        }
    });
    Ok(())
}

/// Normalizes each sample over all its channels and positions.
pub(super) fn layer_norm_inference(
    desc: &NormDesc,
    threads: usize,
    args: &mut ExecArgs,
) -> Result<()> {
    let NormDesc {
        desc: memory, eps, ..
    } = *desc;
    let x = args.get(ArgRole::Src)?;
    check_len(ArgRole::Src, x, memory.len())?;
    let scale_shift = scale_shift(desc, args)?;
    let y = args.take(ArgRole::Dst)?;
    check_len(ArgRole::Dst, y, memory.len())?;
    let sample_len = memory.sample_len();
    let spatial = memory.dims.spatial();
    let count = memory.dims.size() as f32;
    let y = SyncSliceMut::new(y);
    for_i(memory.batch, threads.min(get_threads(memory.len(), 3)), |n| {
        let x = &x[n * sample_len..(n + 1) * sample_len];
        let y = unsafe { y.slice_mut(n * sample_len, sample_len) };
        let mut sum = 0f32;
        for c in 0..memory.dims.c {
            for s in 0..spatial {
                sum += x[memory.offset(0, c, s)];
            }
        }
        let mean = sum / count;
        let mut sq = 0f32;
        for c in 0..memory.dims.c {
            for s in 0..spatial {
                let d = x[memory.offset(0, c, s)] - mean;
                sq += d * d;
            }
        }
        let inv = (sq / count + eps).sqrt().recip();
        for c in 0..memory.dims.c {
            let (a, b) = scale_shift.map_or((1., 0.), |(scale, shift)| (scale[c], shift[c]));
            for s in 0..spatial {
                let o = memory.offset(0, c, s);
                y[o] = a * (x[o] - mean) * inv + b;
            }
        }
    });
    Ok(())
}
