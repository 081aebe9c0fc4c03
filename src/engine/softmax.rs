use super::{check_len, ArgRole, ExecArgs, SoftmaxDesc};
use crate::tensor::parallel::{for_i, get_threads, SyncSliceMut};
use anyhow::Result;

/// Softmax (or log softmax) over the channel axis at every position.
pub(super) fn forward(desc: &SoftmaxDesc, threads: usize, args: &mut ExecArgs) -> Result<()> {
    let SoftmaxDesc { desc: memory, log } = *desc;
    let x = args.get(ArgRole::Src)?;
    check_len(ArgRole::Src, x, memory.len())?;
    let y = args.take(ArgRole::Dst)?;
    check_len(ArgRole::Dst, y, memory.len())?;
    let sample_len = memory.sample_len();
    let channels = memory.dims.c;
    let y = SyncSliceMut::new(y);
    for_i(memory.batch, threads.min(get_threads(memory.len(), 4)), |n| {
        let x = &x[n * sample_len..(n + 1) * sample_len];
        let y = unsafe { y.slice_mut(n * sample_len, sample_len) };
        for s in 0..memory.dims.spatial() {
            let max = (0..channels)
                .map(|c| x[memory.offset(0, c, s)])
                .fold(f32::NEG_INFINITY, f32::max);
            let sum: f32 = (0..channels)
                .map(|c| (x[memory.offset(0, c, s)] - max).exp())
                .sum();
            let log_sum = sum.ln();
            for c in 0..channels {
                let o = memory.offset(0, c, s);
                y[o] = if log {
                    x[o] - max - log_sum
                } else {
                    (x[o] - max).exp() / sum
                };
            }
        }
    });
    Ok(())
}
