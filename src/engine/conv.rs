use super::{check_len, ArgRole, ConvDesc, ExecArgs};
use crate::tensor::{
    parallel::{for_i, get_threads, SyncSliceMut},
    MemoryDesc,
};
use anyhow::Result;

/// Index math shared by the convolution kernels.
///
/// `small` is the tensor indexed by the sliding window position, `big` the one the window
/// slides over. For a convolution that is dst / src, for a deconvolution src / dst.
struct Plan<'a> {
    desc: &'a ConvDesc,
    small: MemoryDesc,
    big: MemoryDesc,
    /// Output channels per group.
    o_per_g: usize,
}

impl<'a> Plan<'a> {
    fn new(desc: &'a ConvDesc, transposed: bool) -> Self {
        let (small, big) = if transposed {
            (desc.src, desc.dst)
        } else {
            (desc.dst, desc.src)
        };
        Self {
            desc,
            small,
            big,
            o_per_g: desc.dst.dims.c / desc.groups,
        }
    }
    fn ic(&self, oc: usize, i: usize) -> usize {
        self.desc.src_channel_offset + (oc / self.o_per_g) * self.desc.weights.i + i
    }
    fn w(&self, oc: usize, i: usize, ky: usize, kx: usize) -> usize {
        self.desc
            .weights
            .offset(self.desc.weight_format, oc, i, ky, kx)
    }
    /// Output channels reading source channel `ic`, with the per group input index.
    fn consumers(&self, ic: usize) -> (std::ops::Range<usize>, usize) {
        let local = ic - self.desc.src_channel_offset;
        let g = local / self.desc.weights.i;
        (
            g * self.o_per_g..(g + 1) * self.o_per_g,
            local % self.desc.weights.i,
        )
    }
    /// `(k, q)` pairs of big positions covered by the window at small position `r`.
    fn window(&self, axis: usize, r: usize) -> impl Iterator<Item = (usize, usize)> {
        let k = self.kernel(axis);
        let (s, d, p) = self.geometry(axis);
        let len = self.big_len(axis) as isize;
        (0..k).filter_map(move |k| {
            let q = (r * s + k * d) as isize - p as isize;
            (q >= 0 && q < len).then_some((k, q as usize))
        })
    }
    /// `(k, r)` pairs of small positions whose window covers big position `q`.
    fn taps(&self, axis: usize, q: usize) -> impl Iterator<Item = (usize, usize)> {
        let k = self.kernel(axis);
        let (s, d, p) = self.geometry(axis);
        let len = self.small_len(axis);
        (0..k).filter_map(move |k| {
            let t = (q + p) as isize - (k * d) as isize;
            if t < 0 || t as usize % s != 0 {
                return None;
            }
            let r = t as usize / s;
            (r < len).then_some((k, r))
        })
    }
    fn kernel(&self, axis: usize) -> usize {
        [self.desc.weights.kh, self.desc.weights.kw][axis]
    }
    fn geometry(&self, axis: usize) -> (usize, usize, usize) {
        (
            self.desc.stride[axis],
            self.desc.dilation[axis],
            self.desc.pad[axis],
        )
    }
    fn small_len(&self, axis: usize) -> usize {
        [self.small.dims.h, self.small.dims.w][axis]
    }
    fn big_len(&self, axis: usize) -> usize {
        [self.big.dims.h, self.big.dims.w][axis]
    }
    fn macs(&self) -> usize {
        self.desc.weights.i * self.desc.weights.kh * self.desc.weights.kw
    }
}

fn store(acc: bool, y: &mut f32, x: f32) {
    if acc {
        *y += x;
    } else {
        *y = x;
    }
}

/// Window sum over the big tensor, written into the small tensor.
///
/// Convolution forward (`transposed == false`) and deconvolution backward data.
#[allow(clippy::too_many_arguments)]
fn small_from_big(
    plan: &Plan,
    big_data: &[f32],
    weights: &[f32],
    bias: Option<&[f32]>,
    small_data: &mut [f32],
    accumulate: bool,
    transposed: bool,
    threads: usize,
) {
    let small = plan.small;
    let big = plan.big;
    let sample_len = small.sample_len();
    let (small_h, small_w) = (small.dims.h, small.dims.w);
    let big_w = big.dims.w;
    let out = SyncSliceMut::new(small_data);
    let threads = threads.min(get_threads(small.len(), plan.macs()));
    for_i(small.batch, threads, |n| {
        let out = unsafe { out.slice_mut(n * sample_len, sample_len) };
        if !transposed && !accumulate {
            out.fill(0.);
        }
        let channels = if transposed {
            plan.desc.src_channel_offset..plan.desc.src_channel_offset + plan.desc.src_channels
        } else {
            0..small.dims.c
        };
        for c in channels {
            for y in 0..small_h {
                for x in 0..small_w {
                    let mut acc = 0f32;
                    if transposed {
                        // c is an input channel, sum over the output channels reading it
                        let (ocs, i) = plan.consumers(c);
                        for oc in ocs {
                            for (ky, by) in plan.window(0, y) {
                                for (kx, bx) in plan.window(1, x) {
                                    acc += big_data[big.offset(n, oc, by * big_w + bx)]
                                        * weights[plan.w(oc, i, ky, kx)];
                                }
                            }
                        }
                    } else {
                        acc = bias.map_or(0., |b| b[c]);
                        for i in 0..plan.desc.weights.i {
                            let ic = plan.ic(c, i);
                            for (ky, by) in plan.window(0, y) {
                                for (kx, bx) in plan.window(1, x) {
                                    acc += big_data[big.offset(n, ic, by * big_w + bx)]
                                        * weights[plan.w(c, i, ky, kx)];
                                }
                            }
                        }
                    }
                    store(accumulate, &mut out[small.offset(0, c, y * small_w + x)], acc);
                }
            }
        }
    });
}

/// Tap sum over the small tensor, written into the big tensor.
///
/// Convolution backward data (`transposed == false`) and deconvolution forward.
#[allow(clippy::too_many_arguments)]
fn big_from_small(
    plan: &Plan,
    small_data: &[f32],
    weights: &[f32],
    bias: Option<&[f32]>,
    big_data: &mut [f32],
    accumulate: bool,
    transposed: bool,
    threads: usize,
) {
    let small = plan.small;
    let big = plan.big;
    let sample_len = big.sample_len();
    let (big_h, big_w) = (big.dims.h, big.dims.w);
    let small_w = small.dims.w;
    let out = SyncSliceMut::new(big_data);
    let threads = threads.min(get_threads(big.len(), plan.macs()));
    for_i(big.batch, threads, |n| {
        let out = unsafe { out.slice_mut(n * sample_len, sample_len) };
        if transposed && !accumulate {
            out.fill(0.);
        }
        let channels = if transposed {
            0..big.dims.c
        } else {
            plan.desc.src_channel_offset..plan.desc.src_channel_offset + plan.desc.src_channels
        };
        for c in channels {
            for y in 0..big_h {
                for x in 0..big_w {
                    let mut acc = 0f32;
                    if transposed {
                        acc = bias.map_or(0., |b| b[c]);
                        for i in 0..plan.desc.weights.i {
                            let ic = plan.ic(c, i);
                            for (ky, sy) in plan.taps(0, y) {
                                for (kx, sx) in plan.taps(1, x) {
                                    acc += small_data[small.offset(n, ic, sy * small_w + sx)]
                                        * weights[plan.w(c, i, ky, kx)];
                                }
                            }
                        }
                    } else {
                        let (ocs, i) = plan.consumers(c);
                        for oc in ocs {
                            for (ky, sy) in plan.taps(0, y) {
                                for (kx, sx) in plan.taps(1, x) {
                                    acc += small_data[small.offset(n, oc, sy * small_w + sx)]
                                        * weights[plan.w(oc, i, ky, kx)];
                                }
                            }
                        }
                    }
                    store(accumulate, &mut out[big.offset(0, c, y * big_w + x)], acc);
                }
            }
        }
    });
}

/// Weight and bias gradients, parallel over output channels.
fn weight_gradients(
    desc: &ConvDesc,
    transposed: bool,
    src: &[f32],
    diff_dst: &[f32],
    diff_weights: &mut [f32],
    diff_bias: Option<&mut [f32]>,
    threads: usize,
) {
    let plan = Plan::new(desc, transposed);
    let (small, big) = (plan.small, plan.big);
    let (small_h, small_w, big_w) = (small.dims.h, small.dims.w, big.dims.w);
    diff_weights.fill(0.);
    let dw = SyncSliceMut::new(diff_weights);
    let db = diff_bias.map(SyncSliceMut::new);
    let threads = threads.min(get_threads(desc.dst.len(), plan.macs()));
    let (small_data, big_data, small_is_dst) = if transposed {
        (src, diff_dst, false)
    } else {
        (diff_dst, src, true)
    };
    for_i(desc.dst.dims.c, threads, |oc| {
        for i in 0..desc.weights.i {
            let ic = plan.ic(oc, i);
            let (small_c, big_c) = if small_is_dst { (oc, ic) } else { (ic, oc) };
            for ky in 0..desc.weights.kh {
                for kx in 0..desc.weights.kw {
                    let mut acc = 0f32;
                    for n in 0..small.batch {
                        for y in 0..small_h {
                            let Some((_, by)) = plan.window(0, y).find(|(k, _)| *k == ky) else {
                                continue;
                            };
                            for x in 0..small_w {
                                let Some((_, bx)) = plan.window(1, x).find(|(k, _)| *k == kx)
                                else {
                                    continue;
                                };
                                acc += small_data[small.offset(n, small_c, y * small_w + x)]
                                    * big_data[big.offset(n, big_c, by * big_w + bx)];
                            }
                        }
                    }
                    unsafe {
                        *dw.get_mut(plan.w(oc, i, ky, kx)) = acc;
                    }
                }
            }
        }
        if let Some(db) = db.as_ref() {
            let dst = desc.dst;
            let spatial = dst.dims.spatial();
            let mut acc = 0f32;
            for n in 0..dst.batch {
                for s in 0..spatial {
                    acc += diff_dst[dst.offset(n, oc, s)];
                }
            }
            unsafe {
                *db.get_mut(oc) = acc;
            }
        }
    });
}

fn bias<'a>(desc: &ConvDesc, args: &ExecArgs<'a>) -> Result<Option<&'a [f32]>> {
    if desc.bias {
        let bias = args.get(ArgRole::Bias)?;
        check_len(ArgRole::Bias, bias, desc.dst.dims.c)?;
        Ok(Some(bias))
    } else {
        Ok(None)
    }
}

fn weights<'a>(desc: &ConvDesc, args: &ExecArgs<'a>) -> Result<&'a [f32]> {
    let weights = args.get(ArgRole::Weights)?;
    check_len(
        ArgRole::Weights,
        weights,
        desc.weights.len(desc.weight_format),
    )?;
    Ok(weights)
}

pub(super) fn forward(desc: &ConvDesc, threads: usize, args: &mut ExecArgs) -> Result<()> {
    let src = args.get(ArgRole::Src)?;
    check_len(ArgRole::Src, src, desc.src.len())?;
    let weights = weights(desc, args)?;
    let bias = bias(desc, args)?;
    let dst = args.take(ArgRole::Dst)?;
    check_len(ArgRole::Dst, dst, desc.dst.len())?;
    let plan = Plan::new(desc, false);
    small_from_big(&plan, src, weights, bias, dst, false, false, threads);
    Ok(())
}

pub(super) fn backward_data(desc: &ConvDesc, threads: usize, args: &mut ExecArgs) -> Result<()> {
    let diff_dst = args.get(ArgRole::DiffDst)?;
    check_len(ArgRole::DiffDst, diff_dst, desc.dst.len())?;
    let weights = weights(desc, args)?;
    let accumulate = args.accumulate;
    let diff_src = args.take(ArgRole::DiffSrc)?;
    check_len(ArgRole::DiffSrc, diff_src, desc.src.len())?;
    let plan = Plan::new(desc, false);
    big_from_small(
        &plan, diff_dst, weights, None, diff_src, accumulate, false, threads,
    );
    Ok(())
}

pub(super) fn backward_weights(desc: &ConvDesc, threads: usize, args: &mut ExecArgs) -> Result<()> {
    let src = args.get(ArgRole::Src)?;
    let diff_dst = args.get(ArgRole::DiffDst)?;
    check_len(ArgRole::Src, src, desc.src.len())?;
    check_len(ArgRole::DiffDst, diff_dst, desc.dst.len())?;
    let diff_weights = args.take(ArgRole::DiffWeights)?;
    check_len(
        ArgRole::DiffWeights,
        diff_weights,
        desc.weights.len(desc.weight_format),
    )?;
    let diff_bias = if desc.bias {
        Some(args.take(ArgRole::DiffBias)?)
    } else {
        None
    };
    weight_gradients(desc, false, src, diff_dst, diff_weights, diff_bias, threads);
    Ok(())
}

pub(super) fn deconv_forward(desc: &ConvDesc, threads: usize, args: &mut ExecArgs) -> Result<()> {
    let src = args.get(ArgRole::Src)?;
    check_len(ArgRole::Src, src, desc.src.len())?;
    let weights = weights(desc, args)?;
    let bias = bias(desc, args)?;
    let dst = args.take(ArgRole::Dst)?;
    check_len(ArgRole::Dst, dst, desc.dst.len())?;
    let plan = Plan::new(desc, true);
    big_from_small(&plan, src, weights, bias, dst, false, true, threads);
    Ok(())
}

pub(super) fn deconv_backward_data(
    desc: &ConvDesc,
    threads: usize,
    args: &mut ExecArgs,
) -> Result<()> {
    let diff_dst = args.get(ArgRole::DiffDst)?;
    check_len(ArgRole::DiffDst, diff_dst, desc.dst.len())?;
    let weights = weights(desc, args)?;
    let accumulate = args.accumulate;
    let diff_src = args.take(ArgRole::DiffSrc)?;
    check_len(ArgRole::DiffSrc, diff_src, desc.src.len())?;
    let plan = Plan::new(desc, true);
    small_from_big(
        &plan, diff_dst, weights, None, diff_src, accumulate, true, threads,
    );
    Ok(())
}

pub(super) fn deconv_backward_weights(
    desc: &ConvDesc,
    threads: usize,
    args: &mut ExecArgs,
) -> Result<()> {
    let src = args.get(ArgRole::Src)?;
    let diff_dst = args.get(ArgRole::DiffDst)?;
    check_len(ArgRole::Src, src, desc.src.len())?;
    check_len(ArgRole::DiffDst, diff_dst, desc.dst.len())?;
    let diff_weights = args.take(ArgRole::DiffWeights)?;
    let diff_bias = if desc.bias {
        Some(args.take(ArgRole::DiffBias)?)
    } else {
        None
    };
    weight_gradients(desc, true, src, diff_dst, diff_weights, diff_bias, threads);
    Ok(())
}
