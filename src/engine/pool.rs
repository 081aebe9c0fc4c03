use super::{check_len, conv_output_size, ArgRole, ExecArgs, PoolDesc, PoolingAlgorithm};
use crate::tensor::parallel::{for_i, get_threads, SyncSliceMut};
use anyhow::{bail, Result};

pub(super) fn validate(desc: &PoolDesc) -> Result<()> {
    let PoolDesc {
        src,
        dst,
        kernel,
        stride,
        pad,
        ..
    } = desc;
    if src.batch != dst.batch || src.dims.c != dst.dims.c || src.dims.d != 1 || dst.dims.d != 1 {
        bail!("Pooling {src:?} -> {dst:?} not supported!");
    }
    let h = conv_output_size(src.dims.h, kernel[0], stride[0], 1, pad[0]);
    let w = conv_output_size(src.dims.w, kernel[1], stride[1], 1, pad[1]);
    if h != Some(dst.dims.h) || w != Some(dst.dims.w) {
        bail!(
            "Pooling output {}x{} does not match {h:?}x{w:?}!",
            dst.dims.h,
            dst.dims.w
        );
    }
    Ok(())
}

/// Source window `[start, end)` along one axis.
fn window(r: usize, k: usize, s: usize, p: usize, len: usize) -> (usize, usize) {
    let start = (r * s) as isize - p as isize;
    let end = (start + k as isize).min(len as isize);
    let start = start.max(0);
    (start as usize, end.max(start) as usize)
}

pub(super) fn forward(desc: &PoolDesc, threads: usize, args: &mut ExecArgs) -> Result<()> {
    let PoolDesc {
        src,
        dst,
        algorithm,
        kernel,
        stride,
        pad,
    } = *desc;
    let x = args.get(ArgRole::Src)?;
    check_len(ArgRole::Src, x, src.len())?;
    let workspace = if algorithm == PoolingAlgorithm::Max {
        let workspace = args.take(ArgRole::Workspace)?;
        check_len(ArgRole::Workspace, workspace, dst.len())?;
        Some(SyncSliceMut::new(workspace))
    } else {
        None
    };
    let y = args.take(ArgRole::Dst)?;
    check_len(ArgRole::Dst, y, dst.len())?;
    let sample_len = dst.sample_len();
    let y = SyncSliceMut::new(y);
    let threads = threads.min(get_threads(dst.len(), kernel[0] * kernel[1]));
    for_i(dst.batch, threads, |n| {
        let y = unsafe { y.slice_mut(n * sample_len, sample_len) };
        let mut ws = workspace
            .as_ref()
            .map(|ws| unsafe { ws.slice_mut(n * sample_len, sample_len) });
        y.fill(0.);
        for c in 0..dst.dims.c {
            for oy in 0..dst.dims.h {
                let (y0, y1) = window(oy, kernel[0], stride[0], pad[0], src.dims.h);
                for ox in 0..dst.dims.w {
                    let (x0, x1) = window(ox, kernel[1], stride[1], pad[1], src.dims.w);
                    let o = dst.offset(0, c, oy * dst.dims.w + ox);
                    match algorithm {
                        PoolingAlgorithm::Max => {
                            let mut best = f32::NEG_INFINITY;
                            let mut index = 0;
                            for iy in y0..y1 {
                                for ix in x0..x1 {
                                    let s = iy * src.dims.w + ix;
                                    let v = x[src.offset(n, c, s)];
                                    if v > best {
                                        best = v;
                                        index = s;
                                    }
                                }
                            }
                            y[o] = best;
                            if let Some(ws) = ws.as_mut() {
                                ws[o] = index as f32;
                            }
                        }
                        PoolingAlgorithm::AvgExcludePadding => {
                            let count = (y1 - y0) * (x1 - x0);
                            let mut acc = 0f32;
                            for iy in y0..y1 {
                                for ix in x0..x1 {
                                    acc += x[src.offset(n, c, iy * src.dims.w + ix)];
                                }
                            }
                            y[o] = if count > 0 { acc / count as f32 } else { 0. };
                        }
                    }
                }
            }
        }
    });
    Ok(())
}

pub(super) fn backward(desc: &PoolDesc, threads: usize, args: &mut ExecArgs) -> Result<()> {
    let PoolDesc {
        src,
        dst,
        algorithm,
        kernel,
        stride,
        pad,
    } = *desc;
    let dy = args.get(ArgRole::DiffDst)?;
    check_len(ArgRole::DiffDst, dy, dst.len())?;
    let workspace = if algorithm == PoolingAlgorithm::Max {
        let workspace = args.get(ArgRole::Workspace)?;
        check_len(ArgRole::Workspace, workspace, dst.len())?;
        Some(workspace)
    } else {
        None
    };
    let accumulate = args.accumulate;
    let dx = args.take(ArgRole::DiffSrc)?;
    check_len(ArgRole::DiffSrc, dx, src.len())?;
    let sample_len = src.sample_len();
    let dx = SyncSliceMut::new(dx);
    let threads = threads.min(get_threads(src.len(), kernel[0] * kernel[1]));
    for_i(src.batch, threads, |n| {
        let dx = unsafe { dx.slice_mut(n * sample_len, sample_len) };
        if !accumulate {
            for c in 0..src.dims.c {
                for s in 0..src.dims.spatial() {
                    dx[src.offset(0, c, s)] = 0.;
                }
            }
        }
        for c in 0..dst.dims.c {
            for oy in 0..dst.dims.h {
                let (y0, y1) = window(oy, kernel[0], stride[0], pad[0], src.dims.h);
                for ox in 0..dst.dims.w {
                    let (x0, x1) = window(ox, kernel[1], stride[1], pad[1], src.dims.w);
                    let o = dst.offset(n, c, oy * dst.dims.w + ox);
                    let g = dy[o];
                    match workspace {
                        Some(ws) => {
                            let s = ws[o] as usize;
                            dx[src.offset(0, c, s)] += g;
                        }
                        None => {
                            let count = (y1 - y0) * (x1 - x0);
                            if count == 0 {
                                continue;
                            }
                            let g = g / count as f32;
                            for iy in y0..y1 {
                                for ix in x0..x1 {
                                    dx[src.offset(0, c, iy * src.dims.w + ix)] += g;
                                }
                            }
                        }
                    }
                }
            }
        }
    });
    Ok(())
}
