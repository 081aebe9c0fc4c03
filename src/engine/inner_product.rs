use super::{check_len, ArgRole, ExecArgs, InnerProductDesc};
use crate::tensor::{Format, MemoryDesc};
use anyhow::Result;
use ndarray::{Array2, ArrayView2, Axis};

/// Source as `batch x (c * spatial)` in logical channel major order.
fn flatten(desc: &MemoryDesc, data: &[f32]) -> Result<Array2<f32>> {
    let features = desc.dims.size();
    if desc.format == Format::Plain {
        return Ok(ArrayView2::from_shape([desc.batch, features], &data[..desc.len()])?.to_owned());
    }
    let spatial = desc.dims.spatial();
    Ok(Array2::from_shape_fn([desc.batch, features], |(n, f)| {
        data[desc.offset(n, f / spatial, f % spatial)]
    }))
}

fn unflatten(desc: &MemoryDesc, x: &Array2<f32>, data: &mut [f32], accumulate: bool) {
    let spatial = desc.dims.spatial();
    for ((n, f), x) in x.indexed_iter() {
        let y = &mut data[desc.offset(n, f / spatial, f % spatial)];
        if accumulate {
            *y += *x;
        } else {
            *y = *x;
        }
    }
}

fn weights<'a>(desc: &InnerProductDesc, args: &ExecArgs<'a>) -> Result<ArrayView2<'a, f32>> {
    let weights = args.get(ArgRole::Weights)?;
    let shape = [desc.dst.dims.c, desc.src.dims.size()];
    check_len(ArgRole::Weights, weights, shape[0] * shape[1])?;
    Ok(ArrayView2::from_shape(shape, &weights[..shape[0] * shape[1]])?)
}

pub(super) fn forward(desc: &InnerProductDesc, args: &mut ExecArgs) -> Result<()> {
    let src = args.get(ArgRole::Src)?;
    check_len(ArgRole::Src, src, desc.src.len())?;
    let x = flatten(&desc.src, src)?;
    let w = weights(desc, args)?;
    let mut y = x.dot(&w.t());
    if desc.bias {
        let bias = args.get(ArgRole::Bias)?;
        check_len(ArgRole::Bias, bias, desc.dst.dims.c)?;
        let bias = ArrayView2::from_shape([1, desc.dst.dims.c], &bias[..desc.dst.dims.c])?;
        y += &bias;
    }
    let dst = args.take(ArgRole::Dst)?;
    check_len(ArgRole::Dst, dst, desc.dst.len())?;
    dst[..desc.dst.len()].fill(0.);
    unflatten(&desc.dst, &y, dst, false);
    Ok(())
}

pub(super) fn backward_data(desc: &InnerProductDesc, args: &mut ExecArgs) -> Result<()> {
    let diff_dst = args.get(ArgRole::DiffDst)?;
    check_len(ArgRole::DiffDst, diff_dst, desc.dst.len())?;
    let dy = flatten(&desc.dst, diff_dst)?;
    let w = weights(desc, args)?;
    let dx = dy.dot(&w);
    let accumulate = args.accumulate;
    let diff_src = args.take(ArgRole::DiffSrc)?;
    check_len(ArgRole::DiffSrc, diff_src, desc.src.len())?;
    unflatten(&desc.src, &dx, diff_src, accumulate);
    Ok(())
}

pub(super) fn backward_weights(desc: &InnerProductDesc, args: &mut ExecArgs) -> Result<()> {
    let src = args.get(ArgRole::Src)?;
    let diff_dst = args.get(ArgRole::DiffDst)?;
    check_len(ArgRole::Src, src, desc.src.len())?;
    check_len(ArgRole::DiffDst, diff_dst, desc.dst.len())?;
    let x = flatten(&desc.src, src)?;
    let dy = flatten(&desc.dst, diff_dst)?;
    let dw = dy.t().dot(&x);
    let diff_weights = args.take(ArgRole::DiffWeights)?;
    check_len(ArgRole::DiffWeights, diff_weights, dw.len())?;
    diff_weights
        .iter_mut()
        .zip(dw.iter())
        .for_each(|(y, x)| *y = *x);
    if desc.bias {
        let diff_bias = args.take(ArgRole::DiffBias)?;
        check_len(ArgRole::DiffBias, diff_bias, desc.dst.dims.c)?;
        diff_bias
            .iter_mut()
            .zip(dy.sum_axis(Axis(0)).iter())
            .for_each(|(y, x)| *y = *x);
    }
    Ok(())
}
