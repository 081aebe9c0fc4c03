use super::*;
use crate::tensor::{Dims, Format};
use approx::assert_relative_eq;
use rand::{rngs::StdRng, Rng, SeedableRng};

fn random(n: usize, seed: u64) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n).map(|_| rng.gen_range(-0.5..0.5)).collect()
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(a, b)| a * b).sum()
}

fn conv_desc(format: Format, groups: usize) -> ConvDesc {
    let src = MemoryDesc::new(2, Dims::new(4, 1, 7, 7), format);
    let dst = MemoryDesc::new(2, Dims::new(6, 1, 4, 4), format);
    ConvDesc {
        src,
        dst,
        weights: WeightDims::new(6, 4 / groups, 3, 3),
        weight_format: WeightFormat::Oihw,
        bias: true,
        stride: [2, 2],
        dilation: [1, 1],
        pad: [1, 1],
        groups,
        src_channel_offset: 0,
        src_channels: 4,
    }
}

fn run_conv(engine: &Engine, desc: ConvDesc, x: &[f32], w: &[f32], b: &[f32]) -> Result<Vec<f32>> {
    let primitive = Primitive::new(
        engine,
        PrimitiveDesc::Convolution(desc, Propagation::Forward),
    )?;
    let mut y = vec![0.; desc.dst.len()];
    let stream = engine.stream();
    primitive.execute(
        &stream,
        ExecArgs::new()
            .input(ArgRole::Src, x)
            .input(ArgRole::Weights, w)
            .input(ArgRole::Bias, b)
            .output(ArgRole::Dst, &mut y),
    )?;
    stream.wait()?;
    Ok(y)
}

#[test]
fn output_sizes() {
    assert_eq!(conv_output_size(32, 3, 1, 1, 1), Some(32));
    assert_eq!(conv_output_size(7, 3, 2, 1, 1), Some(4));
    assert_eq!(conv_output_size(5, 3, 1, 2, 0), Some(1));
    assert_eq!(conv_output_size(2, 5, 1, 1, 0), None);
    assert_eq!(deconv_output_size(4, 3, 2, 1, 1), Some(7));
}

#[test]
fn conv_plain_matches_blocked() -> Result<()> {
    let engine = Engine::host();
    for groups in [1, 2] {
        let plain = conv_desc(Format::Plain, groups);
        let x = random(plain.src.len(), 1);
        let w = random(plain.weights.size(), 2);
        let b = random(6, 3);
        let y_plain = run_conv(&engine, plain, &x, &w, &b)?;
        let mut blocked = conv_desc(Format::Blocked, groups);
        blocked.weight_format = engine.preferred_weight_format(Format::Blocked);
        let mut x_blocked = vec![0.; blocked.src.len()];
        engine.reorder(&plain.src, &x, &blocked.src, &mut x_blocked)?;
        let w_blocked =
            engine.reorder_weights(&plain.weights, WeightFormat::Oihw, &w, blocked.weight_format)?;
        let y_blocked = run_conv(&engine, blocked, &x_blocked, &w_blocked, &b)?;
        let mut y = vec![0.; plain.dst.len()];
        engine.reorder(&blocked.dst, &y_blocked, &plain.dst, &mut y)?;
        for (a, b) in y.iter().zip(&y_plain) {
            assert_relative_eq!(a, b, epsilon = 1e-5);
        }
    }
    Ok(())
}

#[test]
fn conv_backward_data_is_adjoint() -> Result<()> {
    let engine = Engine::host();
    let mut desc = conv_desc(Format::Plain, 2);
    desc.bias = false;
    desc.dilation = [2, 2];
    desc.pad = [2, 2];
    let x = random(desc.src.len(), 4);
    let w = random(desc.weights.size(), 5);
    let dy = random(desc.dst.len(), 6);
    let stream = engine.stream();
    let mut y = vec![0.; desc.dst.len()];
    Primitive::new(&engine, PrimitiveDesc::Convolution(desc, Propagation::Forward))?.execute(
        &stream,
        ExecArgs::new()
            .input(ArgRole::Src, &x)
            .input(ArgRole::Weights, &w)
            .output(ArgRole::Dst, &mut y),
    )?;
    let mut dx = vec![0.; desc.src.len()];
    Primitive::new(
        &engine,
        PrimitiveDesc::Convolution(desc, Propagation::BackwardData),
    )?
    .execute(
        &stream,
        ExecArgs::new()
            .input(ArgRole::DiffDst, &dy)
            .input(ArgRole::Weights, &w)
            .output(ArgRole::DiffSrc, &mut dx),
    )?;
    let mut dw = vec![0.; desc.weights.size()];
    Primitive::new(
        &engine,
        PrimitiveDesc::Convolution(desc, Propagation::BackwardWeights),
    )?
    .execute(
        &stream,
        ExecArgs::new()
            .input(ArgRole::Src, &x)
            .input(ArgRole::DiffDst, &dy)
            .output(ArgRole::DiffWeights, &mut dw),
    )?;
    stream.wait()?;
    assert_eq!(stream.completed(), 3);
    let lhs = dot(&y, &dy);
    assert_relative_eq!(lhs, dot(&x, &dx), max_relative = 1e-4);
    assert_relative_eq!(lhs, dot(&w, &dw), max_relative = 1e-4);
    Ok(())
}

#[test]
fn deconv_is_transposed_conv() -> Result<()> {
    let engine = Engine::host();
    let conv = {
        let mut desc = conv_desc(Format::Plain, 1);
        desc.bias = false;
        desc
    };
    // deconv from the conv output shape back to its input shape
    let deconv = ConvDesc {
        src: MemoryDesc::new(2, Dims::new(6, 1, 4, 4), Format::Plain),
        dst: MemoryDesc::new(2, Dims::new(4, 1, 7, 7), Format::Plain),
        weights: WeightDims::new(4, 6, 3, 3),
        src_channels: 6,
        ..conv
    };
    let w = random(conv.weights.size(), 7);
    // conv weights [o=6, i=4] become deconv weights [o=4, i=6]
    let mut wt = vec![0.; w.len()];
    for o in 0..6 {
        for i in 0..4 {
            for y in 0..3 {
                for x in 0..3 {
                    wt[deconv.weights.offset(WeightFormat::Oihw, i, o, y, x)] =
                        w[conv.weights.offset(WeightFormat::Oihw, o, i, y, x)];
                }
            }
        }
    }
    let dy = random(conv.dst.len(), 8);
    let stream = engine.stream();
    let mut dx = vec![0.; conv.src.len()];
    Primitive::new(&engine, PrimitiveDesc::Convolution(conv, Propagation::BackwardData))?
        .execute(
            &stream,
            ExecArgs::new()
                .input(ArgRole::DiffDst, &dy)
                .input(ArgRole::Weights, &w)
                .output(ArgRole::DiffSrc, &mut dx),
        )?;
    let mut y = vec![0.; deconv.dst.len()];
    Primitive::new(&engine, PrimitiveDesc::Deconvolution(deconv, Propagation::Forward))?
        .execute(
            &stream,
            ExecArgs::new()
                .input(ArgRole::Src, &dy)
                .input(ArgRole::Weights, &wt)
                .output(ArgRole::Dst, &mut y),
        )?;
    for (a, b) in dx.iter().zip(&y) {
        assert_relative_eq!(a, b, epsilon = 1e-5);
    }
    Ok(())
}

#[test]
fn conv_rejects_bad_groups() {
    let engine = Engine::host();
    let mut desc = conv_desc(Format::Plain, 1);
    desc.groups = 3;
    assert!(Primitive::new(&engine, PrimitiveDesc::Convolution(desc, Propagation::Forward)).is_err());
}

#[test]
fn max_pool_routes_gradient() -> Result<()> {
    let engine = Engine::host();
    let desc = PoolDesc {
        src: MemoryDesc::new(1, Dims::new(1, 1, 2, 2), Format::Blocked),
        dst: MemoryDesc::new(1, Dims::new(1, 1, 1, 1), Format::Blocked),
        algorithm: PoolingAlgorithm::Max,
        kernel: [2, 2],
        stride: [2, 2],
        pad: [0, 0],
    };
    let mut x = vec![0.; desc.src.len()];
    for (s, v) in [1., 4., 3., 2.].into_iter().enumerate() {
        x[desc.src.offset(0, 0, s)] = v;
    }
    let stream = engine.stream();
    let mut y = vec![0.; desc.dst.len()];
    let mut ws = vec![0.; desc.dst.len()];
    Primitive::new(&engine, PrimitiveDesc::Pooling(desc, Propagation::Forward))?.execute(
        &stream,
        ExecArgs::new()
            .input(ArgRole::Src, &x)
            .output(ArgRole::Dst, &mut y)
            .output(ArgRole::Workspace, &mut ws),
    )?;
    assert_eq!(y[0], 4.);
    let dy = vec![1.; desc.dst.len()];
    let mut dx = vec![0.5; desc.src.len()];
    Primitive::new(&engine, PrimitiveDesc::Pooling(desc, Propagation::BackwardData))?.execute(
        &stream,
        ExecArgs::new()
            .input(ArgRole::DiffDst, &dy)
            .input(ArgRole::Workspace, &ws)
            .output(ArgRole::DiffSrc, &mut dx)
            .accumulate(true),
    )?;
    assert_eq!(dx[desc.src.offset(0, 0, 1)], 1.5);
    assert_eq!(dx[desc.src.offset(0, 0, 0)], 0.5);
    Ok(())
}

#[test]
fn softmax_normalizes_channels() -> Result<()> {
    let engine = Engine::host();
    let memory = MemoryDesc::new(3, Dims::new(10, 1, 2, 2), Format::Blocked);
    let x = random(memory.len(), 9);
    let stream = engine.stream();
    let mut y = vec![0.; memory.len()];
    let mut log_y = vec![0.; memory.len()];
    for (log, y) in [(false, &mut y), (true, &mut log_y)] {
        Primitive::new(&engine, PrimitiveDesc::Softmax(SoftmaxDesc { desc: memory, log }))?
            .execute(&stream, ExecArgs::new().input(ArgRole::Src, &x).output(ArgRole::Dst, y))?;
    }
    for n in 0..3 {
        for s in 0..4 {
            let sum: f32 = (0..10).map(|c| y[memory.offset(n, c, s)]).sum();
            assert_relative_eq!(sum, 1., epsilon = 1e-5);
            let o = memory.offset(n, 3, s);
            assert_relative_eq!(log_y[o], y[o].ln(), epsilon = 1e-5);
        }
    }
    Ok(())
}

#[test]
fn inner_product_flattens_blocked_source() -> Result<()> {
    let engine = Engine::host();
    let plain = MemoryDesc::new(2, Dims::new(3, 1, 2, 2), Format::Plain);
    let blocked = plain.with_format(Format::Blocked);
    let dst = MemoryDesc::new(2, Dims::new(5, 1, 1, 1), Format::Plain);
    let x = random(plain.len(), 10);
    let mut xb = vec![0.; blocked.len()];
    engine.reorder(&plain, &x, &blocked, &mut xb)?;
    let w = random(5 * 12, 11);
    let b = random(5, 12);
    let stream = engine.stream();
    let mut outputs = Vec::new();
    for (src, x) in [(plain, &x), (blocked, &xb)] {
        let mut y = vec![0.; dst.len()];
        Primitive::new(
            &engine,
            PrimitiveDesc::InnerProduct(InnerProductDesc { src, dst, bias: true }, Propagation::Forward),
        )?
        .execute(
            &stream,
            ExecArgs::new()
                .input(ArgRole::Src, x)
                .input(ArgRole::Weights, &w)
                .input(ArgRole::Bias, &b)
                .output(ArgRole::Dst, &mut y),
        )?;
        outputs.push(y);
    }
    let expected: f32 = b[1] + (0..12).map(|f| w[12 + f] * x[12 + f]).sum::<f32>();
    assert_relative_eq!(outputs[0][5 + 1], expected, epsilon = 1e-5);
    for (a, b) in outputs[0].iter().zip(&outputs[1]) {
        assert_relative_eq!(a, b, epsilon = 1e-5);
    }
    Ok(())
}

#[test]
fn resampling_nearest_upsamples() -> Result<()> {
    let engine = Engine::host();
    let desc = ResamplingDesc {
        src: MemoryDesc::new(1, Dims::new(1, 1, 2, 2), Format::Plain),
        dst: MemoryDesc::new(1, Dims::new(1, 1, 4, 4), Format::Plain),
        algorithm: ResamplingAlgorithm::Nearest,
    };
    let x = vec![1., 2., 3., 4.];
    let mut y = vec![0.; 16];
    let stream = engine.stream();
    Primitive::new(&engine, PrimitiveDesc::Resampling(desc, Propagation::Forward))?
        .execute(&stream, ExecArgs::new().input(ArgRole::Src, &x).output(ArgRole::Dst, &mut y))?;
    assert_eq!(&y[..4], &[1., 1., 2., 2.]);
    assert_eq!(&y[12..], &[3., 3., 4., 4.]);
    let dy = vec![1.; 16];
    let mut dx = vec![0.; 4];
    Primitive::new(&engine, PrimitiveDesc::Resampling(desc, Propagation::BackwardData))?
        .execute(
            &stream,
            ExecArgs::new()
                .input(ArgRole::DiffDst, &dy)
                .output(ArgRole::DiffSrc, &mut dx),
        )?;
    assert_eq!(dx, vec![4.; 4]);
    Ok(())
}

#[test]
fn missing_argument_is_an_error() {
    let engine = Engine::host();
    let memory = MemoryDesc::new(1, Dims::new(2, 1, 1, 1), Format::Plain);
    let primitive = Primitive::new(
        &engine,
        PrimitiveDesc::Softmax(SoftmaxDesc {
            desc: memory,
            log: false,
        }),
    )
    .unwrap();
    let x = vec![0.; 2];
    let stream = engine.stream();
    assert!(primitive
        .execute(&stream, ExecArgs::new().input(ArgRole::Src, &x))
        .is_err());
    assert!(stream.wait().is_ok());
}
