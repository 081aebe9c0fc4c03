//! Elementwise layers of two inputs.
//!
//! The operand with the larger shape is "first" and defines the output. The second operand either
//! has the same shape or a single spatial element, in which case it is broadcast over the spatial
//! positions of its channel. Training runs hand written kernels for the four combinations of
//! layout (plain / blocked) and shape (equal / broadcast), all generated from one generic row
//! routine parameterized by the op and its partial derivatives. Inference runs the engine
//! primitive.
use super::{
    execute, lane::Lane, zero_padding, BackwardIo, ForwardIo, InitContext, LayerType, Operator, TensorRef,
};
use crate::{
    engine::{BinaryAlgorithm, BinaryDesc, ExecArgs, ArgRole, Primitive, PrimitiveDesc},
    error::LayerError,
    tensor::{
        parallel::{for_i, get_threads, SyncSliceMut},
        Dims, Format, MemoryDesc, VECTOR_SIZE,
    },
};
use anyhow::{bail, Result};
use dry::macro_for;
use std::marker::PhantomData;
use wide::f32x8;

/// The elementwise operation of a binary layer.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub(crate) enum BinaryOp {
    Add,
    Substract,
    Multiply,
    Divide,
    Max,
    Min,
    Average,
}

impl BinaryOp {
    pub(crate) fn from_layer_type(layer_type: LayerType) -> Option<Self> {
        let op = match layer_type {
            LayerType::Add => Self::Add,
            LayerType::Substract => Self::Substract,
            LayerType::Multiply => Self::Multiply,
            LayerType::Divide => Self::Divide,
            LayerType::Max => Self::Max,
            LayerType::Min => Self::Min,
            LayerType::Average => Self::Average,
            _ => return None,
        };
        Some(op)
    }
    fn algorithm(self) -> BinaryAlgorithm {
        match self {
            Self::Add => BinaryAlgorithm::Add,
            Self::Substract => BinaryAlgorithm::Sub,
            Self::Multiply => BinaryAlgorithm::Mul,
            Self::Divide => BinaryAlgorithm::Div,
            Self::Max => BinaryAlgorithm::Max,
            Self::Min => BinaryAlgorithm::Min,
            Self::Average => BinaryAlgorithm::Avg,
        }
    }
}

/// An op with its partial derivatives scaled by the output gradient.
trait Kernel: Send + Sync + 'static {
    fn f<L: Lane>(a: L, b: L) -> L;
    fn da<L: Lane>(a: L, b: L, dy: L) -> L;
    fn db<L: Lane>(a: L, b: L, dy: L) -> L;
}

mod kernels {
    use super::{Kernel, Lane};

    pub(super) struct Add;

    impl Kernel for Add {
        fn f<L: Lane>(a: L, b: L) -> L {
            a + b
        }
        fn da<L: Lane>(_a: L, _b: L, dy: L) -> L {
            dy
        }
        fn db<L: Lane>(_a: L, _b: L, dy: L) -> L {
            dy
        }
    }

    pub(super) struct Substract;

    impl Kernel for Substract {
        fn f<L: Lane>(a: L, b: L) -> L {
            a - b
        }
        fn da<L: Lane>(_a: L, _b: L, dy: L) -> L {
            dy
        }
        fn db<L: Lane>(_a: L, _b: L, dy: L) -> L {
            -dy
        }
    }

    pub(super) struct Multiply;

    impl Kernel for Multiply {
        fn f<L: Lane>(a: L, b: L) -> L {
            a * b
        }
        fn da<L: Lane>(_a: L, b: L, dy: L) -> L {
            dy * b
        }
        fn db<L: Lane>(a: L, _b: L, dy: L) -> L {
            dy * a
        }
    }

    pub(super) struct Divide;

    impl Kernel for Divide {
        fn f<L: Lane>(a: L, b: L) -> L {
            a / b
        }
        fn da<L: Lane>(_a: L, b: L, dy: L) -> L {
            dy / b
        }
        fn db<L: Lane>(a: L, b: L, dy: L) -> L {
            -(dy * a / (b * b))
        }
    }

    // Ties route the gradient to the first operand.
    pub(super) struct Max;

    impl Kernel for Max {
        fn f<L: Lane>(a: L, b: L) -> L {
            a.max(b)
        }
        fn da<L: Lane>(a: L, b: L, dy: L) -> L {
            dy * a.zip_map(b, |a, b| if a >= b { 1. } else { 0. })
        }
        fn db<L: Lane>(a: L, b: L, dy: L) -> L {
            dy * a.zip_map(b, |a, b| if a >= b { 0. } else { 1. })
        }
    }

    pub(super) struct Min;

    impl Kernel for Min {
        fn f<L: Lane>(a: L, b: L) -> L {
            a.min(b)
        }
        fn da<L: Lane>(a: L, b: L, dy: L) -> L {
            dy * a.zip_map(b, |a, b| if a <= b { 1. } else { 0. })
        }
        fn db<L: Lane>(a: L, b: L, dy: L) -> L {
            dy * a.zip_map(b, |a, b| if a <= b { 0. } else { 1. })
        }
    }

    pub(super) struct Average;

    impl Kernel for Average {
        fn f<L: Lane>(a: L, b: L) -> L {
            L::splat(0.5) * (a + b)
        }
        fn da<L: Lane>(_a: L, _b: L, dy: L) -> L {
            L::splat(0.5) * dy
        }
        fn db<L: Lane>(_a: L, _b: L, dy: L) -> L {
            L::splat(0.5) * dy
        }
    }
}

/// `K` with the operands exchanged, used when the second input is the first operand.
struct Swapped<K>(PhantomData<K>);

impl<K: Kernel> Kernel for Swapped<K> {
    fn f<L: Lane>(a: L, b: L) -> L {
        K::f(b, a)
    }
    fn da<L: Lane>(a: L, b: L, dy: L) -> L {
        K::db(b, a, dy)
    }
    fn db<L: Lane>(a: L, b: L, dy: L) -> L {
        K::da(b, a, dy)
    }
}

/// One of the three quantities a pass computes per element.
trait Elementwise {
    fn apply<L: Lane>(a: L, b: L, dy: L) -> L;
}

struct Value<K>(PhantomData<K>);

impl<K: Kernel> Elementwise for Value<K> {
    fn apply<L: Lane>(a: L, b: L, _dy: L) -> L {
        K::f(a, b)
    }
}

struct GradA<K>(PhantomData<K>);

impl<K: Kernel> Elementwise for GradA<K> {
    fn apply<L: Lane>(a: L, b: L, dy: L) -> L {
        K::da(a, b, dy)
    }
}

struct GradB<K>(PhantomData<K>);

impl<K: Kernel> Elementwise for GradB<K> {
    fn apply<L: Lane>(a: L, b: L, dy: L) -> L {
        K::db(a, b, dy)
    }
}

/// The second operand as seen by one row of the first.
#[derive(Clone, Copy)]
enum Operand<'a> {
    /// Same shape.
    Row(&'a [f32]),
    /// One value for the row, plain broadcast.
    Splat(f32),
    /// One channel block for the row, blocked broadcast.
    Vector(&'a [f32]),
}

impl Operand<'_> {
    #[inline]
    fn vector(&self, i: usize) -> f32x8 {
        match self {
            Self::Row(b) => f32x8::load(&b[i..]),
            Self::Splat(x) => <f32x8 as Lane>::splat(*x),
            Self::Vector(v) => f32x8::load(v),
        }
    }
    #[inline]
    fn scalar(&self, i: usize) -> f32 {
        match self {
            Self::Row(b) => b[i],
            Self::Splat(x) => *x,
            Self::Vector(v) => v[i % VECTOR_SIZE],
        }
    }
}

/// `out = E(a, b, dy)` over a row, vectorized with a scalar tail.
fn map_row<E: Elementwise>(a: &[f32], b: Operand, dy: &[f32], out: &mut [f32], accumulate: bool) {
    let len = a.len();
    let body = len / VECTOR_SIZE * VECTOR_SIZE;
    for i in (0..body).step_by(VECTOR_SIZE) {
        let y = E::apply(f32x8::load(&a[i..]), b.vector(i), f32x8::load(&dy[i..]));
        y.write(&mut out[i..], accumulate);
    }
    for i in body..len {
        let y = E::apply(a[i], b.scalar(i), dy[i]);
        if accumulate {
            out[i] += y;
        } else {
            out[i] = y;
        }
    }
}

/// Sum of `E(a, b, dy)` over a row broadcasting one scalar.
fn sum_row_scalar<E: Elementwise>(a: &[f32], b: f32, dy: &[f32]) -> f32 {
    let len = a.len();
    let body = len / VECTOR_SIZE * VECTOR_SIZE;
    let bv = <f32x8 as Lane>::splat(b);
    let mut acc = f32x8::default();
    for i in (0..body).step_by(VECTOR_SIZE) {
        acc = acc + E::apply(f32x8::load(&a[i..]), bv, f32x8::load(&dy[i..]));
    }
    let mut sum: f32 = acc.to_array().iter().sum();
    for i in body..len {
        sum += E::apply(a[i], b, dy[i]);
    }
    sum
}

/// Lane wise sum of `E(a, b, dy)` over a blocked row broadcasting one channel block.
fn sum_row_vector<E: Elementwise>(a: &[f32], b: &[f32], dy: &[f32]) -> f32x8 {
    let bv = f32x8::load(b);
    let mut acc = f32x8::default();
    for i in (0..a.len()).step_by(VECTOR_SIZE) {
        acc = acc + E::apply(f32x8::load(&a[i..]), bv, f32x8::load(&dy[i..]));
    }
    acc
}

/// How one sample of the first operand splits into rows against the second.
#[derive(Clone, Copy, Debug)]
struct Rows {
    /// Rows per sample.
    count: usize,
    /// Elements per row.
    len: usize,
    mode: Mode,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Mode {
    Equal,
    PlainBroadcast,
    BlockedBroadcast,
}

impl Rows {
    fn new(a: &MemoryDesc, b: &MemoryDesc) -> Result<Self> {
        if a.format != b.format || a.dims.c != b.dims.c || a.batch != b.batch {
            bail!("Cannot combine {a:?} with {b:?}!");
        }
        if a.dims == b.dims {
            return Ok(Self {
                count: 1,
                len: a.sample_len(),
                mode: Mode::Equal,
            });
        }
        if !b.dims.is_unit_spatial() {
            bail!("Cannot broadcast {b:?} to {a:?}!");
        }
        let spatial = a.dims.spatial();
        let rows = match a.format {
            Format::Plain => Self {
                count: a.dims.c,
                len: spatial,
                mode: Mode::PlainBroadcast,
            },
            Format::Blocked => Self {
                count: a.blocks(),
                len: spatial * VECTOR_SIZE,
                mode: Mode::BlockedBroadcast,
            },
        };
        Ok(rows)
    }
    fn operand<'b>(&self, b: &'b [f32], r: usize) -> Operand<'b> {
        match self.mode {
            Mode::Equal => Operand::Row(b),
            Mode::PlainBroadcast => Operand::Splat(b[r]),
            Mode::BlockedBroadcast => Operand::Vector(&b[r * VECTOR_SIZE..(r + 1) * VECTOR_SIZE]),
        }
    }
}

fn forward_impl<K: Kernel>(
    a: TensorRef,
    b: TensorRef,
    y: &mut [f32],
    d_y: Option<&mut [f32]>,
) -> Result<()> {
    let rows = Rows::new(&a.desc, &b.desc)?;
    let (a_len, b_len) = (a.desc.sample_len(), b.desc.sample_len());
    let sample = a.desc.with_batch(1);
    let y = SyncSliceMut::new(y);
    let d_y = d_y.map(SyncSliceMut::new);
    for_i(a.desc.batch, get_threads(a.desc.len(), 2), |n| {
        let a = &a.data[n * a_len..(n + 1) * a_len];
        let b = &b.data[n * b_len..(n + 1) * b_len];
        let y = unsafe { y.slice_mut(n * a_len, a_len) };
        for r in 0..rows.count {
            let range = r * rows.len..(r + 1) * rows.len;
            let a = &a[range.clone()];
            map_row::<Value<K>>(a, rows.operand(b, r), a, &mut y[range], false);
        }
        zero_padding(&sample, y);
        if let Some(d_y) = d_y.as_ref() {
            unsafe { d_y.slice_mut(n * a_len, a_len) }.fill(0.);
        }
    });
    Ok(())
}

fn backward_impl<K: Kernel>(
    a: TensorRef,
    b: TensorRef,
    dy: &[f32],
    da: Option<&mut [f32]>,
    db: Option<&mut [f32]>,
    accumulate: [bool; 2],
) -> Result<()> {
    let rows = Rows::new(&a.desc, &b.desc)?;
    let (a_len, b_len) = (a.desc.sample_len(), b.desc.sample_len());
    let (a_sample, b_sample) = (a.desc.with_batch(1), b.desc.with_batch(1));
    let da = da.map(SyncSliceMut::new);
    let db = db.map(SyncSliceMut::new);
    for_i(a.desc.batch, get_threads(a.desc.len(), 4), |n| {
        let a = &a.data[n * a_len..(n + 1) * a_len];
        let b = &b.data[n * b_len..(n + 1) * b_len];
        let dy = &dy[n * a_len..(n + 1) * a_len];
        if let Some(da) = da.as_ref() {
            let da = unsafe { da.slice_mut(n * a_len, a_len) };
            for r in 0..rows.count {
                let range = r * rows.len..(r + 1) * rows.len;
                map_row::<GradA<K>>(
                    &a[range.clone()],
                    rows.operand(b, r),
                    &dy[range.clone()],
                    &mut da[range],
                    accumulate[0],
                );
            }
            zero_padding(&a_sample, da);
        }
        if let Some(db) = db.as_ref() {
            let db = unsafe { db.slice_mut(n * b_len, b_len) };
            for r in 0..rows.count {
                let range = r * rows.len..(r + 1) * rows.len;
                let (a, dy) = (&a[range.clone()], &dy[range.clone()]);
                match rows.mode {
                    Mode::Equal => {
                        map_row::<GradB<K>>(a, Operand::Row(b), dy, db, accumulate[1]);
                    }
                    Mode::PlainBroadcast => {
                        let sum = sum_row_scalar::<GradB<K>>(a, b[r], dy);
                        if accumulate[1] {
                            db[r] += sum;
                        } else {
                            db[r] = sum;
                        }
                    }
                    Mode::BlockedBroadcast => {
                        let block = r * VECTOR_SIZE..(r + 1) * VECTOR_SIZE;
                        let sum = sum_row_vector::<GradB<K>>(a, &b[block.clone()], dy);
                        sum.write(&mut db[block], accumulate[1]);
                    }
                }
            }
            zero_padding(&b_sample, db);
        }
    });
    Ok(())
}

/// Training forward: `y = a op b` and zeroes `d_y`.
///
/// `swapped` computes `b op a`, for layers whose second input is the first operand.
pub(super) fn binary_forward(
    op: BinaryOp,
    swapped: bool,
    a: TensorRef,
    b: TensorRef,
    y: &mut [f32],
    d_y: Option<&mut [f32]>,
) -> Result<()> {
    macro_for!($Op in [Add, Substract, Multiply, Divide, Max, Min, Average] {
        if op == BinaryOp::$Op {
            return if swapped {
                forward_impl::<Swapped<kernels::$Op>>(a, b, y, d_y)
            } else {
                forward_impl::<kernels::$Op>(a, b, y, d_y)
            };
        }
    });
    unreachable!("{op:?}")
}

/// Backward: adds or stores the gradients of both operands.
#[allow(clippy::too_many_arguments)]
pub(super) fn binary_backward(
    op: BinaryOp,
    swapped: bool,
    a: TensorRef,
    b: TensorRef,
    dy: &[f32],
    da: Option<&mut [f32]>,
    db: Option<&mut [f32]>,
    accumulate: [bool; 2],
) -> Result<()> {
    macro_for!($Op in [Add, Substract, Multiply, Divide, Max, Min, Average] {
        if op == BinaryOp::$Op {
            return if swapped {
                backward_impl::<Swapped<kernels::$Op>>(a, b, dy, da, db, accumulate)
            } else {
                backward_impl::<kernels::$Op>(a, b, dy, da, db, accumulate)
            };
        }
    });
    unreachable!("{op:?}")
}

/// Index of the operand defining the output shape.
///
/// More channels wins, then a non unit spatial extent, then the first input.
pub(super) fn first_operand(a: &Dims, b: &Dims) -> usize {
    if a.c != b.c {
        return if a.c > b.c { 0 } else { 1 };
    }
    if a.spatial() != b.spatial() && a.is_unit_spatial() {
        return 1;
    }
    0
}

/// Add, Substract, Multiply, Divide, Max, Min and Average layers.
#[derive(Debug)]
pub(crate) struct Binary {
    op: BinaryOp,
    first: usize,
    primitive: Option<Primitive>,
}

impl Binary {
    pub(crate) fn new(layer_type: LayerType, inputs: &[(LayerType, Dims)]) -> Self {
        let op = BinaryOp::from_layer_type(layer_type)
            .unwrap_or_else(|| panic!("{layer_type} is not a binary layer!"));
        assert_eq!(inputs.len(), 2, "{layer_type} takes two inputs!");
        let (a, b) = (inputs[0].1, inputs[1].1);
        assert_eq!(
            a.c, b.c,
            "{layer_type} inputs have different channels {} != {}!",
            a.c, b.c
        );
        Self {
            op,
            first: first_operand(&a, &b),
            primitive: None,
        }
    }
    fn operands<'a>(&self, inputs: &[TensorRef<'a>]) -> (TensorRef<'a>, TensorRef<'a>) {
        (inputs[self.first], inputs[1 - self.first])
    }
}

impl Operator for Binary {
    fn output_dims(&self, inputs: &[Dims]) -> Result<Dims> {
        let (a, b) = (inputs[self.first], inputs[1 - self.first]);
        if a.c != b.c || (a.spatial() != b.spatial() && !b.is_unit_spatial()) {
            bail!("Cannot broadcast {b:?} to {a:?}!");
        }
        Ok(a)
    }
    fn initialize(&mut self, ctx: &InitContext) -> Result<Format> {
        let (a, b) = (ctx.inputs[self.first], ctx.inputs[1 - self.first]);
        if a.format != b.format {
            return Err(LayerError::Format {
                layer: ctx.name.into(),
                reason: format!("{} and {}", a.format, b.format),
            }
            .into());
        }
        if a.dims.c != b.dims.c || (a.dims != b.dims && !b.dims.is_unit_spatial()) {
            return Err(LayerError::Shape {
                layer: ctx.name.into(),
                reason: format!("{:?} and {:?}", a.dims, b.dims),
            }
            .into());
        }
        let desc = BinaryDesc {
            src0: a,
            src1: b,
            dst: ctx.output(a.format),
            algorithm: self.op.algorithm(),
            reversed: self.first == 1,
        };
        self.primitive
            .replace(Primitive::new(ctx.engine, PrimitiveDesc::Binary(desc))?);
        Ok(a.format)
    }
    fn resets_gradient(&self) -> bool {
        true
    }
    fn forward(&mut self, io: ForwardIo) -> Result<()> {
        let (a, b) = self.operands(&io.inputs);
        if io.training {
            return binary_forward(self.op, self.first == 1, a, b, io.output.data, io.d_output);
        }
        let args = ExecArgs::new()
            .input(ArgRole::Src, a.data)
            .input(ArgRole::Src1, b.data)
            .output(ArgRole::Dst, io.output.data);
        execute(self.primitive.as_ref(), io.stream, args)
    }
    fn backward(&mut self, mut io: BackwardIo) -> Result<()> {
        let (a, b) = self.operands(&io.inputs);
        let (dy, mut d_inputs) = io.separate()?;
        let (first, second) = (self.first, 1 - self.first);
        let accumulate = [io.accumulate[first], io.accumulate[second]];
        let (da, db) = if first == 0 {
            let db = d_inputs.pop().flatten();
            (d_inputs.pop().flatten(), db)
        } else {
            let da = d_inputs.pop().flatten();
            (da, d_inputs.pop().flatten())
        };
        binary_backward(self.op, self.first == 1, a, b, dy, da, db, accumulate)
    }
}
