use std::ops::{Add, Div, Mul, Neg, Sub};
use wide::f32x8;

/// A scalar or a vector of channel lanes, the unit the hand written kernels iterate with.
///
/// Plain kernels run on `f32`, blocked kernels on `f32x8` so one vector covers one channel block.
pub(crate) trait Lane:
    Copy
    + Default
    + Send
    + Sync
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
    + Neg<Output = Self>
{
    const WIDTH: usize;
    fn splat(x: f32) -> Self;
    /// Loads the first `WIDTH` elements.
    fn load(data: &[f32]) -> Self;
    /// Stores into the first `WIDTH` elements.
    fn store(self, data: &mut [f32]);
    fn map(self, f: impl Fn(f32) -> f32) -> Self;
    fn zip_map(self, other: Self, f: impl Fn(f32, f32) -> f32) -> Self;
    fn max(self, other: Self) -> Self;
    fn min(self, other: Self) -> Self;
    /// Adds every lane into `data[..WIDTH]`.
    fn add_to(self, data: &mut [f32]) {
        let mut x = Self::load(data);
        x = x + self;
        x.store(data);
    }
    /// Stores or adds.
    fn write(self, data: &mut [f32], accumulate: bool) {
        if accumulate {
            self.add_to(data);
        } else {
            self.store(data);
        }
    }
}

impl Lane for f32 {
    const WIDTH: usize = 1;
    #[inline]
    fn splat(x: f32) -> Self {
        x
    }
    #[inline]
    fn load(data: &[f32]) -> Self {
        data[0]
    }
    #[inline]
    fn store(self, data: &mut [f32]) {
        data[0] = self;
    }
    #[inline]
    fn map(self, f: impl Fn(f32) -> f32) -> Self {
        f(self)
    }
    #[inline]
    fn zip_map(self, other: Self, f: impl Fn(f32, f32) -> f32) -> Self {
        f(self, other)
    }
    #[inline]
    fn max(self, other: Self) -> Self {
        f32::max(self, other)
    }
    #[inline]
    fn min(self, other: Self) -> Self {
        f32::min(self, other)
    }
}

impl Lane for f32x8 {
    const WIDTH: usize = 8;
    #[inline]
    fn splat(x: f32) -> Self {
        f32x8::splat(x)
    }
    #[inline]
    fn load(data: &[f32]) -> Self {
        let mut array = [0f32; 8];
        array.copy_from_slice(&data[..8]);
        f32x8::from(array)
    }
    #[inline]
    fn store(self, data: &mut [f32]) {
        data[..8].copy_from_slice(self.as_array_ref());
    }
    #[inline]
    fn map(self, f: impl Fn(f32) -> f32) -> Self {
        let mut array = self.to_array();
        array.iter_mut().for_each(|x| *x = f(*x));
        f32x8::from(array)
    }
    #[inline]
    fn zip_map(self, other: Self, f: impl Fn(f32, f32) -> f32) -> Self {
        let mut array = self.to_array();
        array
            .iter_mut()
            .zip(other.as_array_ref())
            .for_each(|(x, y)| *x = f(*x, *y));
        f32x8::from(array)
    }
    #[inline]
    fn max(self, other: Self) -> Self {
        f32x8::max(self, other)
    }
    #[inline]
    fn min(self, other: Self) -> Self {
        f32x8::min(self, other)
    }
}
