//! Summary statistics of layer buffers.
use crate::tensor::parallel::PARALLEL_THRESHOLD;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Values with a magnitude at or above this are treated as a blow up.
pub const SANE_LIMIT: f32 = 1e10;

/// Mean, standard deviation and range of a buffer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Statistics {
    /// Mean.
    pub mean: f32,
    /// Population standard deviation.
    pub stddev: f32,
    /// Minimum.
    pub min: f32,
    /// Maximum.
    pub max: f32,
}

impl Statistics {
    /// Whether every field is finite and inside [`SANE_LIMIT`].
    pub fn is_sane(&self) -> bool {
        [self.mean, self.stddev, self.min, self.max]
            .iter()
            .all(|x| x.is_finite() && x.abs() < SANE_LIMIT)
    }
}

/// Compensated accumulator.
#[derive(Clone, Copy, Debug, Default)]
struct Kahan {
    sum: f64,
    c: f64,
}

impl Kahan {
    fn add(&mut self, x: f64) {
        let y = x - self.c;
        let t = self.sum + y;
        self.c = (t - self.sum) - y;
        self.sum = t;
    }
    fn merge(mut self, other: Self) -> Self {
        self.add(other.sum);
        self.add(-other.c);
        self
    }
}

#[derive(Clone, Copy, Debug)]
struct Partial {
    sum: Kahan,
    sq: Kahan,
    min: f32,
    max: f32,
}

impl Default for Partial {
    fn default() -> Self {
        Self {
            sum: Kahan::default(),
            sq: Kahan::default(),
            min: f32::INFINITY,
            max: f32::NEG_INFINITY,
        }
    }
}

impl Partial {
    fn from_slice(data: &[f32]) -> Self {
        let mut partial = Self::default();
        for x in data.iter().copied() {
            partial.sum.add(x as f64);
            partial.sq.add(x as f64 * x as f64);
            partial.min = partial.min.min(x);
            partial.max = partial.max.max(x);
        }
        partial
    }
    fn merge(self, other: Self) -> Self {
        Self {
            sum: self.sum.merge(other.sum),
            sq: self.sq.merge(other.sq),
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }
}

/// Computes the statistics of `data`, `None` when the result is not sane.
///
/// Large buffers are reduced in parallel chunks.
pub fn compute(data: &[f32]) -> Option<Statistics> {
    if data.is_empty() {
        return Some(Statistics::default());
    }
    if data.iter().any(|x| !x.is_finite()) {
        return None;
    }
    let partial = if data.len() >= PARALLEL_THRESHOLD {
        data.par_chunks(PARALLEL_THRESHOLD / 4)
            .map(Partial::from_slice)
            .reduce(Partial::default, Partial::merge)
    } else {
        Partial::from_slice(data)
    };
    let n = data.len() as f64;
    let mean = partial.sum.sum / n;
    let variance = (partial.sq.sum / n - mean * mean).max(0.);
    let stats = Statistics {
        mean: mean as f32,
        stddev: variance.sqrt() as f32,
        min: partial.min,
        max: partial.max,
    };
    stats.is_sane().then_some(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn serial_and_parallel_agree() {
        let data: Vec<f32> = (0..PARALLEL_THRESHOLD * 3 + 17)
            .map(|i| ((i % 1000) as f32 - 500.) * 0.01)
            .collect();
        let parallel = compute(&data).unwrap();
        let serial = {
            let partial = Partial::from_slice(&data);
            let n = data.len() as f64;
            let mean = partial.sum.sum / n;
            (mean as f32, (partial.sq.sum / n - mean * mean).sqrt() as f32)
        };
        assert_relative_eq!(parallel.mean, serial.0, epsilon = 1e-5);
        assert_relative_eq!(parallel.stddev, serial.1, epsilon = 1e-5);
        assert_relative_eq!(parallel.min, -5., epsilon = 1e-5);
        assert_relative_eq!(parallel.max, 4.99, epsilon = 1e-5);
    }

    #[test]
    fn small_buffer() {
        let stats = compute(&[1., 2., 3., 4.]).unwrap();
        assert_relative_eq!(stats.mean, 2.5);
        assert_relative_eq!(stats.stddev, 1.25f32.sqrt());
        assert_eq!((stats.min, stats.max), (1., 4.));
    }

    #[test]
    fn rejects_blow_up() {
        assert!(compute(&[1., f32::NAN]).is_none());
        assert!(compute(&[1., 2e10]).is_none());
        assert!(compute(&[1., f32::INFINITY]).is_none());
    }
}
