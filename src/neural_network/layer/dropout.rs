use super::{write_slice, BackwardIo, ForwardIo, InitContext, Operator};
use crate::tensor::{
    parallel::{for_i, get_threads, SyncSliceMut},
    Dims, Format,
};
use anyhow::Result;
use rand::{distributions::Bernoulli, Rng};

/// Fills an inverted dropout mask, kept elements are scaled by `1 / (1 - p)`.
pub(crate) fn fill_mask(mask: &mut [f32], p: f32) -> Result<()> {
    let keep = Bernoulli::new(1. - f64::from(p))?;
    let scale = (1. - p).recip();
    let mut rng = rand::thread_rng();
    for x in mask.iter_mut() {
        *x = if rng.sample(keep) { scale } else { 0. };
    }
    Ok(())
}

/// Drops elements with probability `p` in training, identity in inference.
#[derive(Debug)]
pub(crate) struct Dropout {
    p: f32,
    mask: Vec<f32>,
}

impl Dropout {
    pub(crate) fn new(p: f32) -> Self {
        Self {
            p,
            mask: Vec::new(),
        }
    }
}

impl Operator for Dropout {
    fn output_dims(&self, inputs: &[Dims]) -> Result<Dims> {
        Ok(inputs[0])
    }
    fn initialize(&mut self, ctx: &InitContext) -> Result<Format> {
        self.mask.clear();
        Ok(ctx.input_format())
    }
    fn resets_gradient(&self) -> bool {
        true
    }
    fn forward(&mut self, io: ForwardIo) -> Result<()> {
        let ForwardIo {
            training,
            inputs,
            output,
            d_output,
            ..
        } = io;
        let x = inputs[0].data;
        let len = output.desc.len();
        if !training {
            output.data[..len].copy_from_slice(&x[..len]);
            return Ok(());
        }
        self.mask.resize(len, 0.);
        fill_mask(&mut self.mask, self.p)?;
        let sample_len = output.desc.sample_len();
        let mask = &self.mask;
        let y = SyncSliceMut::new(output.data);
        let d_y = d_output.map(SyncSliceMut::new);
        for_i(output.desc.batch, get_threads(len, 1), |n| {
            let range = n * sample_len..(n + 1) * sample_len;
            let y = unsafe { y.slice_mut(range.start, sample_len) };
            for ((y, x), m) in y.iter_mut().zip(&x[range.clone()]).zip(&mask[range.clone()]) {
                *y = x * m;
            }
            if let Some(d_y) = d_y.as_ref() {
                unsafe { d_y.slice_mut(range.start, sample_len) }.fill(0.);
            }
        });
        Ok(())
    }
    fn backward(&mut self, mut io: BackwardIo) -> Result<()> {
        let (dy, d_inputs) = io.separate()?;
        let Some(dx) = d_inputs.into_iter().next().flatten() else {
            return Ok(());
        };
        let len = io.output.desc.len();
        let dy: Vec<f32> = dy[..len]
            .iter()
            .zip(&self.mask)
            .map(|(dy, m)| dy * m)
            .collect();
        write_slice(&mut dx[..len], &dy, io.accumulate[0]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_is_inverted() -> Result<()> {
        let mut mask = vec![0f32; 10_000];
        fill_mask(&mut mask, 0.25)?;
        let kept = mask.iter().filter(|x| **x != 0.).count();
        assert!(mask.iter().all(|x| *x == 0. || (*x - 4. / 3.).abs() < 1e-6));
        assert!((7000..8000).contains(&kept), "{kept}");
        fill_mask(&mut mask, 0.)?;
        assert!(mask.iter().all(|x| *x == 1.));
        Ok(())
    }
}
