//! Activation and weight buffer layouts.
//!
//! Activations are stored per layer as a flat `Vec<f32>` of `batch` samples. Within a sample,
//! the [`Format`] decides the physical order:
//! - [`Format::Plain`]: contiguous `C x D x H x W`.
//! - [`Format::Blocked`]: channels are split into blocks of [`VECTOR_SIZE`], stored
//!   as `C/8 x D x H x W x 8`. The channel count is padded up to a multiple of the vector width
//!   and the padding lanes are kept at zero.
//!
//! Weights are persisted as `O x I x KH x KW` ([`WeightFormat::Oihw`]). The engine may prefer
//! [`WeightFormat::Blocked`], where output channels are blocked like activations.
use anyhow::{bail, Result};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Parallel helpers.
pub mod parallel;

#[cfg(test)]
mod tests;

/// Width of the vectorized channel blocks.
pub const VECTOR_SIZE: usize = 8;

/// Rounds `x` up to a multiple of `multiple`.
pub const fn round_up(x: usize, multiple: usize) -> usize {
    (x + multiple - 1) / multiple * multiple
}

/// Physical layout of an activation tensor.
#[derive(Clone, Copy, Debug, Default, Display, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Format {
    /// Contiguous NCDHW.
    #[default]
    Plain,
    /// Channel blocked NC/8DHW8.
    Blocked,
}

impl FromStr for Format {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Plain" => Ok(Self::Plain),
            "Blocked" => Ok(Self::Blocked),
            _ => bail!("Unknown format {s:?}!"),
        }
    }
}

/// Logical per sample shape of a layer output.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Dims {
    /// Channels.
    pub c: usize,
    /// Depth.
    pub d: usize,
    /// Height.
    pub h: usize,
    /// Width.
    pub w: usize,
}

impl Dims {
    /// Creates dims.
    pub const fn new(c: usize, d: usize, h: usize, w: usize) -> Self {
        Self { c, d, h, w }
    }
    /// `d * h * w`.
    pub const fn spatial(&self) -> usize {
        self.d * self.h * self.w
    }
    /// Number of logical elements in one sample.
    pub const fn size(&self) -> usize {
        self.c * self.spatial()
    }
    /// Whether the spatial extent is a single element.
    pub const fn is_unit_spatial(&self) -> bool {
        self.spatial() == 1
    }
    /// Channels padded up to the vector width.
    pub const fn padded_c(&self) -> usize {
        round_up(self.c, VECTOR_SIZE)
    }
}

/// Layout of a batched activation tensor.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub struct MemoryDesc {
    /// Number of samples.
    pub batch: usize,
    /// Logical per sample dims.
    pub dims: Dims,
    /// Physical layout.
    pub format: Format,
}

impl MemoryDesc {
    /// Creates a new desc.
    pub const fn new(batch: usize, dims: Dims, format: Format) -> Self {
        Self {
            batch,
            dims,
            format,
        }
    }
    /// Returns a copy with `format`.
    pub const fn with_format(self, format: Format) -> Self {
        Self { format, ..self }
    }
    /// Returns a copy with `batch`.
    pub const fn with_batch(self, batch: usize) -> Self {
        Self { batch, ..self }
    }
    /// The channel stride of the physical layout, ie the stored channel count.
    pub const fn stored_c(&self) -> usize {
        match self.format {
            Format::Plain => self.dims.c,
            Format::Blocked => self.dims.padded_c(),
        }
    }
    /// Channel blocks, only meaningful for [`Format::Blocked`].
    pub const fn blocks(&self) -> usize {
        self.dims.padded_c() / VECTOR_SIZE
    }
    /// Physical elements per sample.
    pub const fn sample_len(&self) -> usize {
        self.stored_c() * self.dims.spatial()
    }
    /// Physical elements of the batch.
    pub const fn len(&self) -> usize {
        self.batch * self.sample_len()
    }
    /// Whether the tensor is empty.
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// Physical offset of sample `n`, channel `c`, spatial position `s`.
    #[inline]
    pub fn offset(&self, n: usize, c: usize, s: usize) -> usize {
        debug_assert!(c < self.stored_c());
        debug_assert!(s < self.dims.spatial());
        let spatial = self.dims.spatial();
        match self.format {
            Format::Plain => (n * self.dims.c + c) * spatial + s,
            Format::Blocked => {
                ((n * self.blocks() + c / VECTOR_SIZE) * spatial + s) * VECTOR_SIZE
                    + c % VECTOR_SIZE
            }
        }
    }
    /// Logical channel of a physical offset inside a sample.
    ///
    /// Returns a value `>= dims.c` for padding lanes.
    #[inline]
    pub fn channel_of(&self, offset_in_sample: usize) -> usize {
        let spatial = self.dims.spatial();
        match self.format {
            Format::Plain => offset_in_sample / spatial,
            Format::Blocked => {
                (offset_in_sample / VECTOR_SIZE / spatial) * VECTOR_SIZE
                    + offset_in_sample % VECTOR_SIZE
            }
        }
    }
    /// Whether the layout has channel padding lanes.
    pub const fn has_padding(&self) -> bool {
        matches!(self.format, Format::Blocked) && self.dims.c % VECTOR_SIZE != 0
    }
}

/// Copies `src` into `dst`, converting between physical layouts.
///
/// **Errors**
///
/// The logical dims or the buffer lengths differ.
pub fn reorder(src: &MemoryDesc, src_data: &[f32], dst: &MemoryDesc, dst_data: &mut [f32]) -> Result<()> {
    if src.dims != dst.dims || src.batch != dst.batch {
        bail!("Cannot reorder {src:?} into {dst:?}!");
    }
    if src_data.len() < src.len() || dst_data.len() < dst.len() {
        bail!(
            "Reorder buffer too small, src {} / {} dst {} / {}!",
            src_data.len(),
            src.len(),
            dst_data.len(),
            dst.len()
        );
    }
    if src.format == dst.format {
        dst_data[..dst.len()].copy_from_slice(&src_data[..src.len()]);
        return Ok(());
    }
    let spatial = src.dims.spatial();
    let sample_len = dst.sample_len();
    let fill = |n: usize, dst_sample: &mut [f32]| {
        dst_sample.fill(0.);
        for c in 0..src.dims.c {
            for s in 0..spatial {
                dst_sample[dst.offset(0, c, s)] = src_data[src.offset(n, c, s)];
            }
        }
    };
    if src.len() >= parallel::PARALLEL_THRESHOLD {
        use rayon::prelude::*;
        dst_data[..dst.len()]
            .par_chunks_mut(sample_len)
            .enumerate()
            .for_each(|(n, dst_sample)| fill(n, dst_sample));
    } else {
        dst_data[..dst.len()]
            .chunks_mut(sample_len)
            .enumerate()
            .for_each(|(n, dst_sample)| fill(n, dst_sample));
    }
    Ok(())
}

/// Physical layout of convolution and dense weights.
#[derive(Clone, Copy, Debug, Default, Display, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum WeightFormat {
    /// Output, input, kernel height, kernel width. The persisted layout.
    #[default]
    Oihw,
    /// Output channels blocked by the vector width, innermost.
    Blocked,
}

/// Logical shape of a weight tensor.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct WeightDims {
    /// Outputs.
    pub o: usize,
    /// Inputs (per group).
    pub i: usize,
    /// Kernel height.
    pub kh: usize,
    /// Kernel width.
    pub kw: usize,
}

impl WeightDims {
    /// Creates weight dims.
    pub const fn new(o: usize, i: usize, kh: usize, kw: usize) -> Self {
        Self { o, i, kh, kw }
    }
    /// Logical elements.
    pub const fn size(&self) -> usize {
        self.o * self.i * self.kh * self.kw
    }
    /// Physical elements for `format`.
    pub const fn len(&self, format: WeightFormat) -> usize {
        match format {
            WeightFormat::Oihw => self.size(),
            WeightFormat::Blocked => round_up(self.o, VECTOR_SIZE) * self.i * self.kh * self.kw,
        }
    }
    /// Physical offset of element `[o, i, y, x]`.
    #[inline]
    pub fn offset(&self, format: WeightFormat, o: usize, i: usize, y: usize, x: usize) -> usize {
        let inner = (i * self.kh + y) * self.kw + x;
        let per_o = self.i * self.kh * self.kw;
        match format {
            WeightFormat::Oihw => o * per_o + inner,
            WeightFormat::Blocked => {
                ((o / VECTOR_SIZE) * per_o + inner) * VECTOR_SIZE + o % VECTOR_SIZE
            }
        }
    }
}

/// Copies `src` weights into `dst`, converting between weight layouts.
pub fn reorder_weights(
    dims: &WeightDims,
    src_format: WeightFormat,
    src: &[f32],
    dst_format: WeightFormat,
    dst: &mut [f32],
) -> Result<()> {
    if src.len() != dims.len(src_format) || dst.len() != dims.len(dst_format) {
        bail!(
            "Cannot reorder weights {dims:?} {src_format} ({}) into {dst_format} ({})!",
            src.len(),
            dst.len()
        );
    }
    if src_format == dst_format {
        dst.copy_from_slice(src);
        return Ok(());
    }
    dst.fill(0.);
    for o in 0..dims.o {
        for i in 0..dims.i {
            for y in 0..dims.kh {
                for x in 0..dims.kw {
                    dst[dims.offset(dst_format, o, i, y, x)] =
                        src[dims.offset(src_format, o, i, y, x)];
                }
            }
        }
    }
    Ok(())
}

/// Returns a new buffer with `src` converted to `dst_format`.
pub fn reordered_weights(
    dims: &WeightDims,
    src_format: WeightFormat,
    src: &[f32],
    dst_format: WeightFormat,
) -> Result<Vec<f32>> {
    let mut dst = vec![0.; dims.len(dst_format)];
    reorder_weights(dims, src_format, src, dst_format, &mut dst)?;
    Ok(dst)
}
