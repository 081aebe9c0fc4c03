//! Layers moving whole channels: Concat, ChannelSplit, ChannelSplitRatioLeft,
//! ChannelSplitRatioRight, ChannelZeroPad and Shuffle.
use super::{BackwardIo, ForwardIo, InitContext, LayerConfig, LayerType, Operator};
use crate::tensor::{
    parallel::{for_i, get_threads, SyncSliceMut},
    Dims, Format,
};
use anyhow::{bail, Result};

/// Channels of the right part of a ratio split.
pub(crate) fn ratio_split(channels: usize, ratio: f32) -> (usize, usize) {
    let right = ((channels as f32 * ratio).round() as usize).min(channels);
    (channels - right, right)
}

/// Source of every output channel, `(input, channel)` or `None` for zeros.
#[derive(Debug)]
pub(crate) struct ChannelMap {
    map: Vec<Option<(usize, usize)>>,
}

impl ChannelMap {
    pub(crate) fn new(
        layer_type: LayerType,
        config: &LayerConfig,
        inputs: &[(LayerType, Dims)],
    ) -> Result<Self> {
        let c = inputs[0].1.c;
        let map: Vec<Option<(usize, usize)>> = match layer_type {
            LayerType::Concat => inputs
                .iter()
                .enumerate()
                .flat_map(|(k, (_, dims))| (0..dims.c).map(move |i| Some((k, i))))
                .collect(),
            LayerType::ChannelSplit => {
                let (groups, group) = (config.groups, config.group);
                if groups == 0 || c % groups != 0 || group == 0 || group > groups {
                    bail!("Cannot split {c} channels into group {group} of {groups}!");
                }
                let len = c / groups;
                ((group - 1) * len..group * len).map(|i| Some((0, i))).collect()
            }
            LayerType::ChannelSplitRatioLeft => {
                let (left, _) = ratio_split(c, config.ratio);
                (0..left).map(|i| Some((0, i))).collect()
            }
            LayerType::ChannelSplitRatioRight => {
                let (left, _) = ratio_split(c, config.ratio);
                (left..c).map(|i| Some((0, i))).collect()
            }
            LayerType::ChannelZeroPad => {
                if config.channels < c {
                    bail!("Cannot pad {c} channels to {}!", config.channels);
                }
                (0..config.channels)
                    .map(|i| (i < c).then_some((0, i)))
                    .collect()
            }
            LayerType::Shuffle => {
                let groups = config.groups;
                if groups == 0 || c % groups != 0 {
                    bail!("Cannot shuffle {c} channels in {groups} groups!");
                }
                let per_group = c / groups;
                (0..c)
                    .map(|o| Some((0, (o % groups) * per_group + o / groups)))
                    .collect()
            }
            t => bail!("{t} is not a channel layer!"),
        };
        if map.is_empty() {
            bail!("{layer_type} has no output channels!");
        }
        Ok(Self { map })
    }
}

impl Operator for ChannelMap {
    fn output_dims(&self, inputs: &[Dims]) -> Result<Dims> {
        let first = inputs[0];
        if let Some(other) = inputs
            .iter()
            .find(|x| (x.d, x.h, x.w) != (first.d, first.h, first.w))
        {
            bail!("Spatial dims of {other:?} differ from {first:?}!");
        }
        Ok(Dims {
            c: self.map.len(),
            ..first
        })
    }
    fn initialize(&mut self, ctx: &InitContext) -> Result<Format> {
        Ok(ctx.input_format())
    }
    fn resets_gradient(&self) -> bool {
        true
    }
    fn forward(&mut self, io: ForwardIo) -> Result<()> {
        let ForwardIo {
            inputs,
            output,
            d_output,
            ..
        } = io;
        let desc = output.desc;
        let (sample_len, spatial) = (desc.sample_len(), desc.dims.spatial());
        let y = SyncSliceMut::new(output.data);
        let d_y = d_output.map(SyncSliceMut::new);
        let map = &self.map;
        for_i(desc.batch, get_threads(desc.len(), 1), |n| {
            let y = unsafe { y.slice_mut(n * sample_len, sample_len) };
            y.fill(0.);
            for (o, source) in map.iter().enumerate() {
                if let Some((k, i)) = *source {
                    let x = &inputs[k];
                    for s in 0..spatial {
                        y[desc.offset(0, o, s)] = x.data[x.desc.offset(n, i, s)];
                    }
                }
            }
            if let Some(d_y) = d_y.as_ref() {
                unsafe { d_y.slice_mut(n * sample_len, sample_len) }.fill(0.);
            }
        });
        Ok(())
    }
    fn backward(&mut self, mut io: BackwardIo) -> Result<()> {
        let (dy, d_inputs) = io.separate()?;
        let desc = io.output.desc;
        let spatial = desc.dims.spatial();
        let d_inputs: Vec<_> = d_inputs
            .into_iter()
            .map(|x| x.map(SyncSliceMut::new))
            .collect();
        let inputs = &io.inputs;
        let accumulate = &io.accumulate;
        let map = &self.map;
        for_i(desc.batch, get_threads(desc.len(), 1), |n| {
            for (o, source) in map.iter().enumerate() {
                let Some((k, i)) = *source else {
                    continue;
                };
                let Some(dx) = d_inputs[k].as_ref() else {
                    continue;
                };
                let x = inputs[k].desc;
                for s in 0..spatial {
                    let g = dy[desc.offset(n, o, s)];
                    // each (n, i, s) of an input is written by exactly one output position
                    let dx = unsafe { dx.get_mut(x.offset(n, i, s)) };
                    if accumulate[k] {
                        *dx += g;
                    } else {
                        *dx = g;
                    }
                }
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(layer_type: LayerType, config: &LayerConfig, c: usize) -> Vec<Option<(usize, usize)>> {
        let inputs = [(LayerType::Convolution, Dims::new(c, 1, 2, 2))];
        ChannelMap::new(layer_type, config, &inputs).unwrap().map
    }

    #[test]
    fn split_ratio_rounds_right() {
        assert_eq!(ratio_split(10, 0.375), (6, 4));
        assert_eq!(ratio_split(8, 0.5), (4, 4));
        let config = LayerConfig {
            ratio: 0.375,
            ..LayerConfig::default()
        };
        assert_eq!(map(LayerType::ChannelSplitRatioLeft, &config, 10).len(), 6);
        assert_eq!(
            map(LayerType::ChannelSplitRatioRight, &config, 10)[0],
            Some((0, 6))
        );
    }

    #[test]
    fn shuffle_interleaves_groups() {
        let config = LayerConfig {
            groups: 2,
            ..LayerConfig::default()
        };
        let sources: Vec<usize> = map(LayerType::Shuffle, &config, 6)
            .into_iter()
            .map(|x| x.unwrap().1)
            .collect();
        assert_eq!(sources, [0, 3, 1, 4, 2, 5]);
    }

    #[test]
    fn split_and_pad() {
        let config = LayerConfig {
            groups: 3,
            group: 2,
            channels: 8,
            ..LayerConfig::default()
        };
        let split = map(LayerType::ChannelSplit, &config, 9);
        assert_eq!(split, [Some((0, 3)), Some((0, 4)), Some((0, 5))]);
        let pad = map(LayerType::ChannelZeroPad, &config, 5);
        assert_eq!(pad.len(), 8);
        assert_eq!(pad[5], None);
        let inputs = [(LayerType::Convolution, Dims::new(9, 1, 2, 2))];
        let config = LayerConfig {
            groups: 2,
            ..config
        };
        assert!(ChannelMap::new(LayerType::ChannelSplit, &config, &inputs).is_err());
    }
}
