//! Forward and backward edges of the layer graph.
//!
//! Gradient buffers are owned per layer. A layer whose backward runs in place shares the buffer
//! of its input convolution instead of owning one, and every buffer written by more than one
//! backward pass is accumulated into.
use super::layer::{Layer, LayerType};

/// Who holds the output gradient of a layer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum GradStorage {
    /// No gradient is needed, ie the input layer, cost layers and layers nothing trainable
    /// depends on.
    None,
    /// The layer owns its gradient buffer.
    Owns,
    /// The gradient lives in the buffer of the given layer.
    Aliases(usize),
}

#[derive(Debug, Default)]
pub(crate) struct Graph {
    consumers: Vec<Vec<usize>>,
    storage: Vec<GradStorage>,
    inplace: Vec<bool>,
    propagates: Vec<bool>,
    /// Per layer and input, the buffer receiving the input gradient.
    inputs_bwd: Vec<Vec<Option<usize>>>,
    accumulate: Vec<Vec<bool>>,
}

impl Graph {
    pub(crate) fn new(layers: &[Layer]) -> Self {
        let n = layers.len();
        let mut consumers = vec![Vec::new(); n];
        for (i, layer) in layers.iter().enumerate() {
            for input in layer.inputs() {
                consumers[*input].push(i);
            }
        }
        let mut propagates = vec![false; n];
        for (i, layer) in layers.iter().enumerate() {
            let trainable = layer.parameters().map_or(false, |p| !p.is_empty());
            propagates[i] = layer.layer_type() != LayerType::Input
                && (trainable || layer.inputs().iter().any(|x| propagates[*x]));
        }
        let inplace: Vec<bool> = layers
            .iter()
            .map(|layer| match layer.inputs() {
                [input] => {
                    layer.layer_type().supports_inplace()
                        && layers[*input].layer_type().is_conv()
                        && consumers[*input].len() == 1
                        && propagates[*input]
                }
                _ => false,
            })
            .collect();
        let mut storage = vec![GradStorage::None; n];
        for (i, layer) in layers.iter().enumerate() {
            storage[i] = if !propagates[i] || layer.layer_type() == LayerType::Cost {
                GradStorage::None
            } else if inplace[i] {
                let input = layer.inputs()[0];
                match storage[input] {
                    GradStorage::Aliases(owner) => GradStorage::Aliases(owner),
                    _ => GradStorage::Aliases(input),
                }
            } else {
                GradStorage::Owns
            };
        }
        let owner = |i: usize| match storage[i] {
            GradStorage::Aliases(owner) => owner,
            _ => i,
        };
        let inputs_bwd: Vec<Vec<Option<usize>>> = layers
            .iter()
            .map(|layer| {
                layer
                    .inputs()
                    .iter()
                    .map(|x| propagates[*x].then(|| owner(*x)))
                    .collect()
            })
            .collect();
        let mut writers = vec![0usize; n];
        for i in 0..n {
            if propagates[i] && !inplace[i] {
                for o in inputs_bwd[i].iter().flatten() {
                    writers[*o] += 1;
                }
            }
        }
        let accumulate = inputs_bwd
            .iter()
            .map(|inputs| {
                inputs
                    .iter()
                    .map(|o| o.map_or(false, |o| writers[o] > 1))
                    .collect()
            })
            .collect();
        Self {
            consumers,
            storage,
            inplace,
            propagates,
            inputs_bwd,
            accumulate,
        }
    }
    pub(crate) fn storage(&self, layer: usize) -> GradStorage {
        self.storage[layer]
    }
    /// The layer whose buffer holds the output gradient of `layer`.
    pub(crate) fn owner(&self, layer: usize) -> Option<usize> {
        match self.storage[layer] {
            GradStorage::None => None,
            GradStorage::Owns => Some(layer),
            GradStorage::Aliases(owner) => Some(owner),
        }
    }
    pub(crate) fn is_inplace(&self, layer: usize) -> bool {
        self.inplace[layer]
    }
    /// Whether the output feeds more than one layer.
    pub(crate) fn shares_input(&self, layer: usize) -> bool {
        self.consumers[layer].len() > 1
    }
    pub(crate) fn consumers(&self, layer: usize) -> &[usize] {
        &self.consumers[layer]
    }
    /// Whether backward runs for `layer`.
    pub(crate) fn propagates(&self, layer: usize) -> bool {
        self.propagates[layer]
    }
    pub(crate) fn inputs_bwd(&self, layer: usize) -> &[Option<usize>] {
        &self.inputs_bwd[layer]
    }
    pub(crate) fn accumulate(&self, layer: usize) -> &[bool] {
        &self.accumulate[layer]
    }
}
