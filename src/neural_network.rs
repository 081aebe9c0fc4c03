//! Models.
//!
//! A [`Model`] owns its layers in declaration order, which is a topological order since inputs
//! are declared before use. Forward walks the layers in order, backward in reverse, then every
//! unlocked layer applies an optimizer step.
//!
//! Buffers are held by the model, indexed by layer:
//! - neurons, in the layer's negotiated [`Format`],
//! - output gradients, allocated per the [`GradStorage`] of the layer. With lean memory they are
//!   allocated right before the first write and released after the owning layer's backward.
use crate::{
    dataset::{Batch, DataProvider, Dataset},
    engine::{Engine, Stream},
    error::LayerError,
    tensor::{Dims, Format, MemoryDesc},
};
use anyhow::{bail, ensure, Context, Result};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use std::{fmt, mem, sync::Arc};

/// Weight initializers.
pub mod filler;
mod graph;
mod io;
pub mod layer;
/// Optimizers.
pub mod optimizer;
/// Buffer statistics.
pub mod stats;

#[cfg(test)]
mod tests;

use filler::Filler;
pub use graph::GradStorage;
use graph::Graph;
use layer::{
    BackwardIo, CostMetrics, ForwardIo, Gradient, LayerConfig, LayerType, Labels, TensorMut,
    TensorRef,
};
pub use layer::Layer;
use optimizer::TrainingRate;

/// Model wide defaults set in the model block of a definition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelDefaults {
    /// Layout hint of the engine.
    pub format: Format,
    /// Weights filler.
    pub weights_filler: Filler,
    /// Biases filler.
    pub biases_filler: Filler,
    /// Weights learning rate multiplier.
    pub weights_lrm: f32,
    /// Weights decay multiplier.
    pub weights_wdm: f32,
    /// Biases learning rate multiplier.
    pub biases_lrm: f32,
    /// Biases decay multiplier.
    pub biases_wdm: f32,
    /// Whether layers learn biases.
    pub biases: bool,
    /// Batch norm momentum.
    pub momentum: f32,
    /// Normalization epsilon.
    pub eps: f32,
    /// Whether normalization learns scale and shift.
    pub scaling: bool,
    /// Activation parameter.
    pub alpha: Option<f32>,
    /// Activation parameter.
    pub beta: Option<f32>,
    /// Drop probability.
    pub dropout: f32,
}

impl Default for ModelDefaults {
    fn default() -> Self {
        Self {
            format: Format::Blocked,
            weights_filler: Filler::default(),
            biases_filler: Filler::Constant(0.),
            weights_lrm: 1.,
            weights_wdm: 1.,
            biases_lrm: 1.,
            biases_wdm: 0.,
            biases: true,
            momentum: 0.995,
            eps: 1e-4,
            scaling: true,
            alpha: None,
            beta: None,
            dropout: 0.,
        }
    }
}

fn allocate_gradient(gradients: &mut [Option<Vec<f32>>], index: usize, len: usize) {
    if gradients[index].is_none() {
        log::debug!("Allocating gradient of layer {index}, {len} floats");
        gradients[index] = Some(vec![0.; len]);
    }
}

/// A layer graph with its buffers.
pub struct Model {
    name: String,
    dataset: Dataset,
    defaults: ModelDefaults,
    engine: Engine,
    stream: Stream,
    layers: Vec<Layer>,
    graph: Option<Graph>,
    batch: usize,
    descs: Vec<MemoryDesc>,
    neurons: Vec<Vec<f32>>,
    gradients: Vec<Option<Vec<f32>>>,
    labels: Vec<Vec<usize>>,
    columns: Vec<usize>,
    lean_memory: bool,
    corrupted: bool,
}

impl Model {
    /// Creates a model holding only the input layer, with batch size 1.
    pub fn new(
        name: impl Into<String>,
        dataset: Dataset,
        dims: Dims,
        defaults: ModelDefaults,
    ) -> Self {
        let engine = Engine::host().with_format_hint(defaults.format);
        let stream = engine.stream();
        Self {
            name: name.into(),
            dataset,
            defaults,
            engine,
            stream,
            layers: vec![Layer::input(dims)],
            graph: None,
            batch: 1,
            descs: vec![MemoryDesc::new(1, dims, Format::Plain)],
            neurons: Vec::new(),
            gradients: Vec::new(),
            labels: Vec::new(),
            columns: Vec::new(),
            lean_memory: false,
            corrupted: false,
        }
    }
    /// The name.
    pub fn name(&self) -> &str {
        &self.name
    }
    /// The dataset.
    pub fn dataset(&self) -> Dataset {
        self.dataset
    }
    /// Defaults of the model block.
    pub fn defaults(&self) -> &ModelDefaults {
        &self.defaults
    }
    /// The engine.
    pub fn engine(&self) -> &Engine {
        &self.engine
    }
    /// The batch size.
    pub fn batch_size(&self) -> usize {
        self.batch
    }
    /// Layers in declaration order, the first is the input.
    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }
    /// The layer at `index`.
    pub fn layer(&self, index: usize) -> Option<&Layer> {
        self.layers.get(index)
    }
    /// The layer at `index`.
    pub fn layer_mut(&mut self, index: usize) -> Option<&mut Layer> {
        self.layers.get_mut(index)
    }
    /// Index of the layer called `name`.
    pub fn layer_index(&self, name: &str) -> Option<usize> {
        self.layers.iter().position(|x| x.name() == name)
    }
    /// Indices of the cost layers.
    pub fn cost_layers(&self) -> Vec<usize> {
        self.layers
            .iter()
            .enumerate()
            .filter(|(_, x)| x.layer_type() == LayerType::Cost)
            .map(|(i, _)| i)
            .collect()
    }
    /// Memory desc of the output of layer `index` at the current batch size.
    pub fn desc(&self, index: usize) -> Option<MemoryDesc> {
        self.descs.get(index).copied()
    }
    /// Appends a layer reading `inputs` and initializes it for the current batch size.
    ///
    /// # Panics
    ///
    /// The inputs do not fit the layer type, see [`Layer::new`].
    ///
    /// **Errors**
    ///
    /// The name is taken, an input does not exist, or the layer cannot be built on its inputs,
    /// for example [`LayerError::Format`].
    pub fn add_layer(
        &mut self,
        name: impl Into<String>,
        layer_type: LayerType,
        config: &LayerConfig,
        inputs: &[usize],
    ) -> Result<usize> {
        let name = name.into();
        ensure!(
            self.layer_index(&name).is_none(),
            "Layer name {name} already in use!"
        );
        if let Some(input) = inputs.iter().find(|x| **x >= self.layers.len()) {
            bail!("Layer {name} reads unknown layer {input}!");
        }
        let input_info: Vec<(LayerType, Dims)> = inputs
            .iter()
            .map(|x| (self.layers[*x].layer_type(), self.layers[*x].dims()))
            .collect();
        let mut layer = Layer::new(name, layer_type, config, inputs.to_vec(), &input_info)?;
        let input_descs: Vec<MemoryDesc> = inputs.iter().map(|x| self.descs[*x]).collect();
        let desc = layer.initialize(&self.engine, self.batch, &input_descs)?;
        self.layers.push(layer);
        self.descs.push(desc);
        self.graph = None;
        Ok(self.layers.len() - 1)
    }
    /// Derives the backward graph and allocates the buffers.
    ///
    /// **Errors**
    ///
    /// The last layer is not a cost layer.
    pub fn build(&mut self) -> Result<()> {
        match self.layers.last() {
            Some(layer) if layer.layer_type() == LayerType::Cost => (),
            _ => bail!("Last layer must of type Cost."),
        }
        self.graph = Some(Graph::new(&self.layers));
        self.allocate();
        let weights: usize = self
            .layers
            .iter()
            .map(|x| x.weight_count() + x.bias_count())
            .sum();
        log::info!(
            "Model {}: {} layers, {} trainable parameters, dataset {}",
            self.name,
            self.layers.len(),
            weights,
            self.dataset
        );
        Ok(())
    }
    fn allocate(&mut self) {
        let Some(graph) = self.graph.as_ref() else {
            return;
        };
        self.neurons = self.descs.iter().map(|x| vec![0.; x.len()]).collect();
        self.gradients = Self::gradient_buffers(graph, &self.descs, self.lean_memory);
        let groups = self
            .layers
            .iter()
            .filter_map(|x| x.group_index())
            .max()
            .map_or(0, |x| x + 1);
        self.labels = vec![Vec::new(); groups];
        self.columns = vec![0; groups];
        log::debug!(
            "Model {} allocated {} neuron floats",
            self.name,
            self.neurons.iter().map(Vec::len).sum::<usize>()
        );
    }
    /// Owned gradient buffers, none are kept under lean memory.
    fn gradient_buffers(graph: &Graph, descs: &[MemoryDesc], lean_memory: bool) -> Vec<Option<Vec<f32>>> {
        descs
            .iter()
            .enumerate()
            .map(|(i, desc)| {
                (!lean_memory && graph.storage(i) == GradStorage::Owns).then(|| vec![0.; desc.len()])
            })
            .collect()
    }
    fn graph(&self) -> Result<&Graph> {
        match self.graph.as_ref() {
            Some(graph) => Ok(graph),
            None => bail!("Model {} is not built!", self.name),
        }
    }
    /// Who holds the output gradient of layer `index`, `None` before [`build`](Self::build).
    pub fn gradient_storage(&self, index: usize) -> Option<GradStorage> {
        self.graph.as_ref().map(|x| x.storage(index))
    }
    /// Whether backward of layer `index` replaces the gradient of its input convolution.
    pub fn is_inplace(&self, index: usize) -> bool {
        self.graph.as_ref().map_or(false, |x| x.is_inplace(index))
    }
    /// Whether the output of layer `index` feeds more than one layer.
    pub fn shares_input(&self, index: usize) -> bool {
        self.graph.as_ref().map_or(false, |x| x.shares_input(index))
    }
    /// Layers reading the output of layer `index`.
    pub fn consumers(&self, index: usize) -> &[usize] {
        match self.graph.as_ref() {
            Some(graph) => graph.consumers(index),
            None => &[],
        }
    }
    /// Reinitializes every layer for `batch` samples and reallocates the buffers.
    pub fn set_batch_size(&mut self, batch: usize) -> Result<()> {
        ensure!(batch > 0, "Batch size must be positive!");
        let mut descs: Vec<MemoryDesc> = Vec::with_capacity(self.layers.len());
        for layer in self.layers.iter_mut() {
            let inputs: Vec<MemoryDesc> = layer.inputs().iter().map(|x| descs[*x]).collect();
            let desc = layer
                .initialize(&self.engine, batch, &inputs)
                .with_context(|| format!("Initializing layer {}", layer.name()))?;
            descs.push(desc);
        }
        self.batch = batch;
        self.descs = descs;
        if self.graph.is_none() {
            self.build()?;
        } else {
            self.allocate();
        }
        log::info!("Model {} batch size {batch}", self.name);
        Ok(())
    }
    /// Changes the input resolution, every layer re-derives its dims.
    pub fn update_resolution(&mut self, h: usize, w: usize) -> Result<()> {
        let dims = Dims {
            h,
            w,
            ..self.layers[0].dims()
        };
        self.layers[0].update_resolution(&[dims])?;
        for i in 1..self.layers.len() {
            let inputs: Vec<Dims> = self.layers[i]
                .inputs()
                .iter()
                .map(|x| self.layers[*x].dims())
                .collect();
            self.layers[i]
                .update_resolution(&inputs)
                .with_context(|| format!("Resizing layer {}", self.layers[i].name()))?;
        }
        self.set_batch_size(self.batch)
    }
    /// Allocates gradients lazily and frees them after use.
    pub fn set_lean_memory(&mut self, lean_memory: bool) {
        if self.lean_memory != lean_memory {
            self.lean_memory = lean_memory;
            // neurons, labels and columns keep the loaded batch
            if let Some(graph) = self.graph.as_ref() {
                self.gradients = Self::gradient_buffers(graph, &self.descs, lean_memory);
            }
        }
    }
    /// Whether lean memory is enabled.
    pub fn is_lean_memory(&self) -> bool {
        self.lean_memory
    }
    /// Copies a plain `batch x C x D x H x W` input.
    pub fn set_input(&mut self, data: &[f32]) -> Result<()> {
        self.graph()?;
        let len = self.descs[0].len();
        ensure!(
            data.len() == len,
            "Input of {} values for {len} expected!",
            data.len()
        );
        self.neurons[0].copy_from_slice(data);
        Ok(())
    }
    /// Sets the labels read by the cost layers of `group`, `columns` per sample.
    pub fn set_labels(&mut self, group: usize, labels: &[usize], columns: usize) -> Result<()> {
        self.graph()?;
        ensure!(
            group < self.labels.len(),
            "Label group {group} has no cost layer!"
        );
        ensure!(
            columns > 0 && labels.len() == self.batch * columns,
            "{} labels do not fit {} samples!",
            labels.len(),
            self.batch
        );
        self.labels[group] = labels.to_vec();
        self.columns[group] = columns;
        Ok(())
    }
    /// Runs every layer in declaration order.
    ///
    /// In training, output gradients are zeroed, so backward may accumulate.
    pub fn forward(&mut self, training: bool) -> Result<()> {
        let Self {
            name,
            engine,
            stream,
            layers,
            graph,
            descs,
            neurons,
            gradients,
            labels,
            columns,
            ..
        } = self;
        let Some(graph) = graph.as_ref() else {
            bail!("Model {name} is not built!");
        };
        let (engine, stream, descs) = (&*engine, &*stream, &*descs);
        for i in 1..layers.len() {
            let layer = &mut layers[i];
            let owner = graph.owner(i);
            let resets = layer.resets_gradient();
            let mut d_output = match owner {
                Some(owner) if training && resets => gradients[owner].take(),
                _ => None,
            };
            let label_data = layer.group_index().and_then(|group| {
                let data = labels.get(group)?;
                (!data.is_empty()).then(|| Labels {
                    data,
                    columns: columns[group],
                })
            });
            let mut output = mem::take(&mut neurons[i]);
            let inputs: Vec<TensorRef> = layer
                .inputs()
                .iter()
                .map(|x| TensorRef {
                    desc: descs[*x],
                    data: &neurons[*x],
                })
                .collect();
            let io = ForwardIo {
                engine,
                stream,
                training,
                inputs,
                output: TensorMut {
                    desc: descs[i],
                    data: &mut output,
                },
                d_output: d_output.as_deref_mut(),
                labels: label_data,
            };
            let result = layer.forward(io);
            neurons[i] = output;
            if let Some(owner) = owner {
                if d_output.is_some() {
                    gradients[owner] = d_output;
                } else if training && !resets {
                    if let Some(d) = gradients[owner].as_mut() {
                        d.fill(0.);
                    }
                }
            }
            result.with_context(|| format!("Forward of layer {}", layer.name()))?;
        }
        Ok(())
    }
    /// Runs backward in reverse declaration order, after a training [`forward`](Self::forward).
    pub fn backward(&mut self) -> Result<()> {
        let Self {
            name,
            engine,
            stream,
            layers,
            graph,
            descs,
            neurons,
            gradients,
            lean_memory,
            ..
        } = self;
        let Some(graph) = graph.as_ref() else {
            bail!("Model {name} is not built!");
        };
        let (engine, stream, descs) = (&*engine, &*stream, &*descs);
        for i in (1..layers.len()).rev() {
            if !graph.propagates(i) {
                continue;
            }
            let owner = graph.owner(i);
            if let Some(owner) = owner {
                allocate_gradient(gradients, owner, descs[owner].len());
            }
            for o in graph.inputs_bwd(i).iter().flatten() {
                allocate_gradient(gradients, *o, descs[*o].len());
            }
            let layer = &mut layers[i];
            let inputs: Vec<TensorRef> = layer
                .inputs()
                .iter()
                .map(|x| TensorRef {
                    desc: descs[*x],
                    data: &neurons[*x],
                })
                .collect();
            let output = TensorRef {
                desc: descs[i],
                data: &neurons[i],
            };
            let accumulate = graph.accumulate(i).to_vec();
            let result = match owner {
                Some(owner) if graph.is_inplace(i) => {
                    let mut d = gradients[owner].take().unwrap_or_default();
                    let io = BackwardIo {
                        engine,
                        stream,
                        inputs,
                        output,
                        gradient: Gradient::InPlace(&mut d),
                        accumulate,
                    };
                    let result = layer.backward(io);
                    gradients[owner] = Some(d);
                    result
                }
                _ => {
                    let d_output = owner.and_then(|x| gradients[x].take());
                    let mut d_inputs: Vec<Option<Vec<f32>>> = graph
                        .inputs_bwd(i)
                        .iter()
                        .map(|x| x.and_then(|x| gradients[x].take()))
                        .collect();
                    let io = BackwardIo {
                        engine,
                        stream,
                        inputs,
                        output,
                        gradient: Gradient::Separate {
                            d_output: d_output.as_deref(),
                            d_inputs: d_inputs.iter_mut().map(|x| x.as_deref_mut()).collect(),
                        },
                        accumulate,
                    };
                    let result = layer.backward(io);
                    if let Some(owner) = owner {
                        gradients[owner] = d_output;
                    }
                    for (x, d) in graph.inputs_bwd(i).iter().zip(d_inputs) {
                        if let Some(x) = x {
                            gradients[*x] = d;
                        }
                    }
                    result
                }
            };
            result.with_context(|| format!("Backward of layer {}", layer.name()))?;
            if *lean_memory && graph.storage(i) == GradStorage::Owns {
                gradients[i] = None;
            }
        }
        Ok(())
    }
    /// Applies an optimizer step to every layer with parameters, skipping locked layers unless
    /// `disable_locking`.
    pub fn update_weights(&mut self, rate: &TrainingRate, disable_locking: bool) -> Result<()> {
        rate.validate()?;
        for layer in self.layers.iter_mut() {
            if layer.is_locked() && !disable_locking {
                continue;
            }
            let name = layer.name().to_string();
            if let Some(parameters) = layer.parameters_mut().filter(|x| !x.is_empty()) {
                parameters
                    .update(rate)
                    .with_context(|| format!("Updating layer {name}"))?;
            }
        }
        Ok(())
    }
    /// Scans parameters and optimizer state for NaN or Inf.
    ///
    /// **Errors**
    ///
    /// [`LayerError::NonFinite`] naming the first corrupted buffer.
    pub fn check_optimizer(&self) -> Result<()> {
        for layer in self.layers.iter() {
            if let Some(what) = layer.parameters().and_then(|x| x.find_non_finite()) {
                return Err(LayerError::NonFinite {
                    layer: layer.name().into(),
                    what,
                }
                .into());
            }
        }
        Ok(())
    }
    /// Whether training stopped on non finite parameters.
    pub fn is_corrupted(&self) -> bool {
        self.corrupted
    }
    /// Forward, backward and update on one batch.
    ///
    /// **Errors**
    ///
    /// Any step failed, or the parameters became non finite. Once corrupted, training refuses
    /// to continue until the weights are reset or loaded.
    pub fn train_batch(&mut self, batch: &Batch, rate: &TrainingRate) -> Result<()> {
        if self.corrupted {
            bail!("Model {} has non finite parameters, training stopped!", self.name);
        }
        self.load_batch(batch)?;
        self.forward(true)?;
        self.backward()?;
        self.update_weights(rate, false)?;
        if let Err(e) = self.check_optimizer() {
            log::error!("{e}");
            self.corrupted = true;
            return Err(e);
        }
        Ok(())
    }
    /// Inference forward on one batch, scoring the cost layers.
    pub fn test_batch(&mut self, batch: &Batch) -> Result<()> {
        self.load_batch(batch)?;
        self.forward(false)
    }
    fn load_batch(&mut self, batch: &Batch) -> Result<()> {
        if batch.size != self.batch {
            self.set_batch_size(batch.size)?;
        }
        self.set_input(&batch.input)?;
        let groups = self.labels.len();
        for (group, labels) in batch.labels.iter().enumerate().take(groups) {
            self.set_labels(group, labels, batch.columns(group))?;
        }
        Ok(())
    }
    /// Trains on a shuffled pass over the train split in batches of the current size.
    pub fn train_epoch(
        &mut self,
        provider: &mut impl DataProvider,
        rate: &TrainingRate,
    ) -> Result<()> {
        let batch_size = self.batch;
        provider.start_epoch(true, true);
        while let Some(batch) = provider.next_batch(batch_size)? {
            self.train_batch(&batch, rate)?;
        }
        Ok(())
    }
    /// Scores the test split in batches of the current size.
    pub fn test_epoch(&mut self, provider: &mut impl DataProvider) -> Result<()> {
        let batch_size = self.batch;
        provider.start_epoch(false, false);
        while let Some(batch) = provider.next_batch(batch_size)? {
            self.test_batch(&batch)?;
        }
        Ok(())
    }
    /// Refills every parameter from its filler and clears the optimizer state.
    pub fn reset_weights(&mut self) -> Result<()> {
        for layer in self.layers.iter_mut() {
            if let Some(parameters) = layer.parameters_mut() {
                parameters.reset()?;
            }
        }
        self.corrupted = false;
        Ok(())
    }
    /// Zeroes the parameter gradients.
    pub fn reset_gradients(&mut self) {
        for layer in self.layers.iter_mut() {
            if let Some(parameters) = layer.parameters_mut() {
                parameters.reset_gradients();
            }
        }
    }
    /// Zeroes the counters of every cost layer.
    pub fn reset_metrics(&mut self) {
        for layer in self.layers.iter_mut() {
            if let Some(cost) = layer.cost_mut() {
                cost.reset_metrics();
            }
        }
    }
    /// Metrics of the cost layer called `name`.
    pub fn cost_metrics(&self, name: &str) -> Option<&CostMetrics> {
        self.layers
            .iter()
            .find(|x| x.name() == name)
            .and_then(|x| x.cost_metrics())
    }
    /// Sum of the weighted losses of the last batch over the cost layers.
    pub fn loss(&self) -> f32 {
        self.layers.iter().filter_map(|x| x.batch_loss()).sum()
    }
    /// Recomputes the statistics of every layer, `false` when any was rejected.
    pub fn refresh_statistics(&self) -> bool {
        self.layers
            .iter()
            .zip(self.neurons.iter())
            .fold(true, |sane, (layer, neurons)| {
                layer.refresh_statistics(neurons) && sane
            })
    }
    /// The output of layer `index` converted to plain layout.
    pub fn output(&self, index: usize) -> Result<Vec<f32>> {
        self.graph()?;
        let Some(desc) = self.descs.get(index).copied() else {
            bail!("Model {} has no layer {index}!", self.name);
        };
        let plain = desc.with_format(Format::Plain);
        let mut output = vec![0.; plain.len()];
        self.engine
            .reorder(&desc, &self.neurons[index], &plain, &mut output)?;
        Ok(output)
    }
    /// Output gradient of layer `index` in plain layout, `None` when not allocated.
    pub fn output_gradient(&self, index: usize) -> Result<Option<Vec<f32>>> {
        let graph = self.graph()?;
        let Some(owner) = graph.owner(index) else {
            return Ok(None);
        };
        let Some(gradient) = self.gradients[owner].as_ref() else {
            return Ok(None);
        };
        let desc = self.descs[index];
        let plain = desc.with_format(Format::Plain);
        let mut output = vec![0.; plain.len()];
        self.engine.reorder(&desc, gradient, &plain, &mut output)?;
        Ok(Some(output))
    }
}

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Model")
            .field("name", &self.name)
            .field("dataset", &self.dataset)
            .field("batch", &self.batch)
            .field("layers", &self.layers)
            .finish()
    }
}

/// A model shared between a trainer and observers.
///
/// Statistics are refreshed under a read lock, resizing and resetting take the write lock, so a
/// refresh never sees buffers being reallocated.
#[derive(Clone, Debug)]
pub struct SharedModel(Arc<RwLock<Model>>);

impl SharedModel {
    /// Wraps `model`.
    pub fn new(model: Model) -> Self {
        Self(Arc::new(RwLock::new(model)))
    }
    /// Read access.
    pub fn read(&self) -> RwLockReadGuard<Model> {
        self.0.read()
    }
    /// Write access.
    pub fn write(&self) -> RwLockWriteGuard<Model> {
        self.0.write()
    }
    /// See [`Model::refresh_statistics`].
    pub fn refresh_statistics(&self) -> bool {
        self.0.read().refresh_statistics()
    }
    /// See [`Model::set_batch_size`].
    pub fn set_batch_size(&self, batch: usize) -> Result<()> {
        self.0.write().set_batch_size(batch)
    }
    /// See [`Model::reset_weights`].
    pub fn reset_weights(&self) -> Result<()> {
        self.0.write().reset_weights()
    }
}
