//! Weight files.
//!
//! Layers with parameters are stored in declaration order, each as:
//! - the lock flag, one byte,
//! - weights in [`WeightFormat::Oihw`](crate::tensor::WeightFormat::Oihw),
//! - biases,
//! - running statistics,
//! - with a persisted optimizer, the weight then bias moments of each moment buffer followed by
//!   the optimizer scalars.
//!
//! Floats are native endian f32.
use super::{layer::Parameters, optimizer::Optimizer, Model};
use crate::error::LayerError;
use anyhow::{Context, Result};
use std::{
    fs::File,
    io::{BufReader, BufWriter, Read, Write},
    path::Path,
};

const FLOAT_SIZE: usize = std::mem::size_of::<f32>();

fn is_stored(parameters: &Parameters) -> bool {
    !parameters.is_empty() || !parameters.running().is_empty()
}

/// Bytes of one layer record.
fn record_len(parameters: &Parameters, optimizer: Option<Optimizer>) -> usize {
    let (w, b) = (parameters.weight_dims().size(), parameters.biases().len());
    let running: usize = parameters.running().iter().map(Vec::len).sum();
    let mut floats = w + b + running;
    if let Some(optimizer) = optimizer {
        floats += optimizer.moments() * (w + b) + optimizer.scalars();
    }
    1 + floats * FLOAT_SIZE
}

fn write_floats(writer: &mut impl Write, data: &[f32]) -> Result<()> {
    writer.write_all(bytemuck::cast_slice(data))?;
    Ok(())
}

/// Reads `len` floats from the front of `bytes`.
fn take_floats(bytes: &mut &[u8], len: usize) -> Vec<f32> {
    let (head, tail) = bytes.split_at(len * FLOAT_SIZE);
    *bytes = tail;
    head.chunks_exact(FLOAT_SIZE)
        .map(bytemuck::pod_read_unaligned::<f32>)
        .collect()
}

impl Model {
    /// Bytes [`write_weights`](Self::write_weights) produces.
    pub fn weights_len(&self, optimizer: Option<Optimizer>) -> usize {
        self.layers
            .iter()
            .filter_map(|layer| layer.parameters())
            .filter(|p| is_stored(p))
            .map(|p| record_len(p, optimizer))
            .sum()
    }
    /// Writes the weights, and the optimizer state of `optimizer` when given.
    pub fn write_weights(&self, mut writer: impl Write, optimizer: Option<Optimizer>) -> Result<()> {
        for layer in self.layers.iter() {
            let Some(parameters) = layer.parameters().filter(|p| is_stored(p)) else {
                continue;
            };
            writer.write_all(&[layer.is_locked() as u8])?;
            write_floats(&mut writer, &parameters.persist(parameters.weights())?)?;
            write_floats(&mut writer, parameters.biases())?;
            for running in parameters.running() {
                write_floats(&mut writer, running)?;
            }
            if let Some(optimizer) = optimizer {
                let (w, b) = (parameters.weights().len(), parameters.biases().len());
                for k in 0..optimizer.moments() {
                    // moments not allocated yet are stored as zero
                    let weights_par = parameters
                        .weights_par()
                        .get(k)
                        .cloned()
                        .unwrap_or_else(|| vec![0.; w]);
                    write_floats(&mut writer, &parameters.persist(&weights_par)?)?;
                    let biases_par = parameters
                        .biases_par()
                        .get(k)
                        .cloned()
                        .unwrap_or_else(|| vec![0.; b]);
                    write_floats(&mut writer, &biases_par)?;
                }
                let scalars = parameters.scalars().as_array();
                write_floats(&mut writer, &scalars[..optimizer.scalars()])?;
            }
        }
        writer.flush()?;
        Ok(())
    }
    /// Reads weights written by [`write_weights`](Self::write_weights) with the same
    /// `optimizer`.
    ///
    /// **Errors**
    ///
    /// The size of the data does not match the layers, checked before any layer is changed.
    pub fn read_weights(&mut self, mut reader: impl Read, optimizer: Option<Optimizer>) -> Result<()> {
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;
        let expected = self.weights_len(optimizer);
        if bytes.len() != expected {
            return Err(LayerError::WeightsSize {
                layer: self.name.clone(),
                expected,
                found: bytes.len(),
            }
            .into());
        }
        let mut bytes = bytes.as_slice();
        for layer in self.layers.iter_mut() {
            let locked = match layer.parameters() {
                Some(p) if is_stored(p) => bytes[0] != 0,
                _ => continue,
            };
            bytes = &bytes[1..];
            layer.set_locked(locked);
            let Some(parameters) = layer.parameters_mut() else {
                continue;
            };
            let (w, b) = (parameters.weight_dims().size(), parameters.biases.len());
            parameters.weights = parameters.restore(&take_floats(&mut bytes, w))?;
            parameters.biases = take_floats(&mut bytes, b);
            for k in 0..parameters.running.len() {
                let len = parameters.running[k].len();
                parameters.running[k] = take_floats(&mut bytes, len);
            }
            if let Some(optimizer) = optimizer {
                let moments = optimizer.moments();
                let mut weights_par = Vec::with_capacity(moments);
                let mut biases_par = Vec::with_capacity(moments);
                for _ in 0..moments {
                    weights_par.push(parameters.restore(&take_floats(&mut bytes, w))?);
                    biases_par.push(take_floats(&mut bytes, b));
                }
                parameters.weights_par = weights_par;
                parameters.biases_par = biases_par;
                let scalars = take_floats(&mut bytes, optimizer.scalars());
                parameters.scalars.set_from(&scalars);
            }
            parameters.reset_gradients();
        }
        Ok(())
    }
    /// Saves the weights to `path`.
    pub fn save_weights(&self, path: impl AsRef<Path>, optimizer: Option<Optimizer>) -> Result<()> {
        let path = path.as_ref();
        let file = File::create(path).with_context(|| format!("Creating {path:?}"))?;
        self.write_weights(BufWriter::new(file), optimizer)?;
        log::info!("Saved weights of {} to {path:?}", self.name);
        Ok(())
    }
    /// Loads the weights from `path`.
    pub fn load_weights(&mut self, path: impl AsRef<Path>, optimizer: Option<Optimizer>) -> Result<()> {
        let path = path.as_ref();
        let file = File::open(path).with_context(|| format!("Opening {path:?}"))?;
        self.read_weights(BufReader::new(file), optimizer)?;
        log::info!("Loaded weights of {} from {path:?}", self.name);
        Ok(())
    }
}
