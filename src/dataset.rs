//! Datasets seen by a model: the registry named in definitions and the batch source.
use crate::tensor::Dims;
use anyhow::{bail, ensure, Result};
use derive_more::Display;
use ndarray::{Array2, Axis};
use rand::prelude::SliceRandom;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Datasets a definition may name.
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Dataset {
    #[display(fmt = "cifar10")]
    Cifar10,
    #[display(fmt = "cifar100")]
    Cifar100,
    #[display(fmt = "fashionmnist")]
    FashionMnist,
    #[display(fmt = "mnist")]
    Mnist,
    #[display(fmt = "tinyimagenet")]
    TinyImageNet,
}

impl Dataset {
    /// Every dataset.
    pub const ALL: [Self; 5] = [
        Self::Cifar10,
        Self::Cifar100,
        Self::FashionMnist,
        Self::Mnist,
        Self::TinyImageNet,
    ];
    /// Number of classes.
    pub fn classes(self) -> usize {
        match self {
            Self::Cifar10 | Self::FashionMnist | Self::Mnist => 10,
            Self::Cifar100 => 100,
            Self::TinyImageNet => 200,
        }
    }
    /// Dims of a sample.
    pub fn dims(self) -> Dims {
        match self {
            Self::Cifar10 | Self::Cifar100 => Dims::new(3, 1, 32, 32),
            Self::FashionMnist | Self::Mnist => Dims::new(1, 1, 28, 28),
            Self::TinyImageNet => Dims::new(3, 1, 64, 64),
        }
    }
}

impl FromStr for Dataset {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        match Self::ALL.iter().find(|x| x.to_string() == s) {
            Some(x) => Ok(*x),
            None => bail!("Unknown dataset {s:?}!"),
        }
    }
}

/// Samples with their labels.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Batch {
    /// Samples.
    pub size: usize,
    /// Plain `size x C x D x H x W` input.
    pub input: Vec<f32>,
    /// Per label group, `size x columns` class indices.
    pub labels: Vec<Vec<usize>>,
}

impl Batch {
    /// Labels per sample of `group`.
    pub fn columns(&self, group: usize) -> usize {
        match self.labels.get(group) {
            Some(labels) if self.size > 0 => labels.len() / self.size,
            _ => 0,
        }
    }
}

/// Source of batches.
pub trait DataProvider {
    /// Dims of a sample.
    fn dims(&self) -> Dims;
    /// Samples of the train or test split.
    fn sample_count(&self, training: bool) -> usize;
    /// Restarts iteration over a split, optionally shuffled.
    fn start_epoch(&mut self, training: bool, shuffle: bool);
    /// The next at most `batch_size` samples, `None` once the split is exhausted.
    fn next_batch(&mut self, batch_size: usize) -> Result<Option<Batch>>;
}

#[derive(Clone, Debug)]
struct Split {
    /// `samples x sample size`.
    inputs: Array2<f32>,
    /// Per group, `samples x columns`.
    labels: Vec<Array2<usize>>,
}

impl Split {
    fn new(dims: Dims, inputs: Array2<f32>, labels: Vec<Array2<usize>>) -> Result<Self> {
        ensure!(
            inputs.ncols() == dims.size(),
            "Samples of {} values do not fit {dims:?}!",
            inputs.ncols()
        );
        for group in labels.iter() {
            ensure!(
                group.nrows() == inputs.nrows(),
                "{} labels for {} samples!",
                group.nrows(),
                inputs.nrows()
            );
        }
        Ok(Self { inputs, labels })
    }
}

/// In memory train and test splits.
#[derive(Clone, Debug)]
pub struct ArrayProvider {
    dims: Dims,
    train: Split,
    test: Split,
    training: bool,
    indices: Vec<usize>,
    cursor: usize,
}

impl ArrayProvider {
    /// Creates a provider from `(inputs, labels)` splits, one row per sample and one label array
    /// per group.
    ///
    /// **Errors**
    ///
    /// The rows do not hold `dims.size()` values, or a label array has a different number of
    /// rows.
    pub fn new(
        dims: Dims,
        train: (Array2<f32>, Vec<Array2<usize>>),
        test: (Array2<f32>, Vec<Array2<usize>>),
    ) -> Result<Self> {
        let train = Split::new(dims, train.0, train.1)?;
        let test = Split::new(dims, test.0, test.1)?;
        Ok(Self {
            dims,
            indices: (0..train.inputs.nrows()).collect(),
            train,
            test,
            training: true,
            cursor: 0,
        })
    }
    fn split(&self) -> &Split {
        if self.training {
            &self.train
        } else {
            &self.test
        }
    }
}

impl DataProvider for ArrayProvider {
    fn dims(&self) -> Dims {
        self.dims
    }
    fn sample_count(&self, training: bool) -> usize {
        if training {
            self.train.inputs.nrows()
        } else {
            self.test.inputs.nrows()
        }
    }
    fn start_epoch(&mut self, training: bool, shuffle: bool) {
        self.training = training;
        self.indices = (0..self.sample_count(training)).collect();
        if shuffle {
            self.indices.shuffle(&mut rand::thread_rng());
        }
        self.cursor = 0;
    }
    fn next_batch(&mut self, batch_size: usize) -> Result<Option<Batch>> {
        ensure!(batch_size > 0, "Batch size must be positive!");
        let end = (self.cursor + batch_size).min(self.indices.len());
        if self.cursor >= end {
            return Ok(None);
        }
        let indices = &self.indices[self.cursor..end];
        let split = self.split();
        let input = split.inputs.select(Axis(0), indices);
        let labels = split
            .labels
            .iter()
            .map(|group| group.select(Axis(0), indices).iter().copied().collect())
            .collect();
        let batch = Batch {
            size: indices.len(),
            input: input.iter().copied().collect(),
            labels,
        };
        self.cursor = end;
        Ok(Some(batch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array;

    #[test]
    fn registry() -> Result<()> {
        assert_eq!("cifar100".parse::<Dataset>()?, Dataset::Cifar100);
        assert_eq!(Dataset::TinyImageNet.classes(), 200);
        assert_eq!(Dataset::FashionMnist.dims(), Dims::new(1, 1, 28, 28));
        assert!("Cifar10".parse::<Dataset>().is_err());
        Ok(())
    }

    #[test]
    fn batches_cover_split() -> Result<()> {
        let dims = Dims::new(2, 1, 1, 1);
        let inputs = Array::from_shape_fn((5, 2), |(n, c)| (n * 2 + c) as f32);
        let labels = Array::from_shape_fn((5, 1), |(n, _)| n);
        let mut provider = ArrayProvider::new(
            dims,
            (inputs.clone(), vec![labels.clone()]),
            (inputs, vec![labels]),
        )?;
        provider.start_epoch(true, true);
        let mut seen = Vec::new();
        while let Some(batch) = provider.next_batch(2)? {
            assert_eq!(batch.columns(0), 1);
            for (n, label) in batch.labels[0].iter().enumerate() {
                assert_eq!(batch.input[n * 2], (*label * 2) as f32);
                seen.push(*label);
            }
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
        Ok(())
    }
}
