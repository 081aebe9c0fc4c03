//! # convgraph
//! Convolutional networks compiled from textual model definitions.
//!
//! A definition names a dataset, the input dims and a directed acyclic graph of layers. It is
//! compiled with [`definition::parse`] into a [`Model`](neural_network::Model), which runs the
//! forward and backward passes on the host [`Engine`](engine::Engine) and trains with SGD style
//! [`optimizers`](neural_network::optimizer).
//!
//! ```no_run
//! # fn main() -> anyhow::Result<()> {
//! use convgraph::definition;
//!
//! let mut model = definition::parse(
//!     "[Net]\nDataset=mnist\nDim=1,28,28\n\n[D1]\nType=Dense\nInputs=Input\nChannels=10\n\n\
//!      [Cost]\nType=Cost\nInputs=D1\nChannels=10\n",
//! )?;
//! model.reset_weights()?;
//! model.forward(false)?;
//! println!("loss: {}", model.loss());
//! # Ok(())
//! # }
//! ```
#![warn(missing_docs)]

pub mod definition;
pub mod dataset;
pub mod engine;
/// Errors.
pub mod error;
pub mod neural_network;
pub mod tensor;
