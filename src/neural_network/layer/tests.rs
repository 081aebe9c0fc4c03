use super::*;
use crate::{engine::Engine, tensor::WeightFormat};
use approx::assert_relative_eq;

fn layer(t: LayerType, config: &LayerConfig, inputs: &[(LayerType, Dims)]) -> Result<Layer> {
    Layer::new(t.to_string(), t, config, (1..=inputs.len()).collect(), inputs)
}

#[test]
fn layer_type_names() -> Result<()> {
    for t in LayerType::ALL {
        assert_eq!(t.to_string().parse::<LayerType>()?, t);
    }
    assert!("Conv".parse::<LayerType>().is_err());
    assert_eq!(LayerType::Concat.arity(), Arity::AtLeastTwo);
    assert_eq!(LayerType::Substract.arity(), Arity::Two);
    assert_eq!(LayerType::Input.arity(), Arity::None);
    assert!(Arity::AtLeastTwo.accepts(3));
    assert!(!Arity::One.accepts(2));
    Ok(())
}

#[test]
fn output_dims() -> Result<()> {
    let input = (LayerType::Input, Dims::new(3, 1, 32, 32));
    let config = LayerConfig {
        channels: 16,
        kernel: [3, 3],
        stride: [2, 2],
        pad: [1, 1],
        ..LayerConfig::default()
    };
    let conv = layer(LayerType::Convolution, &config, &[input])?;
    assert_eq!(conv.dims(), Dims::new(16, 1, 16, 16));
    assert_eq!(conv.weight_count(), 16 * 3 * 3 * 3);
    assert_eq!(conv.bias_count(), 16);
    let pool = layer(LayerType::GlobalAvgPooling, &config, &[input])?;
    assert_eq!(pool.dims(), Dims::new(3, 1, 1, 1));
    let dense = layer(LayerType::Dense, &config, &[input])?;
    assert_eq!(dense.dims(), Dims::new(16, 1, 1, 1));
    assert_eq!(dense.fan_in(), 3 * 32 * 32);
    let concat = layer(LayerType::Concat, &config, &[input, input])?;
    assert_eq!(concat.dims(), Dims::new(6, 1, 32, 32));
    Ok(())
}

#[test]
fn oversized_kernel_is_rejected() {
    let input = (LayerType::Input, Dims::new(3, 1, 4, 4));
    let config = LayerConfig {
        channels: 8,
        kernel: [7, 7],
        ..LayerConfig::default()
    };
    assert!(layer(LayerType::Convolution, &config, &[input]).is_err());
}

#[test]
#[should_panic]
fn wrong_arity_panics() {
    let input = (LayerType::Input, Dims::new(3, 1, 4, 4));
    let _ = layer(LayerType::Add, &LayerConfig::default(), &[input]);
}

#[test]
fn batch_norm_running_state() -> Result<()> {
    let input = (LayerType::Convolution, Dims::new(5, 1, 4, 4));
    let mut bn = layer(LayerType::BatchNorm, &LayerConfig::default(), &[input])?;
    let parameters = bn.parameters_mut().expect("parameters");
    assert_eq!(parameters.running().len(), 2);
    parameters.running[0].fill(3.);
    parameters.running[1].fill(7.);
    parameters.reset()?;
    assert!(parameters.running()[0].iter().all(|x| *x == 0.));
    assert!(parameters.running()[1].iter().all(|x| *x == 1.));
    Ok(())
}

#[test]
fn persisted_weights_survive_blocking() -> Result<()> {
    let input = (LayerType::Input, Dims::new(3, 1, 8, 8));
    let config = LayerConfig {
        channels: 11,
        kernel: [3, 3],
        ..LayerConfig::default()
    };
    let mut conv = layer(LayerType::Convolution, &config, &[input])?;
    let parameters = conv.parameters_mut().expect("parameters");
    parameters.reset()?;
    let plain = parameters.weights().to_vec();
    parameters.set_weight_format(&Engine::host(), WeightFormat::Blocked)?;
    assert_eq!(parameters.weight_format(), WeightFormat::Blocked);
    assert_eq!(
        parameters.weights().len(),
        parameters.weight_dims().len(WeightFormat::Blocked)
    );
    let persisted = parameters.persist(parameters.weights())?;
    assert_eq!(persisted, plain);
    assert_eq!(parameters.restore(&persisted)?, parameters.weights());
    Ok(())
}

#[test]
fn reset_fills_with_fillers() -> Result<()> {
    let input = (LayerType::Input, Dims::new(4, 1, 1, 1));
    let config = LayerConfig {
        channels: 2,
        weights_filler: Some(Filler::Constant(0.5)),
        biases_filler: Some(Filler::Constant(-1.)),
        ..LayerConfig::default()
    };
    let mut dense = layer(LayerType::Dense, &config, &[input])?;
    let parameters = dense.parameters_mut().expect("parameters");
    parameters.weights_d1.fill(2.);
    parameters.reset()?;
    for x in parameters.weights() {
        assert_relative_eq!(*x, 0.5);
    }
    assert_eq!(parameters.biases(), &[-1., -1.]);
    assert!(parameters.weights_d1().iter().all(|x| *x == 0.));
    Ok(())
}
