use super::*;
use crate::neural_network::optimizer::Optimizer;
use approx::assert_relative_eq;

fn conv_config(channels: usize) -> LayerConfig {
    LayerConfig {
        channels,
        kernel: [3, 3],
        pad: [1, 1],
        ..LayerConfig::default()
    }
}

fn dense_config(channels: usize) -> LayerConfig {
    LayerConfig {
        channels,
        ..LayerConfig::default()
    }
}

/// Input, C1, A1, GAP, D1, Cost.
fn chain(format: Format) -> Result<Model> {
    let defaults = ModelDefaults {
        format,
        ..ModelDefaults::default()
    };
    let mut model = Model::new("chain", Dataset::Mnist, Dims::new(1, 1, 6, 6), defaults);
    let c1 = model.add_layer("C1", LayerType::Convolution, &conv_config(5), &[0])?;
    let a1 = model.add_layer("A1", LayerType::Activation, &LayerConfig::default(), &[c1])?;
    let gap = model.add_layer("GAP", LayerType::GlobalAvgPooling, &LayerConfig::default(), &[a1])?;
    let d1 = model.add_layer("D1", LayerType::Dense, &dense_config(10), &[gap])?;
    model.add_layer("Cost", LayerType::Cost, &dense_config(10), &[d1])?;
    model.build()?;
    Ok(model)
}

/// Input, C1 feeding A1 and A2, Add, GAP, D1, Cost.
fn fan_out() -> Result<Model> {
    let mut model = Model::new(
        "fan_out",
        Dataset::Mnist,
        Dims::new(1, 1, 4, 4),
        ModelDefaults::default(),
    );
    let c1 = model.add_layer("C1", LayerType::Convolution, &conv_config(3), &[0])?;
    let config = LayerConfig::default();
    let a1 = model.add_layer("A1", LayerType::Activation, &config, &[c1])?;
    let a2 = model.add_layer("A2", LayerType::Activation, &config, &[c1])?;
    let add = model.add_layer("Add", LayerType::Add, &config, &[a1, a2])?;
    let gap = model.add_layer("GAP", LayerType::GlobalAvgPooling, &config, &[add])?;
    let d1 = model.add_layer("D1", LayerType::Dense, &dense_config(10), &[gap])?;
    model.add_layer("Cost", LayerType::Cost, &dense_config(10), &[d1])?;
    model.build()?;
    Ok(model)
}

fn feed(model: &mut Model, batch: usize) -> Result<()> {
    model.set_batch_size(batch)?;
    let len = model.desc(0).map_or(0, |x| x.len());
    let input: Vec<f32> = (0..len).map(|x| ((x * 7) % 11) as f32 / 11. - 0.5).collect();
    model.set_input(&input)?;
    let labels: Vec<usize> = (0..batch).map(|x| x % 10).collect();
    model.set_labels(0, &labels, 1)
}

fn copy_weights(src: &Model, dst: &mut Model) -> Result<()> {
    let mut bytes = Vec::new();
    src.write_weights(&mut bytes, None)?;
    dst.read_weights(bytes.as_slice(), None)
}

#[test]
fn inplace_activation_aliases_conv() -> Result<()> {
    let model = chain(Format::Blocked)?;
    assert_eq!(model.gradient_storage(0), Some(GradStorage::None));
    assert_eq!(model.gradient_storage(1), Some(GradStorage::Owns));
    assert_eq!(model.gradient_storage(2), Some(GradStorage::Aliases(1)));
    assert!(model.is_inplace(2));
    assert!(!model.is_inplace(3));
    assert_eq!(model.gradient_storage(5), Some(GradStorage::None));
    assert_eq!(model.consumers(1), &[2]);
    Ok(())
}

#[test]
fn shared_input_is_not_inplace() -> Result<()> {
    let model = fan_out()?;
    assert!(model.shares_input(1));
    assert_eq!(model.consumers(1), &[2, 3]);
    assert!(!model.is_inplace(2));
    assert!(!model.is_inplace(3));
    assert_eq!(model.gradient_storage(2), Some(GradStorage::Owns));
    assert_eq!(model.gradient_storage(3), Some(GradStorage::Owns));
    Ok(())
}

#[test]
fn layer_norm_keeps_its_gradient() -> Result<()> {
    let mut model = Model::new("norm", Dataset::Mnist, Dims::new(1, 1, 4, 4), ModelDefaults::default());
    let config = LayerConfig::default();
    let c1 = model.add_layer("C1", LayerType::Convolution, &conv_config(3), &[0])?;
    let ln = model.add_layer("LN", LayerType::LayerNorm, &config, &[c1])?;
    let gap = model.add_layer("GAP", LayerType::GlobalAvgPooling, &config, &[ln])?;
    let d1 = model.add_layer("D1", LayerType::Dense, &dense_config(10), &[gap])?;
    model.add_layer("Cost", LayerType::Cost, &dense_config(10), &[d1])?;
    model.build()?;
    assert!(!LayerType::LayerNorm.supports_inplace());
    assert!(!model.is_inplace(ln));
    assert_eq!(model.gradient_storage(ln), Some(GradStorage::Owns));
    Ok(())
}

#[test]
fn unbuilt_model_refuses_forward() -> Result<()> {
    let mut model = Model::new(
        "partial",
        Dataset::Mnist,
        Dims::new(1, 1, 4, 4),
        ModelDefaults::default(),
    );
    model.add_layer("D1", LayerType::Dense, &dense_config(10), &[0])?;
    assert!(model.forward(false).is_err());
    assert!(model.build().is_err());
    assert!(model.gradient_storage(1).is_none());
    Ok(())
}

#[test]
fn duplicate_layer_name_is_rejected() -> Result<()> {
    let mut model = chain(Format::Plain)?;
    assert!(model
        .add_layer("D1", LayerType::Dense, &dense_config(10), &[4])
        .is_err());
    Ok(())
}

#[test]
fn lean_memory_matches_full_memory() -> Result<()> {
    let mut full = fan_out()?;
    full.reset_weights()?;
    let mut lean = fan_out()?;
    copy_weights(&full, &mut lean)?;
    lean.set_lean_memory(true);
    for model in [&mut full, &mut lean] {
        feed(model, 3)?;
        model.forward(true)?;
        model.backward()?;
    }
    assert_relative_eq!(full.loss(), lean.loss());
    for (a, b) in full.layers().iter().zip(lean.layers()) {
        if let (Some(a), Some(b)) = (a.parameters(), b.parameters()) {
            for (x, y) in a.weights_d1().iter().zip(b.weights_d1()) {
                assert_relative_eq!(x, y, epsilon = 1e-6);
            }
        }
    }
    // owned buffers are released after backward
    assert!(lean.output_gradient(1)?.is_none());
    assert!(full.output_gradient(1)?.is_some());
    Ok(())
}

#[test]
fn lean_memory_keeps_loaded_batch() -> Result<()> {
    let mut full = chain(Format::Blocked)?;
    full.reset_weights()?;
    let mut lean = chain(Format::Blocked)?;
    copy_weights(&full, &mut lean)?;
    feed(&mut full, 2)?;
    feed(&mut lean, 2)?;
    let input = lean.output(0)?;
    lean.set_lean_memory(true);
    assert_eq!(lean.output(0)?, input);
    for model in [&mut full, &mut lean] {
        model.forward(true)?;
        model.backward()?;
    }
    assert_relative_eq!(full.loss(), lean.loss());
    lean.set_lean_memory(false);
    assert_eq!(lean.output(0)?, input);
    lean.forward(true)?;
    assert_relative_eq!(full.loss(), lean.loss());
    Ok(())
}

#[test]
fn plain_and_blocked_agree() -> Result<()> {
    let mut plain = chain(Format::Plain)?;
    plain.reset_weights()?;
    let mut blocked = chain(Format::Blocked)?;
    copy_weights(&plain, &mut blocked)?;
    for model in [&mut plain, &mut blocked] {
        feed(model, 2)?;
        model.forward(false)?;
    }
    for (x, y) in plain.output(4)?.iter().zip(blocked.output(4)?) {
        assert_relative_eq!(*x, y, epsilon = 1e-5);
    }
    Ok(())
}

#[test]
fn locked_layers_keep_weights() -> Result<()> {
    let mut model = chain(Format::Plain)?;
    model.reset_weights()?;
    feed(&mut model, 2)?;
    model.layer_mut(1).expect("C1").set_locked(true);
    let weights = |model: &Model, i: usize| {
        model.layers()[i]
            .parameters()
            .map(|x| x.weights().to_vec())
            .unwrap_or_default()
    };
    let (c1, d1) = (weights(&model, 1), weights(&model, 4));
    let rate = TrainingRate {
        optimizer: Optimizer::SGD,
        rate: 0.1,
        ..TrainingRate::default()
    };
    model.forward(true)?;
    model.backward()?;
    model.update_weights(&rate, false)?;
    assert_eq!(weights(&model, 1), c1);
    assert_ne!(weights(&model, 4), d1);
    model.update_weights(&rate, true)?;
    assert_ne!(weights(&model, 1), c1);
    Ok(())
}

#[test]
fn corrupted_model_stops_training() -> Result<()> {
    let mut model = chain(Format::Plain)?;
    model.reset_weights()?;
    let parameters = model
        .layer_mut(4)
        .and_then(|x| x.parameters_mut())
        .expect("D1");
    parameters.weights_mut()[0] = f32::NAN;
    let error = model.check_optimizer().unwrap_err();
    assert!(matches!(
        error.downcast_ref::<LayerError>(),
        Some(LayerError::NonFinite { .. })
    ));
    let batch = Batch {
        size: 1,
        input: vec![0.5; 36],
        labels: vec![vec![3]],
    };
    let rate = TrainingRate::default();
    assert!(model.train_batch(&batch, &rate).is_err());
    assert!(model.is_corrupted());
    assert!(model.train_batch(&batch, &rate).is_err());
    model.reset_weights()?;
    assert!(!model.is_corrupted());
    model.train_batch(&batch, &rate)?;
    Ok(())
}

#[test]
fn update_resolution_resizes_layers() -> Result<()> {
    let mut model = chain(Format::Blocked)?;
    model.update_resolution(10, 8)?;
    assert_eq!(model.layers()[1].dims(), Dims::new(5, 1, 10, 8));
    assert_eq!(model.layers()[3].dims(), Dims::new(5, 1, 1, 1));
    assert_eq!(model.layers()[4].dims(), Dims::new(10, 1, 1, 1));
    feed(&mut model, 1)?;
    model.forward(false)?;
    Ok(())
}

#[test]
fn metrics_count_samples() -> Result<()> {
    let mut model = chain(Format::Plain)?;
    model.reset_weights()?;
    feed(&mut model, 4)?;
    model.forward(false)?;
    model.forward(true)?;
    let metrics = model.cost_metrics("Cost").expect("Cost");
    assert_eq!(metrics.test.samples, 4);
    assert_eq!(metrics.train.samples, 4);
    assert!(model.loss() > 0.);
    model.reset_metrics();
    assert_eq!(model.cost_metrics("Cost").expect("Cost").test.samples, 0);
    Ok(())
}

#[test]
fn shared_model_refreshes_statistics() -> Result<()> {
    let mut model = chain(Format::Plain)?;
    model.reset_weights()?;
    feed(&mut model, 2)?;
    model.forward(false)?;
    let shared = SharedModel::new(model);
    assert!(shared.refresh_statistics());
    shared.set_batch_size(3)?;
    assert_eq!(shared.read().batch_size(), 3);
    Ok(())
}
