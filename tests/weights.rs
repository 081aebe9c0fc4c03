use anyhow::Result;
use convgraph::{
    dataset::Batch,
    definition::parse,
    error::LayerError,
    neural_network::{
        optimizer::{Optimizer, TrainingRate},
        Model,
    },
};

const DEFINITION: &str = "[Net]
Dataset=mnist
Dim=1,12,12
Format=Blocked

[C1]
Type=Convolution
Inputs=Input
Channels=12
Kernel=3,3
Pad=1,1

[B1]
Type=BatchNormActivation
Inputs=C1

[DW]
Type=DepthwiseConvolution
Inputs=B1
Kernel=3,3
Pad=1,1

[PD]
Type=PartialDepthwiseConvolution
Inputs=DW
Groups=3
Group=2
Multiplier=2
Kernel=3,3
Pad=1,1

[BN]
Type=BatchNorm
Inputs=PD

[T1]
Type=ConvolutionTranspose
Inputs=BN
Channels=5
Kernel=1,1

[LN]
Type=LayerNorm
Inputs=T1

[P1]
Type=GlobalAvgPooling
Inputs=LN

[D1]
Type=Dense
Inputs=P1
Channels=10

[Cost]
Type=Cost
Inputs=D1
Channels=10
";

fn trained(optimizer: Optimizer) -> Result<Model> {
    let mut model = parse(DEFINITION)?;
    model.reset_weights()?;
    let batch = Batch {
        size: 2,
        input: (0..2 * 144).map(|x| (x % 13) as f32 / 13.).collect(),
        labels: vec![vec![3, 7]],
    };
    let rate = TrainingRate {
        optimizer,
        ..TrainingRate::default()
    };
    for _ in 0..2 {
        model.train_batch(&batch, &rate)?;
    }
    Ok(model)
}

fn assert_same_parameters(a: &Model, b: &Model, optimizer: bool) {
    for (a, b) in a.layers().iter().zip(b.layers()) {
        assert_eq!(a.is_locked(), b.is_locked());
        let (Some(a), Some(b)) = (a.parameters(), b.parameters()) else {
            continue;
        };
        assert_eq!(a.weights(), b.weights());
        assert_eq!(a.biases(), b.biases());
        assert_eq!(a.running(), b.running());
        if optimizer {
            assert_eq!(a.weights_par(), b.weights_par());
            assert_eq!(a.biases_par(), b.biases_par());
            assert_eq!(a.scalars(), b.scalars());
        }
    }
}

#[test]
fn round_trip_with_optimizer() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("net.bin");
    let model = trained(Optimizer::Adam)?;
    let moments = model.layers()[1].parameters().map(|x| x.weights_par().len());
    assert_eq!(moments, Some(2));
    let pd = model.layer_index("PD").expect("PD");
    let bn = model.layer_index("BN").expect("BN");
    // two output channels per input of the second group of four
    assert_eq!(model.layers()[pd].weight_count(), 8 * 9);
    let running = model.layers()[bn].parameters().map(|x| x.running().to_vec());
    assert!(matches!(running, Some(ref x) if x.len() == 2 && x[0].iter().any(|m| *m != 0.)));
    model.save_weights(&path, Some(Optimizer::Adam))?;
    assert_eq!(
        std::fs::metadata(&path)?.len() as usize,
        model.weights_len(Some(Optimizer::Adam))
    );
    let mut loaded = parse(DEFINITION)?;
    loaded.reset_weights()?;
    loaded.load_weights(&path, Some(Optimizer::Adam))?;
    assert_same_parameters(&model, &loaded, true);
    Ok(())
}

#[test]
fn round_trip_without_optimizer() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("net.bin");
    let mut model = trained(Optimizer::SGDMomentum)?;
    model.layer_mut(3).expect("DW").set_locked(true);
    model.save_weights(&path, None)?;
    let mut loaded = parse(DEFINITION)?;
    loaded.load_weights(&path, None)?;
    assert_same_parameters(&model, &loaded, false);
    assert!(loaded.layers()[3].is_locked());
    Ok(())
}

#[test]
fn size_mismatch_is_rejected_before_reading() -> Result<()> {
    let model = trained(Optimizer::SGD)?;
    let mut bytes = Vec::new();
    model.write_weights(&mut bytes, None)?;
    let mut target = parse(DEFINITION)?;
    target.reset_weights()?;
    let before: Vec<Vec<f32>> = target
        .layers()
        .iter()
        .filter_map(|x| x.parameters().map(|p| p.weights().to_vec()))
        .collect();
    let error = target
        .read_weights(bytes.as_slice(), Some(Optimizer::Adam))
        .unwrap_err();
    match error.downcast_ref::<LayerError>() {
        Some(LayerError::WeightsSize {
            expected, found, ..
        }) => {
            assert_eq!(*found, bytes.len());
            assert_eq!(*expected, target.weights_len(Some(Optimizer::Adam)));
        }
        _ => panic!("unexpected error {error:?}"),
    }
    let after: Vec<Vec<f32>> = target
        .layers()
        .iter()
        .filter_map(|x| x.parameters().map(|p| p.weights().to_vec()))
        .collect();
    assert_eq!(before, after);
    bytes.pop();
    assert!(target.read_weights(bytes.as_slice(), None).is_err());
    Ok(())
}
