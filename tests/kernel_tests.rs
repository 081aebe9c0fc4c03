use anyhow::{ensure, Result};
use convgraph::{
    definition::parse,
    neural_network::{layer::LayerType, Model},
};
#[cfg(not(target_family = "wasm"))]
use libtest_mimic::{Arguments, Trial};

#[cfg(target_family = "wasm")]
fn main() {}

#[cfg(not(target_family = "wasm"))]
fn main() {
    let args = Arguments::from_args();
    libtest_mimic::run(&args, binary_tests()).exit()
}

#[cfg(not(target_family = "wasm"))]
fn binary_tests() -> Vec<Trial> {
    let mut tests = Vec::new();
    for op in LayerType::ALL.into_iter().filter(|x| x.is_binary()) {
        // 16 fills whole channel blocks, 11 leaves padding lanes
        for channels in [16, 11] {
            for broadcast in [false, true] {
                let name = format!(
                    "{}_c{channels}_{}",
                    op.to_string().to_lowercase(),
                    if broadcast { "broadcast" } else { "equal" }
                );
                tests.push(Trial::test(name, move || {
                    binary_plain_blocked(op, channels, broadcast)
                        .map_err(|e| format!("{e:#}").into())
                }));
            }
        }
    }
    tests
}

fn definition(op: LayerType, channels: usize, broadcast: bool, format: &str) -> String {
    // the second operand is squashed into ]0, 1[ so Divide stays finite
    let extra = if broadcast {
        "[G2]\nType=GlobalAvgPooling\nInputs=C2\n\n[A2]\nType=Activation\nInputs=G2\nActivation=Logistic\n"
    } else {
        "[A2]\nType=Activation\nInputs=C2\nActivation=Logistic\n"
    };
    format!(
        "[Net]\nDataset=cifar10\nDim=3,6,6\nFormat={format}\n\n\
         [C1]\nType=Convolution\nInputs=Input\nChannels={channels}\nKernel=3,3\nPad=1,1\n\n\
         [C2]\nType=Convolution\nInputs=Input\nChannels={channels}\nKernel=3,3\nPad=1,1\n\n\
         {extra}\n\
         [B]\nType={op}\nInputs=C1,A2\n\n\
         [P]\nType=GlobalAvgPooling\nInputs=B\n\n\
         [D]\nType=Dense\nInputs=P\nChannels=10\n\n\
         [Cost]\nType=Cost\nInputs=D\nCost=MeanSquaredError\nChannels=10\n"
    )
}

fn run(model: &mut Model) -> Result<()> {
    model.set_batch_size(2)?;
    let len = model.desc(0).map_or(0, |x| x.len());
    let input: Vec<f32> = (0..len)
        .map(|x| ((x * 29) % 23) as f32 / 23. - 0.5)
        .collect();
    model.set_input(&input)?;
    model.set_labels(0, &[1, 8], 1)?;
    model.forward(true)?;
    model.backward()
}

fn assert_close(name: &str, a: &[f32], b: &[f32]) -> Result<()> {
    ensure!(a.len() == b.len(), "{name}: {} != {} values", a.len(), b.len());
    for (i, (x, y)) in a.iter().zip(b).enumerate() {
        let tolerance = 1e-5 * x.abs().max(y.abs()).max(1.);
        ensure!((x - y).abs() <= tolerance, "{name}[{i}]: {x} != {y}");
    }
    Ok(())
}

fn binary_plain_blocked(op: LayerType, channels: usize, broadcast: bool) -> Result<()> {
    let mut plain = parse(&definition(op, channels, broadcast, "Plain"))?;
    let mut blocked = parse(&definition(op, channels, broadcast, "Blocked"))?;
    plain.reset_weights()?;
    let mut bytes = Vec::new();
    plain.write_weights(&mut bytes, None)?;
    blocked.read_weights(bytes.as_slice(), None)?;
    run(&mut plain)?;
    run(&mut blocked)?;
    let index = |name: &str| plain.layer_index(name).unwrap_or_default();
    let b = index("B");
    assert_close("output", &plain.output(b)?, &blocked.output(b)?)?;
    for name in ["C1", "A2"] {
        let i = index(name);
        let (Some(x), Some(y)) = (plain.output_gradient(i)?, blocked.output_gradient(i)?) else {
            anyhow::bail!("{name} has no gradient!");
        };
        assert_close(name, &x, &y)?;
    }
    assert_close("loss", &[plain.loss()], &[blocked.loss()])
}
