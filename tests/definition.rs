use convgraph::{
    definition::{check, normalize_definition, parse, Diagnostic},
    neural_network::{layer::LayerType, GradStorage},
    tensor::Dims,
};

const CIFAR: &str = "[Net]\nDataset=cifar10\nDim=3,32,32\n\n";

fn assert_rejected(definition: &str, message: &str) -> Diagnostic {
    let diagnostic = check(definition);
    assert!(diagnostic.is_error, "accepted:\n{definition}");
    assert!(
        diagnostic.message.contains(message),
        "{:?} does not contain {message:?}",
        diagnostic.message
    );
    diagnostic
}

#[test]
fn accepts_small_network() {
    let definition = format!(
        "{CIFAR}[C1]\nType=Convolution\nInputs=Input\nChannels=16\nKernel=3,3\n\n\
         [Cost1]\nType=Cost\nInputs=C1\nCost=CategoricalCrossEntropy\nChannels=10\n"
    );
    // compiles although forward would reject the 30x30 cost input
    assert_eq!(check(&definition), Diagnostic::ok());
    let model = parse(&definition).unwrap();
    assert_eq!(model.layers().len(), 3);
    assert_eq!(model.layers()[1].dims(), Dims::new(16, 1, 30, 30));
    assert_eq!(model.batch_size(), 1);
}

#[test]
fn cost_channels_must_match_classes() {
    let definition = format!(
        "{CIFAR}[C1]\nType=Convolution\nInputs=Input\nChannels=16\nKernel=3,3\n\n\
         [Cost1]\nType=Cost\nInputs=C1\nCost=CategoricalCrossEntropy\nChannels=16\n"
    );
    let diagnostic = check(&definition);
    assert_eq!(
        diagnostic.message,
        "Cost layers has not the same number of channels as the dataset: 10"
    );
    assert_eq!((diagnostic.line, diagnostic.column), (15, 10));
}

#[test]
fn duplicate_names_point_at_second_header() {
    let definition = format!(
        "{CIFAR}[C1]\nType=Convolution\nInputs=Input\nChannels=10\nKernel=3,3\n\n\
         [C1]\nType=GlobalAvgPooling\nInputs=C1\n\n[Cost]\nType=Cost\nInputs=C1\n"
    );
    let diagnostic = assert_rejected(&definition, "Layer name already in use, must be unique");
    assert_eq!(diagnostic.line, 11);
}

#[test]
fn self_reference_is_circular() {
    let definition = format!(
        "{CIFAR}[C1]\nType=Convolution\nInputs=C1\nChannels=10\n\n[Cost]\nType=Cost\nInputs=C1\n"
    );
    let diagnostic = assert_rejected(&definition, "is circular and isn't allowed.");
    assert_eq!(diagnostic.line, 7);
}

#[test]
fn missing_dim() {
    let definition = "[Net]\nDataset=cifar10\n\n[D1]\nType=Dense\nInputs=Input\nChannels=10\n\n\
                      [Cost]\nType=Cost\nInputs=D1\n";
    let diagnostic = assert_rejected(
        definition,
        "Model doesn't have the Dataset and Dim specifiers.",
    );
    assert_eq!(diagnostic.line, 4);
}

#[test]
fn last_layer_must_be_cost() {
    let definition = format!(
        "{CIFAR}[C1]\nType=Convolution\nInputs=Input\nChannels=10\nKernel=3,3\n\n\
         [P1]\nType=GlobalAvgPooling\nInputs=C1\n"
    );
    assert_rejected(&definition, "Last layer must of type Cost.");
}

#[test]
fn unreferenced_layer_is_named() {
    let definition = format!(
        "{CIFAR}[C1]\nType=Convolution\nInputs=Input\nChannels=10\nKernel=3,3\n\n\
         [Dead]\nType=Activation\nInputs=C1\n\n\
         [P1]\nType=GlobalAvgPooling\nInputs=C1\n\n[Cost]\nType=Cost\nInputs=P1\n"
    );
    let diagnostic = assert_rejected(&definition, "Layer Dead on line 11");
    assert_eq!(diagnostic.line, 11);
}

#[test]
fn unknown_input() {
    let definition = format!("{CIFAR}[D1]\nType=Dense\nInputs=C7\nChannels=10\n\n[Cost]\nType=Cost\nInputs=D1\n");
    let diagnostic = assert_rejected(&definition, "Input C7 doesn't exist.");
    assert_eq!((diagnostic.line, diagnostic.column), (7, 8));
}

#[test]
fn type_comes_first() {
    let definition = format!("{CIFAR}[D1]\nInputs=Input\nType=Dense\n");
    assert_rejected(&definition, "Type must be the first directive");
}

#[test]
fn directive_must_fit_type() {
    let definition = format!(
        "{CIFAR}[P1]\nType=GlobalAvgPooling\nInputs=Input\nKernel=2,2\n\n[Cost]\nType=Cost\nInputs=P1\n"
    );
    let diagnostic = assert_rejected(&definition, "Kernel isn't allowed for layer type GlobalAvgPooling");
    assert_eq!((diagnostic.line, diagnostic.column), (8, 1));
}

#[test]
fn geometry_must_fit() {
    let definition = format!(
        "{CIFAR}[C1]\nType=Convolution\nInputs=Input\nChannels=8\nKernel=3,3\nStride=2,2\n\n\
         [P1]\nType=GlobalAvgPooling\nInputs=C1\n\n[Cost]\nType=Cost\nInputs=P1\n"
    );
    assert_rejected(&definition, "don't fit the input 32x32");
}

#[test]
fn anisotropic_output_is_rejected() {
    let definition = format!(
        "{CIFAR}[C1]\nType=Convolution\nInputs=Input\nChannels=8\nKernel=3,1\n\n\
         [P1]\nType=GlobalAvgPooling\nInputs=C1\n\n[Cost]\nType=Cost\nInputs=P1\n"
    );
    assert_rejected(&definition, "isn't square");
}

#[test]
fn binary_inputs_need_equal_channels() {
    let definition = format!(
        "{CIFAR}[C1]\nType=Convolution\nInputs=Input\nChannels=8\nKernel=3,3\nPad=1,1\n\n\
         [A1]\nType=Add\nInputs=C1,Input\n\n[P1]\nType=GlobalAvgPooling\nInputs=A1\n\n\
         [Cost]\nType=Cost\nInputs=P1\n"
    );
    assert_rejected(&definition, "different channels 8 and 3");
}

#[test]
fn arity_is_checked() {
    let definition = format!(
        "{CIFAR}[A1]\nType=Add\nInputs=Input\n\n[Cost]\nType=Cost\nInputs=A1\n"
    );
    assert_rejected(&definition, "Add requires two inputs.");
}

#[test]
fn residual_network_builds_graph() {
    let definition = "
        [Resnet]
        Dataset = cifar10
        Dim = 3, 32, 32
        WeightsFiller = HeNormal(In, 1.0)
        Momentum = 0.99

        [C1]
        Type = Convolution
        Inputs = Input
        Channels = 16
        Kernel = 3, 3
        Pad = 1, 1
        [B1]
        Type = BatchNormActivation
        Inputs = C1
        Activation = Relu
        [C2]
        Type = Convolution
        Inputs = B1
        Channels = 16
        Kernel = 3, 3
        Pad = 1, 1
        Biases = No
        [A1]
        Type = Add
        Inputs = C2, B1
        [P1]
        Type = GlobalAvgPooling
        Inputs = A1
        [D1]
        Type = Dense
        Inputs = P1
        Channels = 10
        [Cost]
        Type = Cost
        Inputs = D1
        Channels = 10
    ";
    let model = parse(definition).unwrap();
    let index = |name| model.layer_index(name).unwrap();
    assert_eq!(model.layers()[index("B1")].layer_type(), LayerType::BatchNormActivation);
    assert!(model.is_inplace(index("B1")));
    assert_eq!(
        model.gradient_storage(index("B1")),
        Some(GradStorage::Aliases(index("C1")))
    );
    assert!(model.shares_input(index("B1")));
    assert_eq!(model.layers()[index("C2")].bias_count(), 0);
    assert_eq!(model.layers()[index("A1")].dims(), Dims::new(16, 1, 32, 32));
}

#[test]
fn normalized_positions() {
    let definition = "  [Net]  \n\n\n  Dataset =  cifar10\nDim=3,32,32\n[D1]\nType=Dense\nInputs=Input\nChannels=0\n";
    let normalized = normalize_definition(definition);
    assert!(normalized.starts_with("[Net]\n\nDataset=cifar10\nDim=3,32,32\n\n[D1]\n"));
    let diagnostic = check(definition);
    assert_eq!((diagnostic.line, diagnostic.column), (9, 10));
    assert!(diagnostic.message.contains("Channels must be at least 1"));
}

fn assert_diagnostic(definition: &str, line: usize, column: usize, message: &str) {
    let diagnostic = check(definition);
    assert!(diagnostic.is_error, "accepted:\n{definition}");
    assert_eq!(diagnostic.message, message);
    assert_eq!((diagnostic.line, diagnostic.column), (line, column));
}

#[test]
fn cost_layer_is_terminal() {
    let definition = format!(
        "{CIFAR}[C1]\nType=Convolution\nInputs=Input\nChannels=10\nKernel=3,3\n\n\
         [Cost1]\nType=Cost\nInputs=C1\nChannels=10\n\n\
         [D1]\nType=Dense\nInputs=Cost1\nChannels=10\n\n[Cost2]\nType=Cost\nInputs=D1\n"
    );
    assert_diagnostic(&definition, 18, 8, "Cost layer Cost1 can't be used as an input.");
}

#[test]
fn repeated_input() {
    let definition = format!(
        "{CIFAR}[A1]\nType=Add\nInputs=Input,Input\n\n[P1]\nType=GlobalAvgPooling\nInputs=A1\n\n\
         [Cost]\nType=Cost\nInputs=P1\n"
    );
    assert_diagnostic(&definition, 7, 14, "Input Input is used more than once.");
}

#[test]
fn input_type_is_reserved() {
    let definition = format!("{CIFAR}[I1]\nType=Input\nInputs=Input\n");
    assert_diagnostic(&definition, 6, 6, "Type Input is reserved for the model input.");
}

#[test]
fn dim_follows_dataset() {
    let definition = "[Net]\nDim=3,32,32\nDataset=cifar10\n";
    assert_diagnostic(definition, 2, 1, "Dim must follow Dataset.");
}

#[test]
fn dataset_only_once() {
    let definition = "[Net]\nDataset=cifar10\nDataset=mnist\nDim=1,28,28\n";
    assert_diagnostic(definition, 3, 1, "Dataset already specified.");
}

#[test]
fn directive_only_once() {
    let definition = format!(
        "{CIFAR}[C1]\nType=Convolution\nInputs=Input\nChannels=8\nChannels=16\n"
    );
    assert_diagnostic(&definition, 9, 1, "Channels already specified.");
}
