//! Model definitions.
//!
//! A definition is line oriented. The first `[Name]` header opens the model block, which must
//! give `Dataset=` and then `Dim=`. Every later header opens a layer block, which must start with
//! `Type=` followed by `Inputs=`:
//!
//! ```text
//! [Net]
//! Dataset=cifar10
//! Dim=3,32,32
//!
//! [C1]
//! Type=Convolution
//! Inputs=Input
//! Channels=16
//! Kernel=3,3
//!
//! [Cost1]
//! Type=Cost
//! Inputs=C1
//! Channels=10
//! ```
//!
//! Layers may only read layers declared before them, so declaration order is a topological
//! order. Every layer but the cost layers must be read by another layer, and the last layer must
//! be a cost layer.
//!
//! Errors are reported as a [`Diagnostic`] positioned in the [normalized](normalize_definition)
//! definition.
pub use crate::error::Diagnostic;
use crate::{
    dataset::Dataset,
    engine::{conv_output_size, deconv_output_size},
    neural_network::{
        layer::{Arity, LayerConfig, LayerType},
        Model, ModelDefaults,
    },
    tensor::Dims,
};
use std::{collections::HashSet, fmt::Display, str::FromStr};

type Parsed<T> = Result<T, Diagnostic>;

/// Cleans up the formatting of a definition.
///
/// Tabs become spaces, runs of spaces collapse, spaces around `=` and `,` are removed, runs of
/// blank lines collapse to one and every header is preceded by a blank line.
pub fn normalize_definition(definition: &str) -> String {
    let mut lines: Vec<String> = Vec::new();
    for line in definition.lines() {
        let words: Vec<&str> = line.split_whitespace().collect();
        let line = words
            .join(" ")
            .replace(" =", "=")
            .replace("= ", "=")
            .replace(" ,", ",")
            .replace(", ", ",");
        if line.is_empty() {
            if lines.last().map_or(false, |x| !x.is_empty()) {
                lines.push(line);
            }
            continue;
        }
        if line.starts_with('[') && lines.last().map_or(false, |x| !x.is_empty()) {
            lines.push(String::new());
        }
        lines.push(line);
    }
    while lines.last().map_or(false, |x| x.is_empty()) {
        lines.pop();
    }
    let mut normalized = lines.join("\n");
    normalized.push('\n');
    normalized
}

/// Output extent of a kernel over `input`, `None` unless the kernel fits a whole number of times.
pub fn output_extent(
    input: usize,
    kernel: usize,
    stride: usize,
    dilation: usize,
    pad: usize,
    transposed: bool,
) -> Option<usize> {
    if kernel == 0 || stride == 0 || dilation == 0 {
        return None;
    }
    if transposed {
        return deconv_output_size(input, kernel, stride, dilation, pad).filter(|x| *x > 0);
    }
    let span = dilation * (kernel - 1) + 1;
    let room = (input + 2 * pad).checked_sub(span)?;
    if room % stride != 0 {
        return None;
    }
    conv_output_size(input, kernel, stride, dilation, pad)
}

/// Compiles a definition into a built model with batch size 1.
///
/// The weights are not filled, call [`Model::reset_weights`] or load them.
pub fn parse(definition: &str) -> Result<Model, Diagnostic> {
    let normalized = normalize_definition(definition);
    let mut parser = Parser::default();
    for (index, text) in normalized.lines().enumerate() {
        parser.line(index + 1, text)?;
    }
    parser.finish()
}

/// Runs [`parse`] and discards the model, returning [`Diagnostic::ok`] when the definition is
/// valid.
pub fn check(definition: &str) -> Diagnostic {
    match parse(definition) {
        Ok(_) => Diagnostic::ok(),
        Err(diagnostic) => diagnostic,
    }
}

/// A `Key=Value` line.
#[derive(Clone, Copy)]
struct Directive<'a> {
    line: usize,
    key: &'a str,
    value: &'a str,
}

impl Directive<'_> {
    /// An error pointing at the value.
    fn error(&self, message: impl Into<String>) -> Diagnostic {
        Diagnostic::error(self.line, self.key.len() + 2, message)
    }
    /// An error pointing at the key.
    fn key_error(&self, message: impl Into<String>) -> Diagnostic {
        Diagnostic::error(self.line, 1, message)
    }
    fn invalid(&self) -> Diagnostic {
        self.error(format!("Invalid value for {}: {}", self.key, self.value))
    }
    fn parse<T: FromStr>(&self) -> Parsed<T> {
        self.value.parse().map_err(|_| self.invalid())
    }
    fn parse_usize(&self, min: usize) -> Parsed<usize> {
        let x: usize = self.parse()?;
        if x < min {
            return Err(self.error(format!("{} must be at least {min}.", self.key)));
        }
        Ok(x)
    }
    fn parse_f32(&self, valid: impl Fn(f32) -> bool, range: &str) -> Parsed<f32> {
        let x: f32 = self.parse()?;
        if !x.is_finite() || !valid(x) {
            return Err(self.error(format!("{} must be in {range}.", self.key)));
        }
        Ok(x)
    }
    fn parse_list<T: FromStr>(&self) -> Parsed<Vec<T>> {
        self.value.split(',').map(|x| x.parse().map_err(|_| self.invalid())).collect()
    }
    /// `h,w` or a single value for both.
    fn parse_pair(&self, min: usize) -> Parsed<[usize; 2]> {
        let pair = match self.parse_list::<usize>()?.as_slice() {
            [x] => [*x, *x],
            [h, w] => [*h, *w],
            _ => return Err(self.invalid()),
        };
        if pair.iter().any(|x| *x < min) {
            return Err(self.error(format!("{} must be at least {min}.", self.key)));
        }
        Ok(pair)
    }
    fn parse_factor(&self) -> Parsed<[f32; 2]> {
        let pair = match self.parse_list::<f32>()?.as_slice() {
            [x] => [*x, *x],
            [h, w] => [*h, *w],
            _ => return Err(self.invalid()),
        };
        if pair.iter().any(|x| !x.is_finite() || *x <= 0.) {
            return Err(self.error(format!("{} must be positive.", self.key)));
        }
        Ok(pair)
    }
    fn parse_bool(&self) -> Parsed<bool> {
        match self.value.to_lowercase().as_str() {
            "yes" | "true" => Ok(true),
            "no" | "false" => Ok(false),
            _ => Err(self.invalid()),
        }
    }
}

fn positive(x: f32) -> bool {
    x >= 0.
}

fn open_unit(x: f32) -> bool {
    x > 0. && x < 1.
}

/// Directives shared by the model block and layer blocks.
fn apply_default(defaults: &mut ModelDefaults, d: &Directive) -> Parsed<bool> {
    match d.key {
        "WeightsFiller" => defaults.weights_filler = d.parse()?,
        "BiasesFiller" => defaults.biases_filler = d.parse()?,
        "WeightsLRM" => defaults.weights_lrm = d.parse_f32(positive, "[0, inf[")?,
        "WeightsWDM" => defaults.weights_wdm = d.parse_f32(positive, "[0, inf[")?,
        "BiasesLRM" => defaults.biases_lrm = d.parse_f32(positive, "[0, inf[")?,
        "BiasesWDM" => defaults.biases_wdm = d.parse_f32(positive, "[0, inf[")?,
        "Biases" => defaults.biases = d.parse_bool()?,
        "Momentum" => defaults.momentum = d.parse_f32(open_unit, "]0, 1[")?,
        "Eps" => defaults.eps = d.parse_f32(|x| x > 0. && x <= 1., "]0, 1]")?,
        "Scaling" => defaults.scaling = d.parse_bool()?,
        "Dropout" => defaults.dropout = d.parse_f32(|x| (0. ..1.).contains(&x), "[0, 1[")?,
        "Alpha" => defaults.alpha = Some(d.parse_f32(|_| true, "f32")?),
        "Beta" => defaults.beta = Some(d.parse_f32(|_| true, "f32")?),
        _ => return Ok(false),
    }
    Ok(true)
}

/// Which of the two mandatory directives of a block were given, in order.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
enum Mandatory {
    #[default]
    Missing,
    First,
    Both,
}

#[derive(Debug)]
struct ModelBlock {
    name: String,
    mandatory: Mandatory,
    dataset: Option<Dataset>,
    dims: Option<Dims>,
    defaults: ModelDefaults,
}

impl ModelBlock {
    fn directive(&mut self, d: &Directive) -> Parsed<()> {
        match d.key {
            "Dataset" => {
                if self.mandatory != Mandatory::Missing {
                    return Err(d.key_error("Dataset already specified."));
                }
                self.dataset = Some(d.parse()?);
                self.mandatory = Mandatory::First;
            }
            "Dim" => {
                let Some(dataset) = self.dataset.filter(|_| self.mandatory == Mandatory::First)
                else {
                    return Err(d.key_error("Dim must follow Dataset."));
                };
                let dims = match d.parse_list::<usize>()?.as_slice() {
                    [c, h, w] => Dims::new(*c, 1, *h, *w),
                    [c, depth, h, w] => Dims::new(*c, *depth, *h, *w),
                    _ => return Err(d.invalid()),
                };
                if dims.size() == 0 {
                    return Err(d.error("Dim must not be zero."));
                }
                let channels = dataset.dims().c;
                if dims.c != channels {
                    return Err(d.error(format!("Dim channels must match the dataset: {channels}")));
                }
                self.dims = Some(dims);
                self.mandatory = Mandatory::Both;
            }
            "Format" => self.defaults.format = d.parse()?,
            _ => {
                if !apply_default(&mut self.defaults, d)? {
                    return Err(d.key_error(format!("Unrecognized model directive {}.", d.key)));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
struct LayerBlock {
    name: String,
    line: usize,
    mandatory: Mandatory,
    layer_type: LayerType,
    inputs: Vec<usize>,
    config: LayerConfig,
    seen: HashSet<String>,
}

/// Whether `key` may be given for `t`.
fn is_allowed(key: &str, t: LayerType) -> bool {
    use LayerType::*;
    match key {
        "Channels" => matches!(t, Convolution | ConvolutionTranspose | Dense | ChannelZeroPad | Cost),
        "Kernel" | "Stride" | "Pad" => t.has_kernel(),
        "Dilation" => t.is_conv() || t == PartialDepthwiseConvolution,
        "Groups" => matches!(
            t,
            Convolution | ConvolutionTranspose | Shuffle | ChannelSplit | PartialDepthwiseConvolution
        ),
        "Group" => matches!(t, ChannelSplit | PartialDepthwiseConvolution),
        "Multiplier" => matches!(t, DepthwiseConvolution | PartialDepthwiseConvolution),
        "Ratio" => matches!(t, ChannelSplitRatioLeft | ChannelSplitRatioRight),
        "Biases" | "WeightsFiller" | "BiasesFiller" | "WeightsLRM" | "WeightsWDM" | "BiasesLRM"
        | "BiasesWDM" => t.has_weights() || t.is_norm(),
        "Momentum" => t.is_batch_norm(),
        "Eps" => t.is_norm() || t == Cost,
        "Scaling" => t.is_norm(),
        "Activation" | "Alpha" | "Beta" => t.has_activation(),
        "Dropout" => t.has_dropout(),
        "Cost" | "LabelIndex" | "GroupIndex" | "Weight" | "LabelTrue" | "LabelFalse" => t == Cost,
        "Factor" | "Algorithm" => t == Resampling,
        "Operation" => t == Reduction,
        _ => false,
    }
}

fn arity_message(t: LayerType) -> String {
    match t.arity() {
        Arity::None => format!("{t} takes no inputs."),
        Arity::One => format!("{t} requires one input."),
        Arity::Two => format!("{t} requires two inputs."),
        Arity::AtLeastTwo => format!("{t} requires at least two inputs."),
    }
}

#[derive(Debug, Default)]
struct Parser {
    model_block: Option<ModelBlock>,
    model: Option<Model>,
    block: Option<LayerBlock>,
    /// Declared layers with their header line, indexed like the model layers.
    names: Vec<(String, usize)>,
    referenced: Vec<bool>,
}

impl Parser {
    fn line(&mut self, line: usize, text: &str) -> Parsed<()> {
        if text.is_empty() {
            return Ok(());
        }
        if let Some(header) = text.strip_prefix('[') {
            let name = match header.strip_suffix(']') {
                Some(name) if !name.is_empty() && !name.contains(|c| matches!(c, '[' | ']' | '=' | ',')) => name,
                _ => return Err(Diagnostic::error(line, 1, format!("Invalid header {text}"))),
            };
            return self.header(line, name);
        }
        let Some((key, value)) = text.split_once('=') else {
            return Err(Diagnostic::error(line, 1, format!("Invalid directive {text}")));
        };
        let directive = Directive { line, key, value };
        if value.is_empty() {
            return Err(directive.error(format!("Missing value for {key}.")));
        }
        if let Some(block) = self.block.as_mut() {
            return layer_directive(block, &directive, &self.names, self.model.as_ref());
        }
        match self.model_block.as_mut() {
            Some(model_block) => model_block.directive(&directive),
            None => Err(Diagnostic::error(
                line,
                1,
                "Definition must start with a [Model] header.",
            )),
        }
    }
    fn header(&mut self, line: usize, name: &str) -> Parsed<()> {
        if self.model_block.is_none() && self.model.is_none() {
            self.model_block = Some(ModelBlock {
                name: name.into(),
                mandatory: Mandatory::Missing,
                dataset: None,
                dims: None,
                defaults: ModelDefaults::default(),
            });
            return Ok(());
        }
        self.close_block(line)?;
        if self.names.iter().any(|(x, _)| x == name) {
            return Err(Diagnostic::error(
                line,
                2,
                "Layer name already in use, must be unique",
            ));
        }
        let Some(model) = self.model.as_ref() else {
            return Err(Diagnostic::error(line, 1, "Model block is missing."));
        };
        self.block = Some(LayerBlock {
            name: name.into(),
            line,
            mandatory: Mandatory::Missing,
            layer_type: LayerType::Input,
            inputs: Vec::new(),
            config: LayerConfig::new(model.defaults()),
            seen: HashSet::new(),
        });
        Ok(())
    }
    /// Closes the model block or the open layer block, `line` is where the next block starts.
    fn close_block(&mut self, line: usize) -> Parsed<()> {
        if let Some(model_block) = self.model_block.take() {
            let (Some(dataset), Some(dims)) = (model_block.dataset, model_block.dims) else {
                return Err(Diagnostic::error(
                    line,
                    1,
                    "Model doesn't have the Dataset and Dim specifiers.",
                ));
            };
            self.model = Some(Model::new(model_block.name, dataset, dims, model_block.defaults));
            self.names.push(("Input".into(), 1));
            self.referenced.push(false);
            return Ok(());
        }
        let Some(block) = self.block.take() else {
            return Ok(());
        };
        let Some(model) = self.model.as_mut() else {
            return Err(Diagnostic::error(block.line, 1, "Model block is missing."));
        };
        let index = close_layer(model, &block)?;
        debug_assert_eq!(index, self.names.len());
        for input in block.inputs.iter() {
            self.referenced[*input] = true;
        }
        self.names.push((block.name, block.line));
        self.referenced.push(false);
        Ok(())
    }
    fn finish(mut self) -> Parsed<Model> {
        let last_line = self.block.as_ref().map_or(1, |x| x.line);
        self.close_block(last_line)?;
        let Some(mut model) = self.model.take() else {
            return Err(Diagnostic::error(
                1,
                1,
                "Model doesn't have the Dataset and Dim specifiers.",
            ));
        };
        let cost = LayerType::Cost;
        if model.layers().last().map(|x| x.layer_type()) != Some(cost) {
            return Err(Diagnostic::error(last_line, 1, "Last layer must of type Cost."));
        }
        for (i, layer) in model.layers().iter().enumerate().skip(1) {
            if layer.layer_type() != cost && !self.referenced[i] {
                let line = self.names[i].1;
                return Err(Diagnostic::error(
                    line,
                    2,
                    format!(
                        "Layer {} on line {line} isn't referenced by any other layer.",
                        layer.name()
                    ),
                ));
            }
        }
        model
            .build()
            .map_err(|e| Diagnostic::error(last_line, 1, format!("{e:#}")))?;
        Ok(model)
    }
}

fn layer_directive(
    block: &mut LayerBlock,
    d: &Directive,
    names: &[(String, usize)],
    model: Option<&Model>,
) -> Parsed<()> {
    if !block.seen.insert(d.key.to_string()) {
        return Err(d.key_error(format!("{} already specified.", d.key)));
    }
    let t = block.layer_type;
    match (d.key, block.mandatory) {
        ("Type", Mandatory::Missing) => {
            let t: LayerType = d.parse()?;
            if t == LayerType::Input {
                return Err(d.error("Type Input is reserved for the model input."));
            }
            block.layer_type = t;
            block.mandatory = Mandatory::First;
            return Ok(());
        }
        (_, Mandatory::Missing) => {
            return Err(d.key_error("Type must be the first directive of a layer."));
        }
        ("Inputs", _) => {
            block.inputs = resolve_inputs(block, d, names, model)?;
            block.mandatory = Mandatory::Both;
            return Ok(());
        }
        _ => (),
    }
    if !is_allowed(d.key, t) {
        let known = LayerType::ALL.iter().any(|x| is_allowed(d.key, *x));
        return Err(if known {
            d.key_error(format!("{} isn't allowed for layer type {t}.", d.key))
        } else {
            d.key_error(format!("Unrecognized directive {}.", d.key))
        });
    }
    let config = &mut block.config;
    match d.key {
        "Channels" => {
            config.channels = d.parse_usize(1)?;
            if t == LayerType::Cost {
                let classes = model.map_or(0, |x| x.dataset().classes());
                if config.channels != classes {
                    return Err(d.error(format!(
                        "Cost layers has not the same number of channels as the dataset: {classes}"
                    )));
                }
            }
        }
        "Kernel" => config.kernel = d.parse_pair(1)?,
        "Stride" => config.stride = d.parse_pair(1)?,
        "Pad" => config.pad = d.parse_pair(0)?,
        "Dilation" => config.dilation = d.parse_pair(1)?,
        "Groups" => config.groups = d.parse_usize(1)?,
        "Group" => config.group = d.parse_usize(1)?,
        "Multiplier" => config.multiplier = d.parse_usize(1)?,
        "Ratio" => config.ratio = d.parse_f32(open_unit, "]0, 1[")?,
        "Biases" => config.biases = d.parse_bool()?,
        "WeightsFiller" => config.weights_filler = Some(d.parse()?),
        "BiasesFiller" => config.biases_filler = Some(d.parse()?),
        "WeightsLRM" => config.weights_lrm = d.parse_f32(positive, "[0, inf[")?,
        "WeightsWDM" => config.weights_wdm = d.parse_f32(positive, "[0, inf[")?,
        "BiasesLRM" => config.biases_lrm = d.parse_f32(positive, "[0, inf[")?,
        "BiasesWDM" => config.biases_wdm = d.parse_f32(positive, "[0, inf[")?,
        "Momentum" => config.momentum = d.parse_f32(open_unit, "]0, 1[")?,
        "Eps" => config.eps = d.parse_f32(|x| x > 0. && x <= 1., "]0, 1]")?,
        "Scaling" => config.scaling = d.parse_bool()?,
        "Activation" => config.activation = d.parse()?,
        "Alpha" => config.alpha = Some(d.parse_f32(|_| true, "f32")?),
        "Beta" => config.beta = Some(d.parse_f32(|_| true, "f32")?),
        "Dropout" => config.dropout = d.parse_f32(|x| (0. ..1.).contains(&x), "[0, 1[")?,
        "Cost" => config.cost = d.parse()?,
        "LabelIndex" => config.label_index = d.parse_usize(0)?,
        "GroupIndex" => config.group_index = d.parse_usize(0)?,
        "Weight" => config.weight = d.parse_f32(positive, "[0, inf[")?,
        "LabelTrue" => config.label_true = d.parse_f32(|_| true, "f32")?,
        "LabelFalse" => config.label_false = d.parse_f32(|_| true, "f32")?,
        "Factor" => config.factor = d.parse_factor()?,
        "Algorithm" => config.algorithm = d.parse()?,
        "Operation" => config.operation = d.parse()?,
        _ => return Err(d.key_error(format!("Unrecognized directive {}.", d.key))),
    }
    Ok(())
}

fn resolve_inputs(
    block: &LayerBlock,
    d: &Directive,
    names: &[(String, usize)],
    model: Option<&Model>,
) -> Parsed<Vec<usize>> {
    let mut inputs = Vec::new();
    let mut column = d.key.len() + 2;
    for token in d.value.split(',') {
        let error = |message: String| Diagnostic::error(d.line, column, message);
        if token.is_empty() {
            return Err(error("Empty input name.".into()));
        }
        if token == block.name {
            return Err(error(format!(
                "Layer {token} as input of itself is circular and isn't allowed."
            )));
        }
        let Some(index) = names.iter().position(|(x, _)| x == token) else {
            return Err(error(format!("Input {token} doesn't exist.")));
        };
        if inputs.contains(&index) {
            return Err(error(format!("Input {token} is used more than once.")));
        }
        let is_cost = model
            .and_then(|x| x.layer(index))
            .map_or(false, |x| x.layer_type() == LayerType::Cost);
        if is_cost {
            return Err(error(format!("Cost layer {token} can't be used as an input.")));
        }
        inputs.push(index);
        column += token.len() + 1;
    }
    if !block.layer_type.arity().accepts(inputs.len()) {
        return Err(d.error(arity_message(block.layer_type)));
    }
    Ok(inputs)
}

fn layer_error(block: &LayerBlock, message: impl Display) -> Diagnostic {
    Diagnostic::error(block.line, 2, format!("Layer {}: {message}", block.name))
}

/// Validates a complete layer block against its inputs and appends the layer.
fn close_layer(model: &mut Model, block: &LayerBlock) -> Parsed<usize> {
    let t = block.layer_type;
    if block.mandatory != Mandatory::Both {
        return Err(Diagnostic::error(
            block.line,
            2,
            format!("Layer {} doesn't have the Type and Inputs specifiers.", block.name),
        ));
    }
    let config = &block.config;
    let requires_channels = matches!(
        t,
        LayerType::Convolution
            | LayerType::ConvolutionTranspose
            | LayerType::Dense
            | LayerType::ChannelZeroPad
    );
    if requires_channels && config.channels == 0 {
        return Err(layer_error(block, format!("{t} requires Channels.")));
    }
    let dims: Vec<Dims> = block
        .inputs
        .iter()
        .filter_map(|x| model.layer(*x).map(|x| x.dims()))
        .collect();
    if t.is_binary() && dims[0].c != dims[1].c {
        return Err(layer_error(
            block,
            format!(
                "inputs have different channels {} and {}.",
                dims[0].c, dims[1].c
            ),
        ));
    }
    if t.has_kernel() {
        let input = dims[0];
        let transposed = t == LayerType::ConvolutionTranspose;
        let dilation = if t.is_conv() || t == LayerType::PartialDepthwiseConvolution {
            config.dilation
        } else {
            [1, 1]
        };
        let extent = |axis: usize, size: usize| {
            output_extent(
                size,
                config.kernel[axis],
                config.stride[axis],
                dilation[axis],
                config.pad[axis],
                transposed,
            )
        };
        let (Some(h), Some(w)) = (extent(0, input.h), extent(1, input.w)) else {
            return Err(layer_error(
                block,
                format!(
                    "Kernel, Stride and Pad don't fit the input {}x{}.",
                    input.h, input.w
                ),
            ));
        };
        if input.h == input.w && h != w {
            return Err(layer_error(block, format!("output {h}x{w} isn't square.")));
        }
    }
    model
        .add_layer(block.name.as_str(), t, config, &block.inputs)
        .map_err(|e| layer_error(block, format!("{e:#}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize() {
        let definition = "\n\n[Net]\r\nDataset = cifar10\n\tDim=3, 32,32\n[C1]\n\n\n\nType=Convolution\n\n";
        let normalized = normalize_definition(definition);
        assert_eq!(
            normalized,
            "[Net]\nDataset=cifar10\nDim=3,32,32\n\n[C1]\n\nType=Convolution\n"
        );
        assert_eq!(normalize_definition(&normalized), normalized);
    }

    fn reference_extent(input: usize, k: usize, s: usize, d: usize, p: usize) -> Option<usize> {
        let padded = (input + 2 * p) as i64;
        let span = (d * (k - 1) + 1) as i64;
        if padded < span || (padded - span) % s as i64 != 0 {
            None
        } else {
            Some(((padded - span) / s as i64 + 1) as usize)
        }
    }

    #[test]
    fn geometry_matches_reference() {
        for input in 1..=12 {
            for k in 1..=5 {
                for s in 1..=3 {
                    for d in 1..=2 {
                        for p in 0..=2 {
                            assert_eq!(
                                output_extent(input, k, s, d, p, false),
                                reference_extent(input, k, s, d, p)
                            );
                        }
                    }
                }
            }
        }
        assert_eq!(output_extent(4, 2, 2, 1, 0, true), Some(8));
        assert_eq!(output_extent(4, 0, 1, 1, 0, false), None);
    }

    #[test]
    fn booleans_are_case_insensitive() {
        for (value, expected) in [("Yes", true), ("no", false), ("TRUE", true), ("False", false)] {
            let d = Directive {
                line: 1,
                key: "Biases",
                value,
            };
            assert_eq!(d.parse_bool(), Ok(expected));
        }
        let d = Directive {
            line: 3,
            key: "Biases",
            value: "maybe",
        };
        let e = d.parse_bool().unwrap_err();
        assert_eq!((e.line, e.column), (3, 8));
    }

    #[test]
    fn directive_legality() {
        assert!(is_allowed("Kernel", LayerType::MaxPooling));
        assert!(!is_allowed("Kernel", LayerType::GlobalMaxPooling));
        assert!(is_allowed("Eps", LayerType::LayerNorm));
        assert!(!is_allowed("Momentum", LayerType::LayerNorm));
        assert!(is_allowed("Channels", LayerType::Cost));
        assert!(!is_allowed("Channels", LayerType::DepthwiseConvolution));
        assert!(is_allowed("Dropout", LayerType::BatchNormActivationDropout));
    }
}
