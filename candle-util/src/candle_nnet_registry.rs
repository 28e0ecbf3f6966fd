//! Build neural networks from textual block configurations.
//!
//! A network is a list of [`BlockConfig`]. Each block is a sequence of
//! element strings formatted as `Name:key=value;key=value`, e.g.
//! `Linear:in_features=10;out_features=20`. Several elements joined by
//! `|` are applied to the same input and summed. Element names are
//! resolved through an explicit [`ElementRegistry`].

use crate::candle_aux_layers::*;
use candle_core::{bail, Result, Tensor};
use candle_nn::{Activation, VarBuilder};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Keyword arguments of an element, values still as strings
pub type ElementArgs = BTreeMap<String, String>;

/// `(arguments, variables) -> element`
pub type ElementFactory =
    Box<dyn Fn(&ElementArgs, VarBuilder) -> Result<NnetElement> + Send + Sync>;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct BlockConfig {
    pub block_structure: Vec<String>,
    #[serde(default)]
    pub residual: bool,
}

/// Map from element names to their factories
pub struct ElementRegistry {
    factories: BTreeMap<String, ElementFactory>,
}

impl Default for ElementRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl ElementRegistry {
    /// A registry without any element
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// `Linear`, `Tanh`, `ReLU`, `Sigmoid`, `ELU`, `LeakyReLU`,
    /// `Softplus`, `Identity`, `Reshape`
    pub fn with_defaults() -> Self {
        let mut ret = Self::empty();

        ret.register("Linear", |args, vb| {
            let d_in = parse_arg::<usize>(args, "in_features")?;
            let d_out = parse_arg::<usize>(args, "out_features")?;
            let bias = parse_arg_or(args, "bias", true)?;
            let layer = if bias {
                candle_nn::linear(d_in, d_out, vb)?
            } else {
                candle_nn::linear_no_bias(d_in, d_out, vb)?
            };
            Ok(NnetElement::new("Linear", layer))
        });

        ret.register("Tanh", |_, _| {
            Ok(NnetElement::new("Tanh", |xs: &Tensor| xs.tanh()))
        });

        ret.register("ReLU", |_, _| Ok(NnetElement::new("ReLU", Activation::Relu)));

        ret.register("Sigmoid", |_, _| {
            Ok(NnetElement::new("Sigmoid", Activation::Sigmoid))
        });

        ret.register("ELU", |args, _| {
            let alpha = parse_arg_or(args, "alpha", 1.0)?;
            Ok(NnetElement::new("ELU", Activation::Elu(alpha)))
        });

        ret.register("LeakyReLU", |args, _| {
            let slope = parse_arg_or(args, "negative_slope", 0.01)?;
            Ok(NnetElement::new("LeakyReLU", Activation::LeakyRelu(slope)))
        });

        ret.register("Softplus", |_, _| Ok(NnetElement::new("Softplus", softplus)));

        ret.register("Identity", |_, _| {
            Ok(NnetElement::new("Identity", |xs: &Tensor| Ok(xs.clone())))
        });

        ret.register("Reshape", |args, _| {
            let shape = parse_shape(required_arg(args, "shape")?)?;
            Ok(NnetElement::new("Reshape", Reshape { shape }))
        });

        ret
    }

    /// Add or replace an element factory
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&ElementArgs, VarBuilder) -> Result<NnetElement> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Box::new(factory));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(|x| x.as_str()).collect()
    }

    /// Create an element (or a sum of `|`-separated elements)
    /// * `strval` - element string
    /// * `vb` - variables of this element are created under `vb`
    pub fn create_element(&self, strval: &str, vb: VarBuilder) -> Result<NnetElement> {
        let parts = strval.split('|').collect::<Vec<_>>();

        let mut elements = Vec::with_capacity(parts.len());
        for (b, part) in parts.iter().enumerate() {
            let (name, args) = parse_nnet_element(part)?;
            let factory = match self.factories.get(&name) {
                Some(f) => f,
                None => bail!("unknown nnet element type: {}", name),
            };
            let vb_b = if parts.len() > 1 { vb.pp(b) } else { vb.clone() };
            elements.push(factory(&args, vb_b)?);
        }

        if elements.len() == 1 {
            Ok(elements.remove(0))
        } else {
            Ok(NnetElement::new("Merge", MergeBranches::new(elements)))
        }
    }

    /// Create one block; element `j` lives under `vb.pp(j)`
    pub fn create_block(&self, config: &BlockConfig, vb: VarBuilder) -> Result<NeuralNetworkBlock> {
        let mut structure = StackLayers::<NnetElement>::new();
        for (j, strval) in config.block_structure.iter().enumerate() {
            structure.push(self.create_element(strval, vb.pp(j))?);
        }
        Ok(NeuralNetworkBlock::new(structure, config.residual))
    }

    /// Create a whole network; block `i` lives under `vb.pp("block.{i}")`
    pub fn create_nnet(&self, blocks: &[BlockConfig], vb: VarBuilder) -> Result<NeuralNetwork> {
        let blocks = blocks
            .iter()
            .enumerate()
            .map(|(i, conf)| self.create_block(conf, vb.pp(format!("block.{}", i))))
            .collect::<Result<Vec<_>>>()?;
        Ok(NeuralNetwork::new(blocks))
    }
}

/// Split `Name:k1=v1;k2=v2` into the name and its arguments
pub fn parse_nnet_element(strval: &str) -> Result<(String, ElementArgs)> {
    let strval = strval.trim();
    let mut args = ElementArgs::new();

    let name = match strval.split_once(':') {
        Some((name, args_str)) => {
            for kv in args_str.split(';').filter(|x| !x.trim().is_empty()) {
                match kv.split_once('=') {
                    Some((k, v)) => {
                        args.insert(k.trim().to_string(), v.trim().to_string());
                    }
                    None => bail!("malformed argument `{}` in `{}`", kv, strval),
                }
            }
            name.trim()
        }
        None => strval,
    };

    if name.is_empty() {
        bail!("empty nnet element name in `{}`", strval);
    }
    Ok((name.to_string(), args))
}

fn required_arg<'a>(args: &'a ElementArgs, key: &str) -> Result<&'a str> {
    match args.get(key) {
        Some(v) => Ok(v.as_str()),
        None => bail!("missing argument `{}`", key),
    }
}

fn parse_arg<T>(args: &ElementArgs, key: &str) -> Result<T>
where
    T: std::str::FromStr,
{
    let v = required_arg(args, key)?;
    match v.parse::<T>() {
        Ok(x) => Ok(x),
        Err(_) => bail!("cannot parse `{}={}`", key, v),
    }
}

fn parse_arg_or<T>(args: &ElementArgs, key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
{
    if args.contains_key(key) {
        parse_arg(args, key)
    } else {
        Ok(default)
    }
}

/// `(a, b, c)` or `[a, b, c]` into integers; `-1` is inferred later
fn parse_shape(strval: &str) -> Result<Vec<i64>> {
    strval
        .trim_matches(|c| c == '(' || c == ')' || c == '[' || c == ']')
        .split(',')
        .filter(|x| !x.trim().is_empty())
        .map(|x| match x.trim().parse::<i64>() {
            Ok(v) => Ok(v),
            Err(_) => bail!("bad shape entry `{}`", x),
        })
        .collect()
}

/// `log(1 + exp(x))` without overflow
fn softplus(xs: &Tensor) -> Result<Tensor> {
    let pos = xs.relu()?;
    let neg_abs = xs.abs()?.neg()?;
    pos + (neg_abs.exp()? + 1.)?.log()?
}

/// Reshape with at most one free (`-1`) dimension
struct Reshape {
    shape: Vec<i64>,
}

impl candle_nn::Module for Reshape {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let known: i64 = self.shape.iter().filter(|&&d| d > 0).product();
        let nfree = self.shape.iter().filter(|&&d| d < 0).count();
        if nfree > 1 || known == 0 {
            bail!("invalid reshape target {:?}", self.shape);
        }
        let ntot = xs.elem_count() as i64;
        if ntot % known != 0 {
            bail!("cannot reshape {:?} into {:?}", xs.dims(), self.shape);
        }
        let dims = self
            .shape
            .iter()
            .map(|&d| if d < 0 { (ntot / known) as usize } else { d as usize })
            .collect::<Vec<_>>();
        xs.reshape(dims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::{Module, VarMap};

    #[test]
    fn parse_element_strings() -> Result<()> {
        let (name, args) = parse_nnet_element("Linear:in_features=10;out_features=20")?;
        assert_eq!(name, "Linear");
        assert_eq!(args.get("in_features").map(|x| x.as_str()), Some("10"));
        assert_eq!(args.get("out_features").map(|x| x.as_str()), Some("20"));

        let (name, args) = parse_nnet_element(" Tanh ")?;
        assert_eq!(name, "Tanh");
        assert!(args.is_empty());

        assert!(parse_nnet_element("Linear:in_features").is_err());
        Ok(())
    }

    #[test]
    fn unknown_element_is_an_error() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let registry = ElementRegistry::with_defaults();
        let err = registry.create_element("Conv9000:k=3", vb).err().unwrap();
        assert!(err.to_string().contains("unknown nnet element type"));
        Ok(())
    }

    #[test]
    fn residual_block_and_branches() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let registry = ElementRegistry::with_defaults();

        let blocks: Vec<BlockConfig> = serde_json::from_str(
            r#"[
                {"block_structure": ["Linear:in_features=3;out_features=4", "Tanh"]},
                {"block_structure": ["Linear:in_features=4;out_features=4|Identity", "ELU:alpha=0.5"],
                 "residual": true}
            ]"#,
        )
        .map_err(|e| candle_core::Error::Msg(e.to_string()))?;

        assert!(!blocks[0].residual);
        assert!(blocks[1].residual);

        let nnet = registry.create_nnet(&blocks, vb)?;
        assert_eq!(nnet.num_blocks(), 2);

        let x = Tensor::ones((5, 3), DType::F32, &Device::Cpu)?;
        let y = nnet.forward(&x)?;
        assert_eq!(y.dims(), &[5, 4]);

        // two linear layers, weights + biases
        assert_eq!(varmap.all_vars().len(), 4);
        let names = varmap.data().lock().unwrap().keys().cloned().collect::<Vec<_>>();
        assert!(names.iter().any(|x| x == "block.1.0.0.weight"));
        Ok(())
    }

    #[test]
    fn reshape_and_softplus() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let registry = ElementRegistry::with_defaults();

        let reshape = registry.create_element("Reshape:shape=(-1, 2)", vb.clone())?;
        let x = Tensor::arange(0_f32, 6., &Device::Cpu)?;
        assert_eq!(reshape.forward(&x)?.dims(), &[3, 2]);

        let softplus = registry.create_element("Softplus", vb)?;
        let y = softplus
            .forward(&Tensor::new(&[-100_f32, 0., 100.], &Device::Cpu)?)?
            .to_vec1::<f32>()?;
        approx::assert_abs_diff_eq!(y[0], 0.0, epsilon = 1e-6);
        approx::assert_abs_diff_eq!(y[1], 2_f32.ln(), epsilon = 1e-6);
        approx::assert_abs_diff_eq!(y[2], 100.0, epsilon = 1e-4);
        Ok(())
    }
}
