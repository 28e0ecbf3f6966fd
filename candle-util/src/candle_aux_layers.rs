use candle_core::{Result, Tensor};
use candle_nn::Module;

/// A type-erased network element (layer, activation, reshape, ...)
pub struct NnetElement {
    name: String,
    module: Box<dyn Module + Send + Sync>,
}

impl NnetElement {
    pub fn new<M>(name: &str, module: M) -> Self
    where
        M: Module + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            module: Box::new(module),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Module for NnetElement {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.module.forward(xs)
    }
}

/// Layers applied one after another
pub struct StackLayers<M>
where
    M: Module,
{
    module_layers: Vec<M>,
}

impl<M> Module for StackLayers<M>
where
    M: Module,
{
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let mut x = input.clone();
        for module in self.module_layers.iter() {
            x = module.forward(&x)?;
        }
        Ok(x)
    }
}

impl<M> StackLayers<M>
where
    M: Module,
{
    pub fn new() -> Self {
        Self {
            module_layers: Vec::new(),
        }
    }

    /// Appends a layer after all the current layers.
    pub fn push(&mut self, layer: M) {
        self.module_layers.push(layer);
    }

    pub fn len(&self) -> usize {
        self.module_layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.module_layers.is_empty()
    }
}

impl<M> Default for StackLayers<M>
where
    M: Module,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Feed the same input to every branch and sum up the outputs; all
/// branches must agree on the output shape.
pub struct MergeBranches {
    branches: Vec<NnetElement>,
}

impl MergeBranches {
    pub fn new(branches: Vec<NnetElement>) -> Self {
        Self { branches }
    }
}

impl Module for MergeBranches {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut branches = self.branches.iter();
        let mut ret = match branches.next() {
            Some(first) => first.forward(xs)?,
            None => return Ok(xs.clone()),
        };
        for b in branches {
            ret = (ret + b.forward(xs)?)?;
        }
        Ok(ret)
    }
}

/// A stack of elements with an optional residual connection
/// `h = f(x) + x`
pub struct NeuralNetworkBlock {
    structure: StackLayers<NnetElement>,
    residual: bool,
}

impl NeuralNetworkBlock {
    pub fn new(structure: StackLayers<NnetElement>, residual: bool) -> Self {
        Self {
            structure,
            residual,
        }
    }
}

impl Module for NeuralNetworkBlock {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let h = self.structure.forward(xs)?;
        if self.residual {
            h + xs
        } else {
            Ok(h)
        }
    }
}

/// A sequence of blocks
#[derive(Default)]
pub struct NeuralNetwork {
    blocks: Vec<NeuralNetworkBlock>,
}

impl NeuralNetwork {
    pub fn new(blocks: Vec<NeuralNetworkBlock>) -> Self {
        Self { blocks }
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }
}

impl Module for NeuralNetwork {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut h = xs.clone();
        for block in self.blocks.iter() {
            h = block.forward(&h)?;
        }
        Ok(h)
    }
}
