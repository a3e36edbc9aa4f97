use burn::module::Module;
use burn::nn::{Linear, LinearConfig};
use burn::tensor::Tensor;
use burn::tensor::activation::relu;
use burn::tensor::backend::Backend;

pub const DEFAULT_HIDDEN: usize = 128;
pub const DEFAULT_DEPTH: usize = 2;

/// Policy network mapping flattened image features to one selection logit per
/// spatial window. Consumed as a black-box differentiable function by the
/// training loop; evaluation uses its inference view.
#[derive(Module, Debug)]
pub struct PatchAgent<B: Backend> {
    stack: Vec<Linear<B>>,
    output: Linear<B>,
}

impl<B> PatchAgent<B>
where
    B: Backend,
    B::Device: Default,
{
    pub fn new(feature_dim: usize, hidden: usize, depth: usize, num_windows: usize) -> Self {
        assert!(depth > 0, "stack depth must be positive");
        assert!(num_windows > 0, "window count must be positive");
        let device = B::Device::default();
        let mut stack = Vec::with_capacity(depth);
        let mut input_size = feature_dim;
        for _ in 0..depth {
            stack.push(LinearConfig::new(input_size, hidden).init(&device));
            input_size = hidden;
        }
        let output = LinearConfig::new(input_size, num_windows).init(&device);
        Self { stack, output }
    }

    /// Raw per-window scores of shape (batch, num_windows).
    pub fn forward(&self, input: Tensor<B, 2>) -> Tensor<B, 2> {
        let mut activations = input;
        for layer in &self.stack {
            activations = relu(layer.forward(activations));
        }
        self.output.forward(activations)
    }

    pub fn num_windows(&self) -> usize {
        self.output.weight.val().shape().dims[1]
    }

    pub fn feature_dim(&self) -> usize {
        self.stack[0].weight.val().shape().dims[0]
    }

    pub fn hidden(&self) -> usize {
        self.stack[0].weight.val().shape().dims[1]
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }
}
