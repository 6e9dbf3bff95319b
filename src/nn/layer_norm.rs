//! Layer Normalization module.

use crate::nn::Module;
use crate::tensor::Tensor;

pub struct LayerNorm {
    gamma: Tensor,
    beta: Tensor,
    epsilon: f32,
}

impl LayerNorm {
    /// Normalizes over a trailing feature dimension of size `dim`.
    pub fn new(dim: usize) -> Self {
        Self {
            gamma: Tensor::ones(vec![dim]),
            beta: Tensor::zeros(vec![dim]),
            epsilon: 1e-5,
        }
    }
}

impl Module for LayerNorm {
    fn forward(&self, input: &Tensor) -> Tensor {
        let axis = input.shape().len() - 1;

        let mean = input.mean_axis(axis, true);
        let variance = input.var_axis(axis, true);
        let normalized = (input - &mean) / &((&variance + self.epsilon).sqrt());

        &(&self.gamma * &normalized) + &self.beta
    }

    fn parameters(&self) -> Vec<Tensor> {
        vec![self.gamma.clone(), self.beta.clone()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn output_rows_are_standardized() {
        let norm = LayerNorm::new(4);
        let x = Tensor::new(vec![1.0, 2.0, 3.0, 4.0, -5.0, 0.0, 5.0, 10.0], vec![2, 4]);
        let y = norm.forward(&x);
        for row in y.data().rows() {
            assert_abs_diff_eq!(row.sum(), 0.0, epsilon = 1e-4);
            let var = row.iter().map(|v| v * v).sum::<f32>() / 4.0;
            assert_abs_diff_eq!(var, 1.0, epsilon = 1e-3);
        }
    }
}
