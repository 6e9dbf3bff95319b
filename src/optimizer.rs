//! Optimizers for updating model parameters.

use crate::tensor::Tensor;
use ndarray::ArrayD;
use tracing::info;

/// A trait for optimizers.
pub trait Optimizer {
    /// Clears the gradients of all parameters managed by the optimizer.
    fn zero_grad(&mut self);
    /// Updates the parameters based on their gradients.
    fn step(&mut self);
}

/// Rescales `grad` so its L2 norm is at most `max_norm`.
fn clip_grad(grad: &ArrayD<f32>, max_norm: Option<f32>) -> Option<ArrayD<f32>> {
    let max_norm = max_norm?;
    let norm = grad.iter().map(|&x| x * x).sum::<f32>().sqrt();
    (norm > max_norm).then(|| grad.mapv(|g| g * max_norm / norm))
}

/// Stochastic Gradient Descent with optional per-parameter gradient-norm clipping.
pub struct SGD {
    params: Vec<Tensor>,
    lr: f32,
    clip_norm: Option<f32>,
}

impl SGD {
    pub fn new(params: Vec<Tensor>, lr: f32) -> Self {
        info!(learning_rate = lr, "initializing SGD optimizer");
        Self {
            params,
            lr,
            clip_norm: None,
        }
    }

    pub fn with_clip_norm(mut self, clip_norm: f32) -> Self {
        self.clip_norm = Some(clip_norm);
        self
    }
}

impl Optimizer for SGD {
    fn zero_grad(&mut self) {
        for p in &self.params {
            p.zero_grad();
        }
    }

    fn step(&mut self) {
        for p in &self.params {
            if let Some(grad) = p.grad() {
                let clipped = clip_grad(&grad.data(), self.clip_norm);
                if let Some(clipped) = clipped {
                    p.set_grad(Tensor::from_data(clipped));
                }
            }
            p.update(self.lr);
        }
    }
}

/// Adam (Kingma & Ba) with bias correction.
pub struct Adam {
    params: Vec<Tensor>,
    lr: f32,
    beta1: f32,
    beta2: f32,
    eps: f32,
    clip_norm: Option<f32>,
    step_count: i32,
    m: Vec<ArrayD<f32>>,
    v: Vec<ArrayD<f32>>,
}

impl Adam {
    pub fn new(params: Vec<Tensor>, lr: f32) -> Self {
        info!(learning_rate = lr, "initializing Adam optimizer");
        let m: Vec<_> = params.iter().map(|p| ArrayD::zeros(p.shape())).collect();
        let v = m.clone();
        Self {
            params,
            lr,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            clip_norm: None,
            step_count: 0,
            m,
            v,
        }
    }

    pub fn with_clip_norm(mut self, clip_norm: f32) -> Self {
        self.clip_norm = Some(clip_norm);
        self
    }
}

impl Optimizer for Adam {
    fn zero_grad(&mut self) {
        for p in &self.params {
            p.zero_grad();
        }
    }

    fn step(&mut self) {
        self.step_count += 1;
        let bias1 = 1.0 - self.beta1.powi(self.step_count);
        let bias2 = 1.0 - self.beta2.powi(self.step_count);

        for ((p, m), v) in self.params.iter().zip(&mut self.m).zip(&mut self.v) {
            let Some(grad) = p.grad() else { continue };
            let grad = {
                let data = grad.data();
                clip_grad(&data, self.clip_norm).unwrap_or_else(|| data.clone())
            };

            m.zip_mut_with(&grad, |m, &g| *m = self.beta1 * *m + (1.0 - self.beta1) * g);
            v.zip_mut_with(&grad, |v, &g| *v = self.beta2 * *v + (1.0 - self.beta2) * g * g);

            let mut updated = p.data().clone();
            ndarray::Zip::from(&mut updated)
                .and(&*m)
                .and(&*v)
                .for_each(|w, &m, &v| {
                    *w -= self.lr * (m / bias1) / ((v / bias2).sqrt() + self.eps);
                });
            p.set_data(updated);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quadratic_step(optimizer: &mut dyn Optimizer, x: &Tensor) -> f32 {
        optimizer.zero_grad();
        let loss = x.square().sum();
        let value = loss.item();
        loss.backward();
        optimizer.step();
        value
    }

    #[test]
    fn sgd_descends_a_quadratic() {
        let x = Tensor::new(vec![0.5, -0.5], vec![2]);
        let mut sgd = SGD::new(vec![x.clone()], 0.1);
        let first = quadratic_step(&mut sgd, &x);
        let second = quadratic_step(&mut sgd, &x);
        assert!(second < first);
    }

    #[test]
    fn sgd_clips_large_gradients() {
        let x = Tensor::new(vec![100.0], vec![1]);
        let mut sgd = SGD::new(vec![x.clone()], 1.0).with_clip_norm(1.0);
        quadratic_step(&mut sgd, &x);
        assert!((x.item() - 99.0).abs() < 1e-4);
    }

    #[test]
    fn adam_first_step_moves_by_learning_rate() {
        let x = Tensor::new(vec![3.0, -2.0], vec![2]);
        let mut adam = Adam::new(vec![x.clone()], 0.01);
        quadratic_step(&mut adam, &x);
        let data = x.data();
        assert!((data[0] - 2.99).abs() < 1e-4);
        assert!((data[1] + 1.99).abs() < 1e-4);
    }

    #[test]
    fn adam_skips_parameters_without_gradients() {
        let used = Tensor::new(vec![1.0], vec![1]);
        let unused = Tensor::new(vec![1.0], vec![1]);
        let mut adam = Adam::new(vec![used.clone(), unused.clone()], 0.1);
        quadratic_step(&mut adam, &used);
        assert_eq!(unused.item(), 1.0);
        assert!(used.item() < 1.0);
    }
}
