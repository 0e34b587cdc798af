//! Adam optimizer over plain matrices.
//!
//! θ_t = θ_{t-1} - lr · m̂_t / (√v̂_t + ε), bias-corrected moments.

use ndarray::Array2;

use crate::error::{Result, XaiError};

/// Adam with the usual defaults (β₁ = 0.9, β₂ = 0.999, ε = 1e-8).
pub struct Adam {
    lr: f64,
    beta1: f64,
    beta2: f64,
    epsilon: f64,
    t: i32,
    m: Vec<Array2<f64>>,
    v: Vec<Array2<f64>>,
}

impl Adam {
    pub fn new(lr: f64, beta1: f64, beta2: f64, epsilon: f64) -> Self {
        Self {
            lr,
            beta1,
            beta2,
            epsilon,
            t: 0,
            m: Vec::new(),
            v: Vec::new(),
        }
    }

    pub fn default_params(lr: f64) -> Self {
        Self::new(lr, 0.9, 0.999, 1e-8)
    }

    pub fn step_count(&self) -> i32 {
        self.t
    }

    /// Apply one update to `params` given matching `grads`.
    pub fn step(&mut self, params: &mut [Array2<f64>], grads: &[Array2<f64>]) -> Result<()> {
        if params.len() != grads.len() {
            return Err(XaiError::shape(format!(
                "adam got {} params and {} grads",
                params.len(),
                grads.len()
            )));
        }
        if self.m.is_empty() {
            self.m = params.iter().map(|p| Array2::zeros(p.dim())).collect();
            self.v = params.iter().map(|p| Array2::zeros(p.dim())).collect();
        }
        self.t += 1;
        let bias1 = 1.0 - self.beta1.powi(self.t);
        let bias2 = 1.0 - self.beta2.powi(self.t);

        for (i, (param, grad)) in params.iter_mut().zip(grads).enumerate() {
            if param.dim() != grad.dim() || self.m[i].dim() != grad.dim() {
                return Err(XaiError::shape(format!(
                    "adam param {i} has shape {:?}, grad {:?}",
                    param.dim(),
                    grad.dim()
                )));
            }
            let (b1, b2) = (self.beta1, self.beta2);
            self.m[i].zip_mut_with(grad, |m, &g| *m = b1 * *m + (1.0 - b1) * g);
            self.v[i].zip_mut_with(grad, |v, &g| *v = b2 * *v + (1.0 - b2) * g * g);

            let (lr, eps) = (self.lr, self.epsilon);
            ndarray::Zip::from(param)
                .and(&self.m[i])
                .and(&self.v[i])
                .for_each(|p, &m, &v| {
                    let m_hat = m / bias1;
                    let v_hat = v / bias2;
                    *p -= lr * m_hat / (v_hat.sqrt() + eps);
                });
        }
        Ok(())
    }
}
