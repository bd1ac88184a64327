//! Optimizers for training
//!
//! AdamW over the trainable variables, global-norm gradient clipping,
//! gradient accumulation and a warmup + cosine learning rate schedule.

use anyhow::Result;
use candle_core::backprop::GradStore;
use candle_core::Var;
use candle_nn::optim::{Optimizer, ParamsAdamW};
use candle_nn::VarMap;
use serde::{Deserialize, Serialize};

/// AdamW optimizer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdamWConfig {
    /// Learning rate
    pub lr: f64,
    /// Beta1 (first moment decay)
    pub beta1: f64,
    /// Beta2 (second moment decay)
    pub beta2: f64,
    /// Epsilon for numerical stability
    pub eps: f64,
    /// Weight decay coefficient
    pub weight_decay: f64,
}

impl Default for AdamWConfig {
    fn default() -> Self {
        Self {
            lr: 1e-4,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.01,
        }
    }
}

/// AdamW optimizer wrapper
pub struct AdamW {
    inner: candle_nn::optim::AdamW,
    vars: Vec<Var>,
    config: AdamWConfig,
    step_count: usize,
}

impl AdamW {
    /// Create a new AdamW optimizer over every variable of `var_map`
    pub fn new(var_map: &VarMap, config: AdamWConfig) -> Result<Self> {
        let params = ParamsAdamW {
            lr: config.lr,
            beta1: config.beta1,
            beta2: config.beta2,
            eps: config.eps,
            weight_decay: config.weight_decay,
        };

        let vars = var_map.all_vars();
        let inner = candle_nn::optim::AdamW::new(vars.clone(), params)?;

        Ok(Self {
            inner,
            vars,
            config,
            step_count: 0,
        })
    }

    /// Perform an optimization step
    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        self.inner.step(grads)?;
        self.step_count += 1;
        Ok(())
    }

    /// Clip the global gradient norm to `max_norm`, then step
    ///
    /// Returns the norm before clipping.
    pub fn step_with_clipping(&mut self, grads: &mut GradStore, max_norm: Option<f64>) -> Result<f64> {
        let norm = match max_norm {
            Some(max_norm) => clip_grad_norm(grads, &self.vars, max_norm)?,
            None => compute_grad_norm(grads, &self.vars)?,
        };
        self.step(grads)?;
        Ok(norm)
    }

    /// Trainable variables handled by this optimizer
    pub fn vars(&self) -> &[Var] {
        &self.vars
    }

    /// Get current learning rate
    pub fn learning_rate(&self) -> f64 {
        self.config.lr
    }

    /// Set learning rate
    pub fn set_learning_rate(&mut self, lr: f64) {
        self.config.lr = lr;
        self.inner.set_learning_rate(lr);
    }

    /// Get step count
    pub fn step_count(&self) -> usize {
        self.step_count
    }
}

/// Learning rate scheduler: linear warmup then cosine decay to zero
#[derive(Debug, Clone)]
pub struct LearningRateScheduler {
    base_lr: f64,
    warmup_steps: usize,
    total_steps: usize,
    current_step: usize,
}

impl LearningRateScheduler {
    /// Create a new learning rate scheduler with warmup and cosine decay
    pub fn new(base_lr: f64, warmup_steps: usize, total_steps: usize) -> Self {
        Self {
            base_lr,
            warmup_steps,
            total_steps,
            current_step: 0,
        }
    }

    /// Get the learning rate for the current step
    pub fn get_lr(&self) -> f64 {
        if self.current_step < self.warmup_steps {
            self.base_lr * (self.current_step as f64 / self.warmup_steps as f64)
        } else {
            let decay_steps = self.total_steps.saturating_sub(self.warmup_steps);
            if decay_steps == 0 {
                return self.base_lr;
            }
            let progress = ((self.current_step - self.warmup_steps) as f64 / decay_steps as f64).min(1.0);
            let decay = 0.5 * (1.0 + (std::f64::consts::PI * progress).cos());
            self.base_lr * decay
        }
    }

    /// Step the scheduler and return the new learning rate
    pub fn step(&mut self) -> f64 {
        self.current_step += 1;
        self.get_lr()
    }

    /// Reset the scheduler
    pub fn reset(&mut self) {
        self.current_step = 0;
    }

    /// Get current step
    pub fn current_step(&self) -> usize {
        self.current_step
    }
}

/// Compute the global L2 norm of the gradients of `vars`
pub fn compute_grad_norm(grads: &GradStore, vars: &[Var]) -> Result<f64> {
    let mut total_norm_sq: f64 = 0.0;

    for var in vars {
        if let Some(grad) = grads.get(var.as_tensor()) {
            let grad_norm_sq = grad.sqr()?.sum_all()?.to_dtype(candle_core::DType::F64)?.to_scalar::<f64>()?;
            total_norm_sq += grad_norm_sq;
        }
    }

    Ok(total_norm_sq.sqrt())
}

/// Scale gradients in place so their global norm is at most `max_norm`
///
/// Returns the norm before clipping.
pub fn clip_grad_norm(grads: &mut GradStore, vars: &[Var], max_norm: f64) -> Result<f64> {
    let total_norm = compute_grad_norm(grads, vars)?;

    if total_norm > max_norm {
        let clip_coef = max_norm / (total_norm + 1e-6);
        tracing::debug!(
            "Gradient norm {:.4} > max_norm {:.4}, clipping with coef {:.4}",
            total_norm,
            max_norm,
            clip_coef
        );
        for var in vars {
            if let Some(grad) = grads.get(var.as_tensor()) {
                let clipped = (grad * clip_coef)?;
                grads.insert(var.as_tensor(), clipped);
            }
        }
    }

    Ok(total_norm)
}

/// Sums gradients over several micro-batches
#[derive(Default)]
pub struct GradientAccumulator {
    grads: Option<GradStore>,
    micro_batches: usize,
}

impl GradientAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the gradients of one micro-batch
    pub fn add(&mut self, grads: GradStore, vars: &[Var]) -> Result<()> {
        self.micro_batches += 1;
        let mut acc = match self.grads.take() {
            None => {
                self.grads = Some(grads);
                return Ok(());
            }
            Some(acc) => acc,
        };

        for var in vars {
            if let Some(grad) = grads.get(var.as_tensor()) {
                let sum = match acc.get(var.as_tensor()) {
                    Some(prev) => (prev + grad)?,
                    None => grad.clone(),
                };
                acc.insert(var.as_tensor(), sum);
            }
        }
        self.grads = Some(acc);
        Ok(())
    }

    /// Number of micro-batches added since the last take
    pub fn micro_batches(&self) -> usize {
        self.micro_batches
    }

    /// Take the accumulated gradients, resetting the accumulator
    pub fn take(&mut self) -> Option<GradStore> {
        self.micro_batches = 0;
        self.grads.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Tensor};
    use candle_nn::{Init, VarBuilder};

    fn single_var(values: &[f32]) -> (VarMap, Var) {
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, &Device::Cpu);
        vb.get_with_hints(values.len(), "w", Init::Const(0.0)).unwrap();
        let var = var_map.all_vars().remove(0);
        var.set(&Tensor::new(values, &Device::Cpu).unwrap()).unwrap();
        (var_map, var)
    }

    /// Gradient of sum(w * c) is c
    fn grads_for(var: &Var, coefs: &[f32]) -> GradStore {
        let c = Tensor::new(coefs, &Device::Cpu).unwrap();
        var.as_tensor().mul(&c).unwrap().sum_all().unwrap().backward().unwrap()
    }

    #[test]
    fn test_lr_scheduler_warmup() {
        let mut scheduler = LearningRateScheduler::new(1e-4, 100, 1000);
        assert_eq!(scheduler.get_lr(), 0.0);
        for _ in 0..50 {
            scheduler.step();
        }
        assert!((scheduler.get_lr() - 0.5e-4).abs() < 1e-12);
    }

    #[test]
    fn test_lr_scheduler_decay() {
        let mut scheduler = LearningRateScheduler::new(1e-4, 0, 1000);

        assert!((scheduler.get_lr() - 1e-4).abs() < 1e-10);

        for _ in 0..500 {
            scheduler.step();
        }
        let lr_500 = scheduler.get_lr();
        assert!((lr_500 - 0.5e-4).abs() < 1e-6);

        for _ in 0..500 {
            scheduler.step();
        }
        let lr_1000 = scheduler.get_lr();
        assert!(lr_1000 < 1e-8);

        // past the end stays at zero
        scheduler.step();
        assert!(scheduler.get_lr() < 1e-8);
    }

    #[test]
    fn test_lr_scheduler_without_decay_steps() {
        let mut scheduler = LearningRateScheduler::new(1e-3, 10, 5);
        for _ in 0..20 {
            scheduler.step();
        }
        assert!(scheduler.get_lr().is_finite());
    }

    #[test]
    fn test_clip_grad_norm() {
        let (_var_map, var) = single_var(&[1.0, 1.0]);
        let mut grads = grads_for(&var, &[3.0, 4.0]);
        let vars = vec![var.clone()];

        let norm = clip_grad_norm(&mut grads, &vars, 1.0).unwrap();
        assert!((norm - 5.0).abs() < 1e-5);

        let clipped = compute_grad_norm(&grads, &vars).unwrap();
        assert!((clipped - 1.0).abs() < 1e-4);

        // below the threshold nothing changes
        let norm = clip_grad_norm(&mut grads, &vars, 10.0).unwrap();
        assert!((norm - clipped).abs() < 1e-9);
    }

    #[test]
    fn test_gradient_accumulation_sums() {
        let (_var_map, var) = single_var(&[0.5, -0.5]);
        let vars = vec![var.clone()];

        let mut accumulator = GradientAccumulator::new();
        accumulator.add(grads_for(&var, &[1.0, 2.0]), &vars).unwrap();
        accumulator.add(grads_for(&var, &[0.5, -1.0]), &vars).unwrap();
        assert_eq!(accumulator.micro_batches(), 2);

        let grads = accumulator.take().unwrap();
        let summed = grads.get(var.as_tensor()).unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(summed, vec![1.5, 1.0]);
        assert!(accumulator.take().is_none());
    }

    #[test]
    fn test_adamw_step_moves_params() {
        let (var_map, var) = single_var(&[1.0, 1.0]);
        let mut optimizer = AdamW::new(
            &var_map,
            AdamWConfig {
                lr: 0.1,
                weight_decay: 0.0,
                ..Default::default()
            },
        )
        .unwrap();

        let mut grads = grads_for(&var, &[1.0, -1.0]);
        optimizer.step_with_clipping(&mut grads, Some(1.0)).unwrap();

        let values = var.as_tensor().to_vec1::<f32>().unwrap();
        assert!(values[0] < 1.0);
        assert!(values[1] > 1.0);
        assert_eq!(optimizer.step_count(), 1);
    }
}
