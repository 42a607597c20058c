//! Epoch-level learning rate policies.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::options::Options;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LrPolicy {
    /// Constant for `n_epochs`, then linear decay to zero over `n_epochs_decay`.
    #[default]
    Linear,
    /// Multiply by 0.1 every `lr_decay_iters` epochs.
    Step,
    /// Multiply by 0.2 when the monitored loss stops improving.
    Plateau,
    /// Cosine annealing to zero over `n_epochs`.
    Cosine,
}

impl FromStr for LrPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "linear" => Ok(LrPolicy::Linear),
            "step" => Ok(LrPolicy::Step),
            "plateau" => Ok(LrPolicy::Plateau),
            "cosine" => Ok(LrPolicy::Cosine),
            _ => Err(Error::Config(format!(
                "learning rate policy [{s}] is not implemented"
            ))),
        }
    }
}

const STEP_GAMMA: f64 = 0.1;
const PLATEAU_FACTOR: f64 = 0.2;
const PLATEAU_THRESHOLD: f64 = 0.01;
const PLATEAU_PATIENCE: usize = 5;

/// Computes the learning rate after each finished epoch.
#[derive(Debug, Clone)]
pub struct LrScheduler {
    policy: LrPolicy,
    base_lr: f64,
    epoch_count: usize,
    n_epochs: usize,
    n_epochs_decay: usize,
    lr_decay_iters: usize,
    epochs_done: usize,
    current_lr: f64,
    best: Option<f64>,
    bad_epochs: usize,
}

impl LrScheduler {
    pub fn new(policy: LrPolicy, base_lr: f64) -> Self {
        Self {
            policy,
            base_lr,
            epoch_count: 1,
            n_epochs: 100,
            n_epochs_decay: 100,
            lr_decay_iters: 50,
            epochs_done: 0,
            current_lr: base_lr,
            best: None,
            bad_epochs: 0,
        }
    }

    pub fn from_options(options: &Options) -> Self {
        Self::new(options.lr_policy, options.lr)
            .epoch_count(options.epoch_count)
            .n_epochs(options.n_epochs)
            .n_epochs_decay(options.n_epochs_decay)
            .lr_decay_iters(options.lr_decay_iters)
    }

    pub fn epoch_count(mut self, epoch_count: usize) -> Self {
        self.epoch_count = epoch_count;
        self
    }

    pub fn n_epochs(mut self, n: usize) -> Self {
        self.n_epochs = n;
        self
    }

    pub fn n_epochs_decay(mut self, n: usize) -> Self {
        self.n_epochs_decay = n;
        self
    }

    pub fn lr_decay_iters(mut self, n: usize) -> Self {
        self.lr_decay_iters = n;
        self
    }

    pub fn policy(&self) -> LrPolicy {
        self.policy
    }

    pub fn learning_rate(&self) -> f64 {
        self.current_lr
    }

    /// Advances by one epoch and returns the new learning rate.
    ///
    /// `metric` feeds the plateau policy and is ignored by the others; a
    /// plateau scheduler without a metric keeps its rate.
    pub fn step(&mut self, metric: Option<f32>) -> f64 {
        self.epochs_done += 1;
        let e = self.epochs_done;
        self.current_lr = match self.policy {
            LrPolicy::Linear => {
                let past = (e + self.epoch_count).saturating_sub(self.n_epochs);
                let factor = 1.0 - past as f64 / (self.n_epochs_decay + 1) as f64;
                self.base_lr * factor.max(0.0)
            }
            LrPolicy::Step => {
                let drops = e / self.lr_decay_iters.max(1);
                self.base_lr * STEP_GAMMA.powi(drops as i32)
            }
            LrPolicy::Cosine => {
                let t_max = self.n_epochs.max(1) as f64;
                self.base_lr * (1.0 + (std::f64::consts::PI * e as f64 / t_max).cos()) / 2.0
            }
            LrPolicy::Plateau => match metric {
                Some(value) => self.plateau_step(value as f64),
                None => self.current_lr,
            },
        };
        self.current_lr
    }

    fn plateau_step(&mut self, value: f64) -> f64 {
        let improved = match self.best {
            None => true,
            Some(best) => value < best * (1.0 - PLATEAU_THRESHOLD),
        };
        if improved {
            self.best = Some(value);
            self.bad_epochs = 0;
            return self.current_lr;
        }
        self.bad_epochs += 1;
        if self.bad_epochs > PLATEAU_PATIENCE {
            self.bad_epochs = 0;
            return self.current_lr * PLATEAU_FACTOR;
        }
        self.current_lr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-12
    }

    #[test]
    fn linear_holds_then_decays_to_zero() {
        let mut scheduler = LrScheduler::new(LrPolicy::Linear, 1.0)
            .n_epochs(3)
            .n_epochs_decay(3);
        let lrs: Vec<f64> = (0..6).map(|_| scheduler.step(None)).collect();
        // Rates for epochs 2 to 7: base, base, then 3/4, 2/4, 1/4 and 0.
        assert!(close(lrs[0], 1.0));
        assert!(close(lrs[1], 1.0));
        assert!(close(lrs[2], 0.75));
        assert!(close(lrs[3], 0.5));
        assert!(close(lrs[4], 0.25));
        assert!(close(lrs[5], 0.0));
    }

    #[test]
    fn linear_resumes_from_epoch_count() {
        let mut scheduler = LrScheduler::new(LrPolicy::Linear, 1.0)
            .epoch_count(4)
            .n_epochs(3)
            .n_epochs_decay(3);
        assert!(close(scheduler.step(None), 0.5));
    }

    #[test]
    fn step_divides_by_ten() {
        let mut scheduler = LrScheduler::new(LrPolicy::Step, 1.0).lr_decay_iters(2);
        let lrs: Vec<f64> = (0..4).map(|_| scheduler.step(None)).collect();
        assert!(close(lrs[0], 1.0));
        assert!(close(lrs[1], 0.1));
        assert!(close(lrs[2], 0.1));
        assert!((lrs[3] - 0.01).abs() < 1e-12);
    }

    #[test]
    fn cosine_reaches_zero() {
        let mut scheduler = LrScheduler::new(LrPolicy::Cosine, 2.0).n_epochs(4);
        let lrs: Vec<f64> = (0..4).map(|_| scheduler.step(None)).collect();
        assert!(close(lrs[1], 1.0));
        assert!(lrs[3].abs() < 1e-12);
    }

    #[test]
    fn plateau_cuts_after_patience() {
        let mut scheduler = LrScheduler::new(LrPolicy::Plateau, 1.0);
        assert!(close(scheduler.step(Some(1.0)), 1.0));
        for _ in 0..PLATEAU_PATIENCE {
            assert!(close(scheduler.step(Some(1.0)), 1.0));
        }
        assert!(close(scheduler.step(Some(1.0)), 0.2));
        // A real improvement resets the counter.
        assert!(close(scheduler.step(Some(0.5)), 0.2));
        assert!(close(scheduler.step(None), 0.2));
    }

    #[test]
    fn parse_policy() {
        assert_eq!("plateau".parse::<LrPolicy>().unwrap(), LrPolicy::Plateau);
        assert!("exponential".parse::<LrPolicy>().is_err());
    }
}
