//! Trainer configuration.

use crate::options::Options;
use candle::Device;

#[derive(Clone, Debug)]
pub struct TrainerConfig {
    pub max_epochs: usize,
    pub device: Device,
    pub log_every_n_steps: usize,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            max_epochs: 200,
            device: Device::Cpu,
            log_every_n_steps: 100,
        }
    }
}

impl TrainerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Epoch budget and logging cadence taken from run options.
    ///
    /// A run trains for `n_epochs + n_epochs_decay` epochs, minus the epochs
    /// already done when resuming at `epoch_count > 1`.
    pub fn from_options(options: &Options, device: Device) -> Self {
        let total = options.n_epochs + options.n_epochs_decay;
        let done = options.epoch_count.saturating_sub(1);
        Self {
            max_epochs: total.saturating_sub(done),
            device,
            log_every_n_steps: options.print_freq,
        }
    }

    pub fn max_epochs(mut self, epochs: usize) -> Self {
        self.max_epochs = epochs;
        self
    }

    pub fn device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn log_every_n_steps(mut self, n: usize) -> Self {
        self.log_every_n_steps = n;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_options_counts_decay_epochs() {
        let options = Options {
            n_epochs: 10,
            n_epochs_decay: 5,
            print_freq: 7,
            ..Options::default()
        };
        let config = TrainerConfig::from_options(&options, Device::Cpu);
        assert_eq!(config.max_epochs, 15);
        assert_eq!(config.log_every_n_steps, 7);
    }

    #[test]
    fn from_options_skips_completed_epochs_on_resume() {
        let options = Options {
            n_epochs: 10,
            n_epochs_decay: 10,
            epoch_count: 6,
            ..Options::default()
        };
        let config = TrainerConfig::from_options(&options, Device::Cpu);
        assert_eq!(config.max_epochs, 15);
    }
}
