//! Trainable translation models.

pub mod unet;

pub use unet::{l1_loss, UnetModel, LOSS_NAMES, MODEL_NAMES, VISUAL_NAMES};
