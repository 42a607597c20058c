//! Error types for img2img-light.
//!
//! The training loop, callbacks and [`LightModule`](crate::LightModule) speak
//! `candle::Result`, like the rest of the candle ecosystem. Everything that
//! touches the filesystem or user configuration (options, datasets, image
//! export, checkpoints) returns this crate's [`Result`]. An [`Error`] converts
//! into a `candle::Error` with [`Error::into_candle`] where the two meet.

use thiserror::Error;

/// Result type alias for img2img-light operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur outside of tensor math.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Invalid or inconsistent options.
    #[error("configuration error: {0}")]
    Config(String),

    /// Dataset discovery or decoding problem.
    #[error("dataset error: {0}")]
    Dataset(String),

    /// Saving or restoring weights failed.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Image decode/encode error.
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    /// Options file could not be parsed.
    #[error("invalid options file: {0}")]
    Json(#[from] serde_json::Error),

    /// Candle error.
    #[error("candle error: {0}")]
    Candle(#[from] candle::Error),
}

impl Error {
    /// Converts into a `candle::Error`, unwrapping errors that came from candle.
    pub fn into_candle(self) -> candle::Error {
        match self {
            Error::Candle(err) => err,
            other => candle::Error::wrap(other),
        }
    }
}
