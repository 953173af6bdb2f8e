//! Error taxonomy for the session. Initialization failures are the only
//! kind that ever leave a worker and reach a caller directly; everything
//! transient/fatal-in-flight is logged and folded into `Stats` or a forced
//! disconnect instead.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to bind UDP socket: {0}")]
    SocketBind(#[source] std::io::Error),

    #[error("failed to resolve server address {0:?}")]
    AddressResolution(String),

    #[error("failed to send registration packet: {0}")]
    Registration(#[source] std::io::Error),

    #[error("failed to create Opus encoder: {0}")]
    EncoderInit(#[source] opus::Error),

    #[error("no default input audio device")]
    NoInputDevice,

    #[error("no default output audio device")]
    NoOutputDevice,

    #[error("failed to query audio device config: {0}")]
    DeviceConfig(#[source] cpal::DefaultStreamConfigError),

    #[error("failed to build audio stream: {0}")]
    BuildStream(#[source] cpal::BuildStreamError),

    #[error("failed to start audio stream: {0}")]
    PlayStream(#[source] cpal::PlayStreamError),

    #[error("unsupported input sample format: {0:?}")]
    UnsupportedSampleFormat(cpal::SampleFormat),

    #[error("session is already connected")]
    AlreadyConnected,
}

pub type Result<T> = std::result::Result<T, SessionError>;
