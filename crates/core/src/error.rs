/// Result alias that carries the custom [`VisualiserError`] type.
pub type Result<T> = std::result::Result<T, VisualiserError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum VisualiserError {
    /// Playback or capture was requested before an audio file was supplied.
    #[error("no audio source has been loaded")]
    MissingAudioSource,
    /// The audio graph (transport, taps, output device) could not be built.
    #[error("audio engine failed to initialise: {0}")]
    EngineInit(String),
    /// The platform refused to start playback. Usually resolved by user action
    /// such as selecting an output device or granting access.
    #[error("playback was blocked: {0}. Interact with the player and try again")]
    PlaybackBlocked(String),
    /// Export was attempted before the engine, surface or encoder was ready.
    #[error("capture is not ready: {0}")]
    CaptureNotReady(String),
    /// The encoder process or sink failed mid-session.
    #[error("encoder failure: {0}")]
    Encoder(String),
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("{0}")]
    Message(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Image(#[from] image::ImageError),
    #[error(transparent)]
    Wav(#[from] hound::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Fft(#[from] realfft::FftError),
}

impl VisualiserError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    /// Whether the error leaves the session usable, i.e. the caller may retry
    /// after supplying the missing piece.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::MissingAudioSource | Self::PlaybackBlocked(_) | Self::CaptureNotReady(_)
        )
    }
}

impl From<&str> for VisualiserError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for VisualiserError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}
