use thiserror::Error;

#[derive(Error, Debug)]
pub enum MediaError {
    #[error("Malformed RTP payload: {0}")]
    Depacketize(String),

    #[error("Decoder error: {0}")]
    Decode(String),

    #[error("No video decoder available: {0}")]
    DecoderUnavailable(String),

    #[error("JPEG encoding failed: {0}")]
    Encode(#[from] image::ImageError),

    #[error("Frame buffer is {actual} bytes, expected {expected}")]
    FrameSize { expected: usize, actual: usize },
}
