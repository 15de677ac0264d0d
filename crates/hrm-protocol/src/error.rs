use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Unknown method: {0}")]
    UnknownMethod(String),

    #[error("Frame of {size} bytes exceeds limit of {limit}")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("Hierarchy level {level} out of range (height {height})")]
    LevelOutOfRange { level: i32, height: u8 },

    #[error("Address digit {value} does not fit into {bits} bits")]
    AddressOverflow { value: u64, bits: u32 },
}
