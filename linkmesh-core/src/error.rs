//! Engine-level error type.

use crate::config::ConfigError;
use crate::crypto::CryptoError;
use crate::peer_table::PeerTableError;
use crate::request_log::RequestLogError;
use crate::wire::{FrameDecodeError, FrameEncodeError};

#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    #[error("message needs more fragments than allowed")]
    FrameTooLarge,
    #[error("no peer slot available")]
    NoPeerSlot,
    #[error("no encrypted connection with that peer")]
    NotConnected,
    #[error("session duration must be non-zero")]
    InvalidDuration,
    #[error("config: {0}")]
    Config(#[from] ConfigError),
    #[error("encode: {0}")]
    Encode(#[from] FrameEncodeError),
    #[error("decode: {0}")]
    Decode(#[from] FrameDecodeError),
    #[error("crypto: {0}")]
    Crypto(#[from] CryptoError),
    #[error("peer table: {0}")]
    PeerTable(#[from] PeerTableError),
    #[error("request log: {0}")]
    RequestLog(#[from] RequestLogError),
    #[error("handshake encoding: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("saved connection: {0}")]
    Serialization(#[from] serde_json::Error),
}
