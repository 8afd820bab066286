//! LinkMesh protocol core: request/response messaging over link-layer datagrams,
//! with encrypted pairwise sessions.
//! Host-driven: no I/O; host supplies the radio, the clock and received frames.

pub mod protocol;
pub mod time;
pub mod wire;

pub use protocol::{FrameType, HandshakeMessage, MacAddr, MessageId, BROADCAST_MAC, PROTOCOL_VERSION};
pub use time::Millis;
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
pub use config::{ConfigError, MeshConfig};
pub use error::MeshError;
pub use radio::{NetworkInfo, Radio, RadioError, SendResult};
pub use crate::core::{
    mesh_name_filter, Callbacks, ConnectionInfo, HandshakeStatus, MeshCore, MeshEvent,
    MessageContext, Recipients, RemovalOutcome, RemovalReason, TransmissionOptions,
    TransmissionOutcome, TransmissionStatus,
};
pub use handshake::{ConnectionState, HandshakeFailure, SessionKeys};
pub use session::SerializedConnection;

pub mod ap;
pub mod assembler;
pub mod config;
pub mod crypto;
pub mod error;
pub mod handshake;
pub mod peer_table;
pub mod radio;
pub mod request_log;
pub mod response_queue;
pub mod send_queue;
pub mod session;
pub mod stats;
pub mod core;
