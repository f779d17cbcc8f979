//! # memstore-ipc
//!
//! Wire protocol shared by the memstore server and its clients.
//!
//! Every message is `[4-byte little-endian length][payload]`. Payload fields
//! are separated by a single `0x01` byte; see [`protocol`] for the field
//! layout of each request and response.

pub mod frame;
pub mod protocol;

#[cfg(feature = "tokio")]
pub mod client;

pub use frame::{read_frame, read_frame_until, write_frame, MAX_FRAME_LEN};
pub use protocol::{
    OpenFlags, Opcode, ProtocolError, Request, Response, Status, FIELD_SEPARATOR, MAX_NAME_LEN,
};

/// Default server socket path
pub fn default_socket_path() -> &'static str {
    "/tmp/memstore.sock"
}
