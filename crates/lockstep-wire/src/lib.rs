//! Wire formats.
//!
//! Everything that crosses a node boundary is encoded here, with
//! deterministic fixed-width layouts:
//!
//! - [`codec`] — the write-set serialization (little-endian, length-prefixed
//!   variable fields). `decode(encode(ws)) == ws` for every valid write-set.
//! - [`frame`] — transport framing: a 4-byte big-endian length followed by
//!   that many payload bytes.
//! - [`action`] — the header the group-communication layer prepends to every
//!   totally-ordered action. Opaque to the engine except for the action type.
//! - [`component`] — membership (component) messages: primary flag, own
//!   index, and the member id table.

pub mod action;
pub mod codec;
pub mod component;
pub mod frame;

pub use action::{ActionHeader, ActionKind, ACTION_HEADER_SIZE, PROTO_VERSION};
pub use codec::{decode_write_set, encode_write_set, DEFAULT_MAX_WRITE_SET};
pub use component::{ComponentMsg, MEMBER_ID_BYTES, MEMBER_ID_MAX_LEN};
pub use frame::{read_frame, write_frame, FRAME_HEADER_SIZE};
