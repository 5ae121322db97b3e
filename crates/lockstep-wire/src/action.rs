//! Action headers.
//!
//! The group-communication layer prepends this header to every
//! totally-ordered action it delivers. The engine treats the header as
//! opaque except for the action type; the fragment fields exist so a large
//! action can span several transport messages.

use lockstep_error::{LockstepError, Result};
use lockstep_types::Seqno;

/// Protocol version this implementation speaks.
pub const PROTO_VERSION: u8 = 0;

/// Encoded size of an [`ActionHeader`].
pub const ACTION_HEADER_SIZE: usize = 1 + 1 + 4 + 4 + 4 + 8;

/// Kind of a totally-ordered action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ActionKind {
    /// A replicated write-set.
    Data = 1,
    /// Membership change into a primary component.
    Primary = 2,
    /// Membership change into a non-primary component.
    NonPrimary = 3,
    /// Snapshot marker.
    Snapshot = 4,
}

impl ActionKind {
    /// Wire code for this kind.
    #[must_use]
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Decode a wire code.
    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Data),
            2 => Some(Self::Primary),
            3 => Some(Self::NonPrimary),
            4 => Some(Self::Snapshot),
            _ => None,
        }
    }

    /// Whether this action carries a membership (component) message.
    #[must_use]
    pub const fn is_component(self) -> bool {
        matches!(self, Self::Primary | Self::NonPrimary)
    }
}

/// Per-action header, big-endian fixed-width fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionHeader {
    pub proto_ver: u8,
    pub kind: ActionKind,
    /// Index of this fragment within the action, starting at zero.
    pub frag_no: u32,
    /// Total number of fragments in the action.
    pub frag_count: u32,
    /// Size of the complete (defragmented) action in bytes.
    pub act_size: u32,
    /// Identifier of the action; the global seqno once assigned.
    pub act_id: Seqno,
}

impl ActionHeader {
    /// Header for an unfragmented action.
    #[must_use]
    pub fn whole(kind: ActionKind, act_size: u32, act_id: Seqno) -> Self {
        Self {
            proto_ver: PROTO_VERSION,
            kind,
            frag_no: 0,
            frag_count: 1,
            act_size,
            act_id,
        }
    }

    /// Encode to wire bytes.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; ACTION_HEADER_SIZE] {
        let mut buf = [0u8; ACTION_HEADER_SIZE];
        buf[0] = self.proto_ver;
        buf[1] = self.kind.code();
        buf[2..6].copy_from_slice(&self.frag_no.to_be_bytes());
        buf[6..10].copy_from_slice(&self.frag_count.to_be_bytes());
        buf[10..14].copy_from_slice(&self.act_size.to_be_bytes());
        buf[14..22].copy_from_slice(&self.act_id.to_be_bytes());
        buf
    }

    /// Decode from wire bytes.
    ///
    /// # Errors
    ///
    /// `Codec` on short input, unsupported protocol version, or unknown
    /// action type.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < ACTION_HEADER_SIZE {
            return Err(LockstepError::codec(format!(
                "action header truncated: {} bytes",
                buf.len()
            )));
        }
        let proto_ver = buf[0];
        if proto_ver != PROTO_VERSION {
            return Err(LockstepError::codec(format!(
                "unsupported action protocol version: {proto_ver}"
            )));
        }
        let kind = ActionKind::from_code(buf[1])
            .ok_or_else(|| LockstepError::codec(format!("unknown action type: {}", buf[1])))?;
        Ok(Self {
            proto_ver,
            kind,
            frag_no: u32::from_be_bytes(buf[2..6].try_into().expect("4 bytes")),
            frag_count: u32::from_be_bytes(buf[6..10].try_into().expect("4 bytes")),
            act_size: u32::from_be_bytes(buf[10..14].try_into().expect("4 bytes")),
            act_id: u64::from_be_bytes(buf[14..22].try_into().expect("8 bytes")),
        })
    }
}
