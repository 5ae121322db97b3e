//! Component (membership) messages.
//!
//! Delivered with `Primary` / `NonPrimary` actions. Carries the quorum flag,
//! this node's index in the membership, and the member id table. Member ids
//! are at most 39 characters so a human-readable UUID fits, and travel as
//! 40-byte NUL-padded records.

use lockstep_error::{LockstepError, Result};

/// Longest member id, in bytes.
pub const MEMBER_ID_MAX_LEN: usize = 39;

/// On-wire size of one member id record.
pub const MEMBER_ID_BYTES: usize = MEMBER_ID_MAX_LEN + 1;

/// A membership message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentMsg {
    /// True when this component holds a quorum and may accept writes.
    pub primary: bool,
    /// This node's index in `members`, or -1 when it is not a member.
    pub my_index: i32,
    pub members: Vec<String>,
}

impl ComponentMsg {
    /// Build a message, validating member ids.
    ///
    /// # Errors
    ///
    /// `Codec` when a member id is too long or contains a NUL byte.
    pub fn new(primary: bool, my_index: i32, members: Vec<String>) -> Result<Self> {
        for id in &members {
            if id.len() > MEMBER_ID_MAX_LEN {
                return Err(LockstepError::codec(format!(
                    "member id too long: {} bytes (max {MEMBER_ID_MAX_LEN})",
                    id.len()
                )));
            }
            if id.as_bytes().contains(&0) {
                return Err(LockstepError::codec("member id contains NUL"));
            }
        }
        Ok(Self {
            primary,
            my_index,
            members,
        })
    }

    /// Number of members in the component.
    #[must_use]
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// This node's own member id, if it is part of the component.
    #[must_use]
    pub fn self_id(&self) -> Option<&str> {
        usize::try_from(self.my_index)
            .ok()
            .and_then(|idx| self.members.get(idx))
            .map(String::as_str)
    }

    /// Index of a member by id, or `None`.
    #[must_use]
    pub fn member_index(&self, id: &str) -> Option<usize> {
        self.members.iter().position(|m| m == id)
    }

    /// Encode to wire bytes.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(1 + 4 + 4 + self.members.len() * MEMBER_ID_BYTES);
        buf.push(u8::from(self.primary));
        buf.extend_from_slice(&self.my_index.to_be_bytes());
        let count = i32::try_from(self.members.len()).expect("member count fits i32");
        buf.extend_from_slice(&count.to_be_bytes());
        for id in &self.members {
            let mut record = [0u8; MEMBER_ID_BYTES];
            record[..id.len()].copy_from_slice(id.as_bytes());
            buf.extend_from_slice(&record);
        }
        buf
    }

    /// Decode from wire bytes.
    ///
    /// # Errors
    ///
    /// `Codec` on truncation, a bad primary flag, a negative member count,
    /// or a member id that is not UTF-8.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < 9 {
            return Err(LockstepError::codec(format!(
                "component message truncated: {} bytes",
                buf.len()
            )));
        }
        let primary = match buf[0] {
            0 => false,
            1 => true,
            other => {
                return Err(LockstepError::codec(format!(
                    "bad primary flag: {other}"
                )))
            }
        };
        let my_index = i32::from_be_bytes(buf[1..5].try_into().expect("4 bytes"));
        let count = i32::from_be_bytes(buf[5..9].try_into().expect("4 bytes"));
        let count = usize::try_from(count)
            .map_err(|_| LockstepError::codec(format!("negative member count: {count}")))?;

        let expected = 9 + count * MEMBER_ID_BYTES;
        if buf.len() != expected {
            return Err(LockstepError::codec(format!(
                "component message size mismatch: {} bytes, expected {expected}",
                buf.len()
            )));
        }

        let mut members = Vec::with_capacity(count);
        for i in 0..count {
            let record = &buf[9 + i * MEMBER_ID_BYTES..9 + (i + 1) * MEMBER_ID_BYTES];
            let end = record.iter().position(|&b| b == 0).unwrap_or(MEMBER_ID_BYTES);
            if end > MEMBER_ID_MAX_LEN {
                return Err(LockstepError::codec("member id record missing NUL pad"));
            }
            let id = std::str::from_utf8(&record[..end])
                .map_err(|_| LockstepError::codec(format!("member id {i} is not UTF-8")))?;
            members.push(id.to_owned());
        }

        Ok(Self {
            primary,
            my_index,
            members,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_round_trip() {
        let msg = ComponentMsg::new(
            true,
            1,
            vec!["node-a".to_owned(), "node-b".to_owned(), "node-c".to_owned()],
        )
        .unwrap();
        let bytes = msg.to_bytes();
        assert_eq!(bytes.len(), 9 + 3 * MEMBER_ID_BYTES);
        assert_eq!(ComponentMsg::from_bytes(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_self_and_lookup() {
        let msg =
            ComponentMsg::new(false, 0, vec!["n0".to_owned(), "n1".to_owned()]).unwrap();
        assert_eq!(msg.self_id(), Some("n0"));
        assert_eq!(msg.member_index("n1"), Some(1));
        assert_eq!(msg.member_index("n9"), None);
        assert_eq!(msg.member_count(), 2);

        let outsider = ComponentMsg::new(false, -1, vec!["n0".to_owned()]).unwrap();
        assert_eq!(outsider.self_id(), None);
    }

    #[test]
    fn test_member_id_length_limit() {
        let long = "x".repeat(MEMBER_ID_MAX_LEN);
        assert!(ComponentMsg::new(true, 0, vec![long.clone()]).is_ok());
        let too_long = "x".repeat(MEMBER_ID_MAX_LEN + 1);
        assert!(ComponentMsg::new(true, 0, vec![too_long]).is_err());
    }

    #[test]
    fn test_empty_component() {
        let msg = ComponentMsg::new(false, -1, vec![]).unwrap();
        let bytes = msg.to_bytes();
        assert_eq!(bytes.len(), 9);
        assert_eq!(ComponentMsg::from_bytes(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_size_mismatch_rejected() {
        let msg = ComponentMsg::new(true, 0, vec!["n0".to_owned()]).unwrap();
        let mut bytes = msg.to_bytes();
        bytes.pop();
        assert!(ComponentMsg::from_bytes(&bytes).is_err());
        bytes.extend_from_slice(&[0, 0]);
        assert!(ComponentMsg::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_bad_primary_flag_rejected() {
        let msg = ComponentMsg::new(true, 0, vec![]).unwrap();
        let mut bytes = msg.to_bytes();
        bytes[0] = 7;
        assert!(ComponentMsg::from_bytes(&bytes).is_err());
    }
}
