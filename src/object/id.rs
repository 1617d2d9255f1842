use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a shared resource referenced by instructions.
///
/// Either a location-transparent (`Remote`) value or a process-local (`Local`)
/// value. Two ids are equal only when both the variant and the value match, so
/// `Remote(7)` and `Local(7)` name different objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicalObjectId {
    Remote(u64),
    Local(u64),
}

impl LogicalObjectId {
    pub const fn remote(value: u64) -> Self {
        LogicalObjectId::Remote(value)
    }

    pub const fn local(value: u64) -> Self {
        LogicalObjectId::Local(value)
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, LogicalObjectId::Remote(_))
    }

    pub fn is_local(&self) -> bool {
        matches!(self, LogicalObjectId::Local(_))
    }

    /// Raw value of whichever variant is active.
    pub fn value(&self) -> u64 {
        match self {
            LogicalObjectId::Remote(value) | LogicalObjectId::Local(value) => *value,
        }
    }
}

impl fmt::Display for LogicalObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogicalObjectId::Remote(value) => write!(f, "remote:{value:#x}"),
            LogicalObjectId::Local(value) => write!(f, "local:{value:#x}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn equality_requires_matching_variant() {
        assert_eq!(LogicalObjectId::local(3), LogicalObjectId::Local(3));
        assert_ne!(LogicalObjectId::local(3), LogicalObjectId::remote(3));
        let ids: HashSet<_> = [LogicalObjectId::local(3), LogicalObjectId::remote(3)]
            .into_iter()
            .collect();
        assert_eq!(ids.len(), 2);
    }

    #[test]
    fn display_names_variant() {
        assert_eq!(LogicalObjectId::remote(255).to_string(), "remote:0xff");
        assert_eq!(LogicalObjectId::local(1).to_string(), "local:0x1");
        assert_eq!(LogicalObjectId::remote(9).value(), 9);
        assert!(LogicalObjectId::local(9).is_local());
    }

    #[test]
    fn serializes_as_tagged_value() {
        let json = serde_json::to_string(&LogicalObjectId::local(4)).expect("serialize");
        assert_eq!(json, r#"{"local":4}"#);
        let back: LogicalObjectId = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, LogicalObjectId::local(4));
    }
}
