use serde::{Deserialize, Serialize};

/// Points back at the coordination-store node an event or result was read
/// from, plus the version it was read at.
///
/// Acking an event means deleting this path at this version; a version
/// mismatch means someone else already acked (or replaced) it, which is
/// treated as "already acked", not an error (spec §7, `NoNodeError`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckRef {
    pub path: String,
    pub version: i64,
}

impl AckRef {
    pub fn new(path: impl Into<String>, version: i64) -> Self {
        Self {
            path: path.into(),
            version,
        }
    }
}
