use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// A stored record failed to parse. Fatal for the cluster: the ledger
    /// never silently discards a stored record.
    #[error("corrupt ledger record `{id}` in column `{column}`: {detail}; payload head: {payload_head:?}")]
    Corrupt {
        id: String,
        column: String,
        detail: String,
        payload_head: String,
    },

    #[error("could not acquire lock `{path}` within {waited_ms} ms")]
    LockTimeout { path: PathBuf, waited_ms: u64 },

    #[error("cluster `{0}` not found in index")]
    UnknownCluster(String),
}

pub type LedgerResult<T> = Result<T, LedgerError>;

/// The diagnostic head of an unparseable payload: its first 200 bytes,
/// lossily decoded.
pub fn payload_head(raw: &str) -> String {
    let mut end = raw.len().min(200);
    while end > 0 && !raw.is_char_boundary(end) {
        end -= 1;
    }
    raw[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_head_caps_at_200_bytes() {
        let long = "x".repeat(500);
        assert_eq!(payload_head(&long).len(), 200);
        assert_eq!(payload_head("short"), "short");
    }

    #[test]
    fn payload_head_respects_char_boundaries() {
        let s = "é".repeat(150);
        let head = payload_head(&s);
        assert!(head.len() <= 200);
        assert!(s.starts_with(&head));
    }
}
