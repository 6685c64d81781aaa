//! Identity of an object observed in a bucket listing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// An object as seen by the poller.
///
/// Dedup identity is the `(bucket, key, etag)` triple: the same key with a
/// new etag is a new object and gets delivered again.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ObjectIdentity {
    pub bucket: String,
    pub key: String,

    /// Content fingerprint exactly as reported by the storage endpoint
    /// (S3 etags usually carry surrounding quotes).
    pub etag: String,

    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

impl ObjectIdentity {
    /// Last path segment of the key, used for staging and captions.
    pub fn file_name(&self) -> &str {
        self.key
            .rsplit('/')
            .find(|segment| !segment.is_empty())
            .unwrap_or(&self.key)
    }
}

impl fmt::Display for ObjectIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(key: &str) -> ObjectIdentity {
        ObjectIdentity {
            bucket: "b1".into(),
            key: key.into(),
            etag: "\"abc123\"".into(),
            size: 1,
            last_modified: Utc::now(),
        }
    }

    #[test]
    fn file_name_is_last_key_segment() {
        assert_eq!(identity("report.txt").file_name(), "report.txt");
        assert_eq!(identity("2024/05/dump.sql.gz").file_name(), "dump.sql.gz");
        assert_eq!(identity("logs/archive/").file_name(), "archive");
    }
}
