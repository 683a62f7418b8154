//! Typed key/value persistence on a single JSON document.
//!
//! The document is the cross-boot memory of the manager: previous role,
//! error latches, override flags, and the last published reason sets. Read
//! failures of any kind (missing file, corrupt file, missing key, type
//! mismatch) degrade to `None` with a log; only writes fail loudly. The
//! file is owned by one process, so writes are plain read-modify-write.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, warn};

use crate::paths;

/// Keys in the persistent document. Unknown keys written by other versions
/// of the code are preserved across writes.
pub mod key {
    pub const ROLE: &str = "Role";
    pub const PASSIVE_ERROR: &str = "PassiveDueToError";
    pub const ROLE_REASON: &str = "RoleReason";
    pub const DISABLE_RED: &str = "DisableRed";
    pub const NO_RED_DETAILS: &str = "NoRedundancyDetails";
    pub const FAILOVERS_PAUSED_REASONS: &str = "FailoversPausedReasons";
    pub const REDUNDANCY_OFF_AT_RUNTIME: &str = "RedundancyOffAtRuntime";
}

#[derive(Debug, Clone)]
pub struct Store {
    path: PathBuf,
}

impl Default for Store {
    fn default() -> Self {
        Store::new()
    }
}

impl Store {
    pub fn new() -> Self {
        Store {
            path: PathBuf::from(paths::DATA_FILE),
        }
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Store { path: path.into() }
    }

    /// Reads the value stored under `key`, or `None` if the file, the key,
    /// or a parseable value isn't there.
    pub fn read<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let document = read_document(&self.path)?;
        let value = document.get(key)?;
        match serde_json::from_value(value.clone()) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                warn!(key, error = %e, "Stored value has the wrong shape");
                None
            }
        }
    }

    /// Writes `value` under `key`, keeping every other key in the document.
    pub fn write<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let mut document = read_document(&self.path).unwrap_or_default();
        document.insert(
            key.to_string(),
            serde_json::to_value(value).context("serializing value")?,
        );
        self.write_document(&document)
    }

    /// Removes `key` from the document. Removing an absent key is not an
    /// error and does not rewrite the file.
    pub fn remove(&self, key: &str) -> Result<()> {
        let Some(mut document) = read_document(&self.path) else {
            return Ok(());
        };
        if document.remove(key).is_some() {
            self.write_document(&document)?;
        }
        Ok(())
    }

    fn write_document(&self, document: &Map<String, Value>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let text = serde_json::to_string_pretty(&Value::Object(document.clone()))?;
        fs::write(&self.path, text)
            .with_context(|| format!("writing {}", self.path.display()))
    }
}

fn read_document(path: &Path) -> Option<Map<String, Value>> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            error!(file = %path.display(), error = %e, "Failed reading data file");
            return None;
        }
    };

    match serde_json::from_str::<Value>(&text) {
        Ok(Value::Object(map)) => Some(map),
        Ok(_) => {
            error!(file = %path.display(), "Data file is not a JSON object");
            None
        }
        Err(e) => {
            error!(file = %path.display(), error = %e, "Error parsing data file");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Role;
    use std::collections::BTreeMap;

    fn temp_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::with_path(dir.path().join("data.json"));
        (dir, store)
    }

    #[test]
    fn round_trips_every_supported_type() {
        let (_dir, store) = temp_store();

        store.write(key::ROLE, &Role::Active).unwrap();
        store.write("Bool", &true).unwrap();
        store.write("String", &"s".to_string()).unwrap();
        store.write("U32", &0xAABB_CCDDu32).unwrap();

        assert_eq!(store.read::<Role>(key::ROLE), Some(Role::Active));
        assert_eq!(store.read::<bool>("Bool"), Some(true));
        assert_eq!(store.read::<String>("String"), Some("s".to_string()));
        assert_eq!(store.read::<u32>("U32"), Some(0xAABB_CCDD));

        // Overwrites replace the value in place.
        store.write(key::ROLE, &Role::Passive).unwrap();
        store.write("Bool", &false).unwrap();
        store.write("String", &"n".to_string()).unwrap();
        store.write("U32", &0x1234_5678u32).unwrap();

        assert_eq!(store.read::<Role>(key::ROLE), Some(Role::Passive));
        assert_eq!(store.read::<bool>("Bool"), Some(false));
        assert_eq!(store.read::<String>("String"), Some("n".to_string()));
        assert_eq!(store.read::<u32>("U32"), Some(0x1234_5678));

        // Removing one key leaves the rest alone.
        store.remove("String").unwrap();
        assert_eq!(store.read::<String>("String"), None);
        assert_eq!(store.read::<Role>(key::ROLE), Some(Role::Passive));
        assert_eq!(store.read::<bool>("Bool"), Some(false));
        assert_eq!(store.read::<u32>("U32"), Some(0x1234_5678));
    }

    #[test]
    fn reason_map_and_latch_shapes() {
        let (_dir, store) = temp_store();

        let details: BTreeMap<u8, String> =
            [(3u8, "No sibling heartbeat".to_string())].into();
        store.write(key::NO_RED_DETAILS, &details).unwrap();
        assert_eq!(
            store.read::<BTreeMap<u8, String>>(key::NO_RED_DETAILS),
            Some(details)
        );

        let reasons: Vec<String> = vec!["System state is not off or runtime".into()];
        store.write(key::FAILOVERS_PAUSED_REASONS, &reasons).unwrap();
        assert_eq!(
            store.read::<Vec<String>>(key::FAILOVERS_PAUSED_REASONS),
            Some(reasons)
        );

        store
            .write(key::REDUNDANCY_OFF_AT_RUNTIME, &(true, false))
            .unwrap();
        assert_eq!(
            store.read::<(bool, bool)>(key::REDUNDANCY_OFF_AT_RUNTIME),
            Some((true, false))
        );
    }

    #[test]
    fn missing_and_corrupt_reads_degrade_to_none() {
        let (dir, store) = temp_store();

        assert_eq!(store.read::<bool>("Nothing"), None);
        store.remove("Nothing").unwrap();

        std::fs::write(dir.path().join("data.json"), "{not json").unwrap();
        assert_eq!(store.read::<bool>("Nothing"), None);

        // A fresh write recovers the file.
        store.write("Bool", &true).unwrap();
        assert_eq!(store.read::<bool>("Bool"), Some(true));
    }

    #[test]
    fn unknown_keys_survive_writes() {
        let (dir, store) = temp_store();

        std::fs::write(
            dir.path().join("data.json"),
            r#"{"FutureKey": [1, 2, 3]}"#,
        )
        .unwrap();

        store.write(key::ROLE, &Role::Active).unwrap();
        assert_eq!(
            store.read::<Vec<u8>>("FutureKey"),
            Some(vec![1, 2, 3])
        );
    }

    #[test]
    fn type_mismatch_reads_as_none() {
        let (_dir, store) = temp_store();
        store.write("Bool", &true).unwrap();
        assert_eq!(store.read::<String>("Bool"), None);
    }
}
