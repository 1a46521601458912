//! Instance identifiers and on-disk layout

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

const INSTANCES_DIR: &str = "instances";
const CREDENTIAL_FILE: &str = "credential.json";
const SESSION_FILE: &str = "session.sealed";
const DATASTORE_FILE: &str = "datastore.db";

/// Validated instance identifier, safe to use as a directory name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct InstanceId(String);

impl InstanceId {
    /// Maximum identifier length
    pub const MAX_LEN: usize = 64;

    /// Validate and wrap an identifier
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() || id.len() > Self::MAX_LEN {
            return Err(Error::Validation(format!(
                "Instance id must be 1-{} characters",
                Self::MAX_LEN
            )));
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(Error::Validation(format!(
                "Instance id '{}' may only contain letters, digits, '-' and '_'",
                id
            )));
        }
        Ok(Self(id))
    }

    /// Identifier as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for InstanceId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for InstanceId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<InstanceId> for String {
    fn from(id: InstanceId) -> Self {
        id.0
    }
}

impl AsRef<str> for InstanceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Paths of one instance under the data directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceLayout {
    root: PathBuf,
}

impl InstanceLayout {
    /// Layout of `id` under `data_dir`
    pub fn new(data_dir: &Path, id: &InstanceId) -> Self {
        Self {
            root: data_dir.join(INSTANCES_DIR).join(id.as_str()),
        }
    }

    /// Instance directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Credential file
    pub fn credential_path(&self) -> PathBuf {
        self.root.join(CREDENTIAL_FILE)
    }

    /// Persisted session record
    pub fn session_path(&self) -> PathBuf {
        self.root.join(SESSION_FILE)
    }

    /// Encrypted datastore
    pub fn datastore_path(&self) -> PathBuf {
        self.root.join(DATASTORE_FILE)
    }

    /// Datastore file plus its SQLite sidecars
    pub fn datastore_files(&self) -> [PathBuf; 3] {
        [
            self.datastore_path(),
            self.root.join(format!("{}-wal", DATASTORE_FILE)),
            self.root.join(format!("{}-shm", DATASTORE_FILE)),
        ]
    }
}

/// Instances that have a directory under `data_dir`, sorted
pub fn list_instances(data_dir: &Path) -> Result<Vec<InstanceId>> {
    let dir = data_dir.join(INSTANCES_DIR);
    let entries = match std::fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut ids = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(id) = entry
            .file_name()
            .to_str()
            .and_then(|name| InstanceId::new(name).ok())
        {
            ids.push(id);
        }
    }
    ids.sort();
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_instance_id_validation() {
        assert!(InstanceId::new("default").is_ok());
        assert!(InstanceId::new("work_profile-2").is_ok());
        assert!(InstanceId::new("a".repeat(64)).is_ok());

        assert!(InstanceId::new("").is_err());
        assert!(InstanceId::new("a".repeat(65)).is_err());
        assert!(InstanceId::new("../escape").is_err());
        assert!(InstanceId::new("with space").is_err());
        assert!(InstanceId::new("ünicode").is_err());
    }

    #[test]
    fn test_instance_id_serde_validates() {
        let id: InstanceId = serde_json::from_str("\"alpha\"").unwrap();
        assert_eq!(id.as_str(), "alpha");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"alpha\"");
        assert!(serde_json::from_str::<InstanceId>("\"a/b\"").is_err());
    }

    #[test]
    fn test_layout_paths() {
        let id = InstanceId::new("alpha").unwrap();
        let layout = InstanceLayout::new(Path::new("/data"), &id);
        assert_eq!(layout.root(), Path::new("/data/instances/alpha"));
        assert_eq!(
            layout.credential_path(),
            PathBuf::from("/data/instances/alpha/credential.json")
        );
        assert_eq!(
            layout.session_path(),
            PathBuf::from("/data/instances/alpha/session.sealed")
        );
        assert_eq!(
            layout.datastore_path(),
            PathBuf::from("/data/instances/alpha/datastore.db")
        );
    }

    #[test]
    fn test_list_instances() {
        let dir = tempdir().unwrap();
        assert!(list_instances(dir.path()).unwrap().is_empty());

        for name in ["beta", "alpha", "not valid"] {
            std::fs::create_dir_all(dir.path().join("instances").join(name)).unwrap();
        }
        std::fs::write(dir.path().join("instances").join("stray-file"), b"x").unwrap();

        let ids: Vec<String> = list_instances(dir.path())
            .unwrap()
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(ids, vec!["alpha", "beta"]);
    }
}
