use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::error::AbiError;

/// On-disk layout rooted at the data directory:
/// `sourcedata/<id>/` raw payload + metadata, `procdata/<id>/` converted and
/// registered volumes, `bids/` the final organized tree.
#[derive(Debug, Clone)]
pub struct Store {
    root: Utf8PathBuf,
}

/// Pipeline progress of one dataset unit, persisted after each phase so
/// re-runs can skip completed work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Acquired,
    Converted,
    Registered,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusRecord {
    pub dataset_id: u64,
    pub phase: Phase,
    pub completed_at: String,
}

impl StatusRecord {
    pub fn now(dataset_id: u64, phase: Phase) -> Self {
        Self {
            dataset_id,
            phase,
            completed_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

impl Store {
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    pub fn sourcedata_root(&self) -> Utf8PathBuf {
        self.root.join("sourcedata")
    }

    pub fn procdata_root(&self) -> Utf8PathBuf {
        self.root.join("procdata")
    }

    pub fn bids_root(&self) -> Utf8PathBuf {
        self.root.join("bids")
    }

    pub fn unit_source_dir(&self, dataset_id: u64) -> Utf8PathBuf {
        self.sourcedata_root().join(dataset_id.to_string())
    }

    pub fn unit_proc_dir(&self, dataset_id: u64) -> Utf8PathBuf {
        self.procdata_root().join(dataset_id.to_string())
    }

    pub fn metadata_xml_path(&self, dataset_id: u64) -> Utf8PathBuf {
        self.unit_source_dir(dataset_id)
            .join(format!("{dataset_id}_experiment_metadata.xml"))
    }

    pub fn metadata_json_path(&self, dataset_id: u64) -> Utf8PathBuf {
        self.unit_source_dir(dataset_id)
            .join(format!("{dataset_id}_experiment_metadata.json"))
    }

    pub fn status_path(&self, dataset_id: u64) -> Utf8PathBuf {
        self.unit_source_dir(dataset_id).join("status.json")
    }

    pub fn structure_graph_path(&self, format: &str) -> Utf8PathBuf {
        self.root.join(format!("structure_graph.{format}"))
    }

    pub fn dataset_ids_path(&self) -> Utf8PathBuf {
        self.root.join("ABI-connectivity-ids.csv")
    }

    pub fn ensure_root(&self) -> Result<(), AbiError> {
        fs::create_dir_all(self.root.as_std_path())
            .map_err(|err| AbiError::Filesystem(err.to_string()))
    }

    pub fn ensure_dir(path: &Utf8Path) -> Result<(), AbiError> {
        fs::create_dir_all(path.as_std_path()).map_err(|err| AbiError::Filesystem(err.to_string()))
    }

    /// Numeric unit directories under a phase root, in ascending id order.
    pub fn list_unit_ids(root: &Utf8Path) -> Result<Vec<u64>, AbiError> {
        if !root.as_std_path().exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        let entries = fs::read_dir(root.as_std_path())
            .map_err(|err| AbiError::Filesystem(err.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|err| AbiError::Filesystem(err.to_string()))?;
            if !entry.path().is_dir() {
                continue;
            }
            if let Some(id) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<u64>().ok())
            {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    pub fn read_status(&self, dataset_id: u64) -> Result<Option<StatusRecord>, AbiError> {
        let path = self.status_path(dataset_id);
        if !path.as_std_path().exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path.as_std_path())
            .map_err(|err| AbiError::Filesystem(err.to_string()))?;
        let record = serde_json::from_str(&content)
            .map_err(|err| AbiError::Filesystem(err.to_string()))?;
        Ok(Some(record))
    }

    pub fn write_status(&self, record: &StatusRecord) -> Result<(), AbiError> {
        Self::write_json_atomic(&self.status_path(record.dataset_id), record)
    }

    /// True when the unit's manifest already covers `phase`.
    pub fn phase_done(&self, dataset_id: u64, phase: Phase) -> Result<bool, AbiError> {
        Ok(self
            .read_status(dataset_id)?
            .map(|record| record.phase >= phase)
            .unwrap_or(false))
    }

    pub fn write_json_atomic<T: Serialize>(path: &Utf8Path, value: &T) -> Result<(), AbiError> {
        let content = serde_json::to_vec_pretty(value)
            .map_err(|err| AbiError::Filesystem(err.to_string()))?;
        Self::write_bytes_atomic(path, &content)
    }

    pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), AbiError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent.as_std_path())
                .map_err(|err| AbiError::Filesystem(err.to_string()))?;
        }
        let tmp_path = Utf8PathBuf::from(format!("{path}.tmp"));
        fs::write(tmp_path.as_std_path(), content)
            .map_err(|err| AbiError::Filesystem(err.to_string()))?;
        fs::rename(tmp_path.as_std_path(), path.as_std_path())
            .map_err(|err| AbiError::Filesystem(err.to_string()))?;
        Ok(())
    }

    pub fn copy_file_atomic(source: &Utf8Path, dest: &Utf8Path) -> Result<(), AbiError> {
        let parent = dest
            .parent()
            .ok_or_else(|| AbiError::Filesystem("invalid destination path".to_string()))?;
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| AbiError::Filesystem(err.to_string()))?;
        let temp = tempfile::Builder::new()
            .prefix("abi-connect-copy")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| AbiError::Filesystem(err.to_string()))?;
        fs::copy(source.as_std_path(), temp.path())
            .map_err(|err| AbiError::Filesystem(err.to_string()))?;
        if dest.as_std_path().exists() {
            fs::remove_file(dest.as_std_path())
                .map_err(|err| AbiError::Filesystem(err.to_string()))?;
        }
        temp.persist(dest.as_std_path())
            .map_err(|err| AbiError::Filesystem(err.to_string()))?;
        Ok(())
    }

    /// First file with the given extension directly inside `dir`.
    pub fn find_by_extension(dir: &Utf8Path, ext: &str) -> Result<Option<Utf8PathBuf>, AbiError> {
        let entries = fs::read_dir(dir.as_std_path())
            .map_err(|err| AbiError::Filesystem(err.to_string()))?;
        let mut matches = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| AbiError::Filesystem(err.to_string()))?;
            let path = entry.path();
            if path.is_file()
                && path
                    .extension()
                    .and_then(|value| value.to_str())
                    .map(|value| value.eq_ignore_ascii_case(ext))
                    .unwrap_or(false)
            {
                if let Ok(path) = Utf8PathBuf::from_path_buf(path) {
                    matches.push(path);
                }
            }
        }
        matches.sort();
        Ok(matches.into_iter().next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (tempfile::TempDir, Store) {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        (temp, Store::new(root))
    }

    #[test]
    fn layout_paths() {
        let (_temp, store) = temp_store();
        assert!(store.unit_source_dir(42).ends_with("sourcedata/42"));
        assert!(store.unit_proc_dir(42).ends_with("procdata/42"));
        assert!(
            store
                .metadata_xml_path(42)
                .ends_with("sourcedata/42/42_experiment_metadata.xml")
        );
        assert!(store.bids_root().ends_with("bids"));
    }

    #[test]
    fn status_round_trip() {
        let (_temp, store) = temp_store();
        assert!(store.read_status(7).unwrap().is_none());

        store
            .write_status(&StatusRecord::now(7, Phase::Acquired))
            .unwrap();
        let record = store.read_status(7).unwrap().unwrap();
        assert_eq!(record.dataset_id, 7);
        assert_eq!(record.phase, Phase::Acquired);

        assert!(store.phase_done(7, Phase::Acquired).unwrap());
        assert!(!store.phase_done(7, Phase::Registered).unwrap());

        store
            .write_status(&StatusRecord::now(7, Phase::Registered))
            .unwrap();
        assert!(store.phase_done(7, Phase::Converted).unwrap());
    }

    #[test]
    fn lists_numeric_unit_dirs_sorted() {
        let (_temp, store) = temp_store();
        for name in ["20", "3", "100", "notanid"] {
            std::fs::create_dir_all(store.sourcedata_root().join(name).as_std_path()).unwrap();
        }
        let ids = Store::list_unit_ids(&store.sourcedata_root()).unwrap();
        assert_eq!(ids, vec![3, 20, 100]);
    }

    #[test]
    fn find_by_extension_prefers_lexical_first() {
        let (_temp, store) = temp_store();
        let dir = store.unit_source_dir(1);
        Store::ensure_dir(&dir).unwrap();
        std::fs::write(dir.join("b.nrrd").as_std_path(), b"").unwrap();
        std::fs::write(dir.join("a.nrrd").as_std_path(), b"").unwrap();
        std::fs::write(dir.join("c.xml").as_std_path(), b"").unwrap();

        let found = Store::find_by_extension(&dir, "nrrd").unwrap().unwrap();
        assert!(found.ends_with("a.nrrd"));
    }
}
