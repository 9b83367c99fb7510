//! Per-template persistence of position sets.
//!
//! One JSON document per template id, named `{template_id}_positions.json`.
//! Writes go through a tempfile in the same directory and are renamed into
//! place, so a crash never leaves a half-written set behind. Concurrency is
//! last-writer-wins; callers serialize writes per template id themselves.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::StoreError;
use crate::model::{FieldPosition, PositionSet};

const POSITION_FILE_SUFFIX: &str = "_positions.json";

/// On-disk shape of a position file.
#[derive(Debug, Serialize, Deserialize)]
struct PositionFile {
    template: String,
    generated: DateTime<Utc>,
    fields: BTreeMap<String, FieldPosition>,
}

/// Directory-backed store of position sets, one file per template id.
#[derive(Debug, Clone)]
pub struct PositionStore {
    dir: PathBuf,
}

impl PositionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the position file for a template id.
    pub fn path_for(&self, template_id: &str) -> PathBuf {
        self.dir
            .join(format!("{}{}", template_id, POSITION_FILE_SUFFIX))
    }

    /// Loads the position set for a template id.
    ///
    /// A missing file is not an error and yields an empty set. Optional
    /// attributes omitted from the file get their documented defaults
    /// (`type=text`, `fontSizePt=9`, `fontStyle=none`).
    pub fn load(&self, template_id: &str) -> Result<PositionSet, StoreError> {
        let path = self.path_for(template_id);
        if !path.exists() {
            debug!(template_id, "no position file, returning empty set");
            return Ok(PositionSet::new(template_id));
        }

        let mut set = Self::load_path(&path)?;
        set.template_id = template_id.to_string();
        Ok(set)
    }

    /// Reads a position file at an explicit path, such as a reference set
    /// handed to the comparator. Unlike [`load`](Self::load), a missing
    /// file is an error here. The template id comes from the file itself.
    pub fn load_path(path: &Path) -> Result<PositionSet, StoreError> {
        let content = fs::read_to_string(path)?;
        let file: PositionFile =
            serde_json::from_str(&content).map_err(|e| StoreError::Malformed(e.to_string()))?;

        Ok(PositionSet {
            template_id: file.template,
            fields: file.fields,
        })
    }

    /// Atomically writes the position set and returns the file path.
    pub fn save(&self, set: &PositionSet) -> Result<PathBuf, StoreError> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(&set.template_id);

        let file = PositionFile {
            template: set.template_id.clone(),
            generated: Utc::now(),
            fields: set.fields.clone(),
        };
        let json = serde_json::to_string_pretty(&file)
            .map_err(|e| StoreError::Malformed(e.to_string()))?;

        let mut tmp = tempfile::Builder::new()
            .prefix(".positions-")
            .suffix(".tmp")
            .tempfile_in(&self.dir)?;
        tmp.write_all(json.as_bytes())?;
        tmp.flush()?;
        tmp.persist(&path).map_err(|e| StoreError::Io(e.error))?;

        info!(
            template_id = %set.template_id,
            fields = set.len(),
            path = %path.display(),
            "saved position set"
        );
        Ok(path)
    }

    /// Whether a position file exists for the template id.
    pub fn contains(&self, template_id: &str) -> bool {
        self.path_for(template_id).exists()
    }

    /// Template ids with a stored position file, sorted ascending.
    pub fn templates(&self) -> Result<Vec<String>, StoreError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                if let Some(id) = name.strip_suffix(POSITION_FILE_SUFFIX) {
                    if !id.is_empty() {
                        ids.push(id.to_string());
                    }
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FieldType, FontStyle};
    use pretty_assertions::assert_eq;

    fn sample_set() -> PositionSet {
        let mut set = PositionSet::new("fl100");
        set.insert(
            "case_number",
            crate::model::FieldPosition::new(1, 140.0, 20.0, 50.0, 8.0),
        );
        set.insert(
            "petitioner_name",
            crate::model::FieldPosition::new(1, 25.0, 40.0, 80.0, 8.0)
                .with_type(FieldType::Text),
        );
        set
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = PositionStore::new(dir.path());

        let set = sample_set();
        store.save(&set).unwrap();
        let loaded = store.load("fl100").unwrap();
        assert_eq!(loaded, set);
    }

    #[test]
    fn test_load_missing_file_yields_empty_set() {
        let dir = tempfile::tempdir().unwrap();
        let store = PositionStore::new(dir.path());

        let set = store.load("nope").unwrap();
        assert_eq!(set.template_id, "nope");
        assert!(set.is_empty());
    }

    #[test]
    fn test_load_malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = PositionStore::new(dir.path());
        fs::write(store.path_for("broken"), "{not json").unwrap();

        let err = store.load("broken").unwrap_err();
        assert!(matches!(err, StoreError::Malformed(_)));
    }

    #[test]
    fn test_defaults_applied_for_omitted_attributes() {
        let dir = tempfile::tempdir().unwrap();
        let store = PositionStore::new(dir.path());
        fs::write(
            store.path_for("sparse"),
            r#"{
                "template": "sparse",
                "generated": "2025-01-12T09:30:00Z",
                "fields": {
                    "case_number": {"page":1,"x":140.0,"y":20.0,"width":50.0,"height":8.0}
                }
            }"#,
        )
        .unwrap();

        let set = store.load("sparse").unwrap();
        let position = set.get("case_number").unwrap();
        assert_eq!(position.field_type, FieldType::Text);
        assert_eq!(position.font_size_pt, 9.0);
        assert_eq!(position.font_style, FontStyle::None);
    }

    #[test]
    fn test_save_creates_directory_and_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = PositionStore::new(dir.path().join("nested"));

        store.save(&sample_set()).unwrap();
        assert!(store.contains("fl100"));

        let leftovers: Vec<_> = fs::read_dir(store.dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_templates_lists_sorted_ids_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = PositionStore::new(dir.path());

        let mut b = PositionSet::new("fl105");
        b.insert("x", crate::model::FieldPosition::new(1, 1.0, 1.0, 5.0, 5.0));
        store.save(&b).unwrap();
        store.save(&sample_set()).unwrap();
        fs::write(dir.path().join("README.txt"), "not a position file").unwrap();

        assert_eq!(store.templates().unwrap(), vec!["fl100", "fl105"]);
    }

    #[test]
    fn test_templates_missing_dir_is_empty() {
        let store = PositionStore::new("/definitely/not/here");
        assert!(store.templates().unwrap().is_empty());
    }

    #[test]
    fn test_load_path_reads_reference_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = PositionStore::new(dir.path());
        let path = store.save(&sample_set()).unwrap();

        let reference = PositionStore::load_path(&path).unwrap();
        assert_eq!(reference.template_id, "fl100");
        assert_eq!(reference.len(), 2);

        let err = PositionStore::load_path(Path::new("/no/such/reference.json")).unwrap_err();
        assert!(matches!(err, StoreError::Io(_)));
    }

    #[test]
    fn test_last_writer_wins() {
        let dir = tempfile::tempdir().unwrap();
        let store = PositionStore::new(dir.path());

        store.save(&sample_set()).unwrap();
        let mut second = PositionSet::new("fl100");
        second.insert(
            "only_field",
            crate::model::FieldPosition::new(2, 5.0, 5.0, 30.0, 10.0),
        );
        store.save(&second).unwrap();

        let loaded = store.load("fl100").unwrap();
        assert_eq!(loaded, second);
    }
}
