use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use nova_core::{ExternalRef, RunId};

use crate::{BoardItem, BoardSchema, PropertyValue, TaskSource};

/// Board kept as a JSON array of items on disk. Markers are written back into the file.
///
/// Single-process only: marker writes are a read-modify-write of the whole file,
/// serialized by an in-process lock. Two processes sharing one board file can
/// lose each other's markers. The datastore claim is unaffected, since the run
/// row decides ownership; a lost marker only means the item shows up in
/// discovery again and the duplicate insert is rejected.
pub struct JsonFileBoard {
    path: PathBuf,
    schema: BoardSchema,
    // serializes read-modify-write of the file within this process
    write_lock: Mutex<()>,
}

impl JsonFileBoard {
    pub fn open(path: &Path, schema: BoardSchema) -> Self {
        Self { path: path.to_path_buf(), schema, write_lock: Mutex::new(()) }
    }

    /// Creates an empty board file if none exists yet.
    pub fn init(path: &Path) -> Result<()> {
        if path.exists() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        std::fs::write(path, "[]\n").with_context(|| format!("write {}", path.display()))
    }

    pub fn load(&self) -> Result<Vec<BoardItem>> {
        let s = std::fs::read_to_string(&self.path).with_context(|| format!("read board {}", self.path.display()))?;
        let items: Vec<BoardItem> = serde_json::from_str(&s).with_context(|| format!("parse board {}", self.path.display()))?;
        Ok(items)
    }

    fn save(&self, items: &[BoardItem]) -> Result<()> {
        let s = serde_json::to_string_pretty(items)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, s).with_context(|| format!("write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path).with_context(|| format!("replace {}", self.path.display()))?;
        Ok(())
    }
}

impl TaskSource for JsonFileBoard {
    fn schema(&self) -> &BoardSchema {
        &self.schema
    }

    fn list_ready(&self) -> Result<Vec<BoardItem>> {
        Ok(self.load()?.into_iter().filter(|i| i.is_ready(&self.schema)).collect())
    }

    fn attach_claim_marker(&self, external_ref: &ExternalRef, run_id: &RunId) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap();
        let mut items = self.load()?;
        let item = items
            .iter_mut()
            .find(|i| &i.id == external_ref)
            .ok_or_else(|| anyhow!("board item {external_ref} not found in {}", self.path.display()))?;
        item.properties
            .insert(self.schema.marker_property.clone(), PropertyValue::Text(run_id.to_string()));
        self.save(&items)
    }
}
