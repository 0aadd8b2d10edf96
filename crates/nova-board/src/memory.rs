use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use anyhow::{anyhow, bail};
use nova_core::{ExternalRef, RunId};

use crate::{BoardItem, BoardSchema, PropertyValue, TaskSource};

/// In-memory board for tests, with switches to simulate an unreachable board.
#[derive(Default)]
pub struct InMemoryBoard {
    schema: BoardSchema,
    items: Mutex<Vec<BoardItem>>,
    fail_list: AtomicBool,
    fail_marker: AtomicBool,
}

impl InMemoryBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a ready item with a title and target resource.
    pub fn add_ready(&self, id: &str, title: &str, repo: &str) {
        let item = BoardItem::new(id)
            .with(&self.schema.status_property, PropertyValue::Status(self.schema.ready_value.clone()))
            .with("Name", PropertyValue::Title(title.to_string()))
            .with("Repo", PropertyValue::Select(Some(repo.to_string())));
        self.add(item);
    }

    pub fn add(&self, item: BoardItem) {
        self.items.lock().unwrap().push(item);
    }

    /// Moves an item to another status column, e.g. off the ready value.
    pub fn set_status(&self, id: &str, value: &str) {
        let mut items = self.items.lock().unwrap();
        if let Some(item) = items.iter_mut().find(|i| i.id.as_str() == id) {
            item.properties.insert(self.schema.status_property.clone(), PropertyValue::Status(value.to_string()));
        }
    }

    pub fn marker_of(&self, id: &str) -> Option<String> {
        let items = self.items.lock().unwrap();
        items
            .iter()
            .find(|i| i.id.as_str() == id)
            .and_then(|i| i.claim_marker(&self.schema).map(str::to_string))
    }

    pub fn set_fail_list(&self, fail: bool) {
        self.fail_list.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_marker(&self, fail: bool) {
        self.fail_marker.store(fail, Ordering::SeqCst);
    }
}

impl TaskSource for InMemoryBoard {
    fn schema(&self) -> &BoardSchema {
        &self.schema
    }

    fn list_ready(&self) -> anyhow::Result<Vec<BoardItem>> {
        if self.fail_list.load(Ordering::SeqCst) {
            bail!("board unreachable");
        }
        let items = self.items.lock().unwrap();
        Ok(items.iter().filter(|i| i.is_ready(&self.schema)).cloned().collect())
    }

    fn attach_claim_marker(&self, external_ref: &ExternalRef, run_id: &RunId) -> anyhow::Result<()> {
        if self.fail_marker.load(Ordering::SeqCst) {
            bail!("board rejected marker update");
        }
        let mut items = self.items.lock().unwrap();
        let item = items
            .iter_mut()
            .find(|i| &i.id == external_ref)
            .ok_or_else(|| anyhow!("board item {external_ref} not found"))?;
        item.properties
            .insert(self.schema.marker_property.clone(), PropertyValue::Text(run_id.to_string()));
        Ok(())
    }
}
