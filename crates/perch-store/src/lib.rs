//! Per-group configuration store
//!
//! A flat JSON file mapping group id to named items. Each item holds either
//! a single identifier, a list of identifiers, or nothing; the schema of
//! item names and kinds is declared by the bot that owns the store.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Whether an item stores one identifier or many.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    One,
    Many,
}

/// One declared item of the store schema.
#[derive(Debug, Clone)]
pub struct ItemSpec {
    pub name: String,
    pub kind: ItemKind,
}

impl ItemSpec {
    pub fn one(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ItemKind::One,
        }
    }

    pub fn many(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ItemKind::Many,
        }
    }

    fn default_value(&self) -> ItemValue {
        match self.kind {
            ItemKind::One => ItemValue::Absent,
            ItemKind::Many => ItemValue::Many(Vec::new()),
        }
    }
}

/// A stored value. `Absent` round-trips as JSON null.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ItemValue {
    One(String),
    Many(Vec<String>),
    Absent,
}

type GroupItems = HashMap<String, ItemValue>;

/// The store: schema plus the per-group values, backed by one JSON file.
pub struct GroupStore {
    path: PathBuf,
    schema: Vec<ItemSpec>,
    groups: HashMap<String, GroupItems>,
}

impl GroupStore {
    /// Load the store for the given groups. A missing file is created empty;
    /// stored values overlay the schema defaults, and groups or items the
    /// file mentions but the schema does not are ignored.
    pub fn load(
        path: impl Into<PathBuf>,
        schema: Vec<ItemSpec>,
        group_ids: &[String],
    ) -> Result<Self> {
        let path = path.into();

        let stored: HashMap<String, GroupItems> = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read store file {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("failed to parse store file {}", path.display()))?
        } else {
            std::fs::write(&path, "{}")
                .with_context(|| format!("failed to create store file {}", path.display()))?;
            info!("created empty group store at {}", path.display());
            HashMap::new()
        };

        let mut groups = HashMap::new();
        for group_id in group_ids {
            let mut items: GroupItems = schema
                .iter()
                .map(|spec| (spec.name.clone(), spec.default_value()))
                .collect();
            if let Some(persisted) = stored.get(group_id) {
                for (name, value) in persisted {
                    if items.contains_key(name) {
                        items.insert(name.clone(), value.clone());
                    }
                }
            }
            groups.insert(group_id.clone(), items);
        }

        debug!(
            "loaded group store: {} groups, {} items each",
            groups.len(),
            schema.len()
        );
        Ok(Self {
            path,
            schema,
            groups,
        })
    }

    /// Write the full map back to the backing file.
    pub fn save(&self) -> Result<()> {
        let raw = serde_json::to_string(&self.groups).context("failed to serialize group store")?;
        std::fs::write(&self.path, raw)
            .with_context(|| format!("failed to write store file {}", self.path.display()))?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, group_id: &str, item: &str) -> Option<&ItemValue> {
        self.groups.get(group_id)?.get(item)
    }

    /// Set a One item.
    pub fn set(&mut self, group_id: &str, item: &str, value: impl Into<String>) -> Result<()> {
        self.expect_kind(item, ItemKind::One)?;
        self.slot(group_id)?
            .insert(item.to_string(), ItemValue::One(value.into()));
        Ok(())
    }

    /// Clear a One item back to absent.
    pub fn unset(&mut self, group_id: &str, item: &str) -> Result<()> {
        self.expect_kind(item, ItemKind::One)?;
        self.slot(group_id)?
            .insert(item.to_string(), ItemValue::Absent);
        Ok(())
    }

    /// Add one identifier to a Many item. Returns false when it was already
    /// present.
    pub fn add(&mut self, group_id: &str, item: &str, value: impl Into<String>) -> Result<bool> {
        let value = value.into();
        let list = self.many_mut(group_id, item)?;
        if list.contains(&value) {
            return Ok(false);
        }
        list.push(value);
        Ok(true)
    }

    /// Remove one identifier from a Many item. Returns false when it was not
    /// present.
    pub fn remove(&mut self, group_id: &str, item: &str, value: &str) -> Result<bool> {
        let list = self.many_mut(group_id, item)?;
        let before = list.len();
        list.retain(|v| v != value);
        Ok(list.len() != before)
    }

    /// Empty a Many item.
    pub fn clear(&mut self, group_id: &str, item: &str) -> Result<()> {
        self.many_mut(group_id, item)?.clear();
        Ok(())
    }

    fn expect_kind(&self, item: &str, kind: ItemKind) -> Result<()> {
        let Some(spec) = self.schema.iter().find(|s| s.name == item) else {
            bail!("item '{item}' is not declared in this store's schema");
        };
        if spec.kind != kind {
            bail!("item '{item}' is a {:?} item, not {:?}", spec.kind, kind);
        }
        Ok(())
    }

    fn slot(&mut self, group_id: &str) -> Result<&mut GroupItems> {
        match self.groups.get_mut(group_id) {
            Some(items) => Ok(items),
            None => bail!("group '{group_id}' is not registered in this store"),
        }
    }

    fn many_mut(&mut self, group_id: &str, item: &str) -> Result<&mut Vec<String>> {
        self.expect_kind(item, ItemKind::Many)?;
        let items = self.slot(group_id)?;
        match items.get_mut(item) {
            Some(ItemValue::Many(list)) => Ok(list),
            _ => bail!("item '{item}' does not hold a list value"),
        }
    }
}
