//! Read-only knowledge pack catalog.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgePack {
    pub id: String,
    pub title: String,
    pub content: String,
}

impl KnowledgePack {
    pub fn new(id: impl Into<String>, title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            content: content.into(),
        }
    }
}

/// Lookup of knowledge packs by id.
pub trait KnowledgeCatalog: Send + Sync {
    fn get(&self, id: &str) -> Option<KnowledgePack>;
}

/// Resolve pack ids in order. Unknown ids are skipped with a warning.
pub fn resolve_packs(catalog: &dyn KnowledgeCatalog, ids: &[String]) -> Vec<KnowledgePack> {
    ids.iter()
        .filter_map(|id| {
            let pack = catalog.get(id);
            if pack.is_none() {
                warn!(pack_id = %id, "Unknown knowledge pack, skipping");
            }
            pack
        })
        .collect()
}

/// In-memory catalog.
#[derive(Debug, Clone, Default)]
pub struct MemoryKnowledgeCatalog {
    packs: HashMap<String, KnowledgePack>,
}

impl MemoryKnowledgeCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_packs(packs: impl IntoIterator<Item = KnowledgePack>) -> Self {
        Self {
            packs: packs.into_iter().map(|p| (p.id.clone(), p)).collect(),
        }
    }

    pub fn insert(&mut self, pack: KnowledgePack) {
        self.packs.insert(pack.id.clone(), pack);
    }

    pub fn len(&self) -> usize {
        self.packs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packs.is_empty()
    }
}

impl KnowledgeCatalog for MemoryKnowledgeCatalog {
    fn get(&self, id: &str) -> Option<KnowledgePack> {
        self.packs.get(id).cloned()
    }
}
