//! Knowledge packs loaded from a JSON file.

use std::path::Path;

use anyhow::{Context, Result};
use coordination::debate::{KnowledgePack, MemoryKnowledgeCatalog};
use serde::Deserialize;
use tracing::info;

#[derive(Deserialize)]
#[serde(untagged)]
enum PackFile {
    List(Vec<KnowledgePack>),
    Wrapped { packs: Vec<KnowledgePack> },
}

/// Load a catalog from `[{id, title, content}, ...]` or `{"packs": [...]}`.
pub fn load_catalog(path: &Path) -> Result<MemoryKnowledgeCatalog> {
    let content =
        std::fs::read_to_string(path).context(format!("Failed to read {}", path.display()))?;
    let file: PackFile = serde_json::from_str(&content)
        .context(format!("Failed to parse knowledge packs in {}", path.display()))?;
    let packs = match file {
        PackFile::List(packs) | PackFile::Wrapped { packs } => packs,
    };
    let catalog = MemoryKnowledgeCatalog::from_packs(packs);
    info!(path = %path.display(), packs = catalog.len(), "Knowledge catalog loaded");
    Ok(catalog)
}
