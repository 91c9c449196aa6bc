//! Input folder snapshot used as planning input.
//!
//! Items are sorted by their `/`-separated relative path so that an unchanged
//! tree always yields the same list and the same fingerprint.

use crate::{error::ScanError, util::sha256_hex};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp", "tiff", "tif", "bmp", "gif"];
const DOCUMENT_EXTENSIONS: &[&str] = &["pdf", "docx", "txt", "md", "html", "htm", "rtf", "odt"];
const DATA_EXTENSIONS: &[&str] = &["csv", "json", "xml", "yaml", "yml"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Image,
    Document,
    Data,
    Other,
}

impl ItemKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ItemKind::Image => "image",
            ItemKind::Document => "document",
            ItemKind::Data => "data",
            ItemKind::Other => "other",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryItem {
    pub path: String,
    pub kind: ItemKind,
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub unreadable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inventory {
    pub root: String,
    pub fingerprint: String,
    pub items: Vec<InventoryItem>,
}

impl Inventory {
    pub fn from_items(root: &Path, mut items: Vec<InventoryItem>) -> Self {
        items.sort_by(|a, b| a.path.cmp(&b.path));
        items.dedup_by(|a, b| a.path == b.path);
        let fingerprint = fingerprint(&items);
        Self {
            root: root.display().to_string(),
            fingerprint,
            items,
        }
    }

    pub fn get(&self, path: &str) -> Option<&InventoryItem> {
        self.items
            .binary_search_by(|item| item.path.as_str().cmp(path))
            .ok()
            .map(|idx| &self.items[idx])
    }

    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    pub fn counts(&self) -> BTreeMap<ItemKind, usize> {
        let mut counts = BTreeMap::new();
        for item in &self.items {
            *counts.entry(item.kind).or_insert(0) += 1;
        }
        counts
    }

    pub fn total_bytes(&self) -> u64 {
        self.items.iter().map(|i| i.size_bytes).sum()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ScanOptions {
    pub follow_symlinks_in_root: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            follow_symlinks_in_root: true,
        }
    }
}

pub fn classify(path: &Path) -> ItemKind {
    let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
        return ItemKind::Other;
    };
    let ext = ext.to_ascii_lowercase();
    if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
        ItemKind::Image
    } else if DOCUMENT_EXTENSIONS.contains(&ext.as_str()) {
        ItemKind::Document
    } else if DATA_EXTENSIONS.contains(&ext.as_str()) {
        ItemKind::Data
    } else {
        ItemKind::Other
    }
}

pub fn scan(root: &Path, opts: &ScanOptions) -> Result<Inventory, ScanError> {
    let meta = std::fs::metadata(root).map_err(|source| ScanError::RootUnreadable {
        path: root.to_path_buf(),
        source,
    })?;
    if !meta.is_dir() {
        return Err(ScanError::NotADirectory {
            path: root.to_path_buf(),
        });
    }
    std::fs::read_dir(root).map_err(|source| ScanError::RootUnreadable {
        path: root.to_path_buf(),
        source,
    })?;
    let canonical_root = root
        .canonicalize()
        .map_err(|source| ScanError::RootUnreadable {
            path: root.to_path_buf(),
            source,
        })?;

    let mut items = Vec::new();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .min_depth(1);

    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(err) => {
                // Partial visibility: keep the path, flag it, move on.
                if let Some(path) = err.path() {
                    if let Some(rel) = relative_path(root, path) {
                        warn!("unreadable entry {}: {err}", path.display());
                        items.push(InventoryItem {
                            path: rel,
                            kind: ItemKind::Other,
                            size_bytes: 0,
                            unreadable: true,
                        });
                    }
                }
                continue;
            }
        };

        let path = entry.path();
        let file_type = entry.file_type();
        if file_type.is_dir() {
            continue;
        }

        let Some(rel) = relative_path(root, path) else {
            warn!("skipping non UTF-8 path: {}", path.display());
            continue;
        };

        if file_type.is_symlink() {
            if !opts.follow_symlinks_in_root {
                debug!("skipping symlink {rel}");
                continue;
            }
            match resolve_link_in_root(path, &canonical_root) {
                Some(target) => items.push(read_item(&target, rel, classify(path))),
                None => warn!("skipping symlink outside input root or not a file: {rel}"),
            }
            continue;
        }

        if file_type.is_file() {
            items.push(read_item(path, rel, classify(path)));
        }
    }

    let inventory = Inventory::from_items(root, items);
    info!(
        "scan root={} files={} bytes={} fingerprint={}",
        root.display(),
        inventory.items.len(),
        inventory.total_bytes(),
        &inventory.fingerprint[..12]
    );
    Ok(inventory)
}

fn read_item(path: &Path, rel: String, kind: ItemKind) -> InventoryItem {
    let size = std::fs::metadata(path).map(|m| m.len());
    let readable = std::fs::File::open(path).is_ok();
    match size {
        Ok(size_bytes) if readable => InventoryItem {
            path: rel,
            kind,
            size_bytes,
            unreadable: false,
        },
        Ok(size_bytes) => {
            warn!("file is not readable: {rel}");
            InventoryItem {
                path: rel,
                kind: ItemKind::Other,
                size_bytes,
                unreadable: true,
            }
        }
        Err(err) => {
            warn!("cannot stat {rel}: {err}");
            InventoryItem {
                path: rel,
                kind: ItemKind::Other,
                size_bytes: 0,
                unreadable: true,
            }
        }
    }
}

fn resolve_link_in_root(link: &Path, canonical_root: &Path) -> Option<PathBuf> {
    let target = link.canonicalize().ok()?;
    if target.starts_with(canonical_root) && target.is_file() {
        Some(target)
    } else {
        None
    }
}

/// `/`-joined path of `path` below `root`, or `None` if it is not valid UTF-8.
fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let mut parts = Vec::new();
    for comp in rel.components() {
        match comp {
            Component::Normal(part) => parts.push(part.to_str()?),
            _ => return None,
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

fn fingerprint(items: &[InventoryItem]) -> String {
    let bytes = serde_json::to_vec(items).unwrap_or_default();
    sha256_hex(&bytes)
}
