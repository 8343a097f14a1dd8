//! Canonical label registries, one per dimension.
//!
//! A registry is append-only: labels are created once, gain aliases over
//! time, and are never renamed or removed. Names are unique up to case and
//! whitespace. Registries persist as one JSON file per dimension and loading
//! only ever adds to what is already in memory.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};

use crate::dimension::Dimension;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid registry file {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
    #[error("serialize error: {0}")]
    Serialize(#[from] serde_json::Error),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> RegistryError + '_ {
    move |source| RegistryError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Where a canonical label came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelOrigin {
    /// Loaded from a predefined seed vocabulary.
    Seed,
    /// Minted by the normalizer while processing the corpus.
    #[default]
    Induced,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalLabel {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub examples: Vec<String>,
    #[serde(default)]
    pub origin: LabelOrigin,
}

/// What text represents a canonical label when embedding it for comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonBasis {
    /// The bare canonical name.
    #[default]
    NamesOnly,
    /// `name: description`.
    NamesWithDescriptions,
}

/// Case- and whitespace-insensitive key used for uniqueness and lookup.
pub fn fold_key(s: &str) -> String {
    s.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub dimension: Dimension,
    pub total: usize,
    pub seeded: usize,
    pub induced: usize,
    pub aliases: usize,
    pub induced_labels: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct LabelRegistry {
    dimension: Dimension,
    labels: BTreeMap<String, CanonicalLabel>,
    /// fold_key(name) -> name
    folded: HashMap<String, String>,
    /// alias -> name
    alias_index: HashMap<String, String>,
}

impl LabelRegistry {
    pub fn new(dimension: Dimension) -> Self {
        Self {
            dimension,
            labels: BTreeMap::new(),
            folded: HashMap::new(),
            alias_index: HashMap::new(),
        }
    }

    pub fn dimension(&self) -> Dimension {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.labels.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&CanonicalLabel> {
        self.labels.get(name)
    }

    pub fn labels(&self) -> impl Iterator<Item = &CanonicalLabel> {
        self.labels.values()
    }

    /// Insert a canonical label unless an equivalent name exists.
    ///
    /// Returns the name the label resolves to: the new name, or the existing
    /// entry that folds to the same key (whose description is left alone).
    /// Blank names are ignored.
    pub fn register(&mut self, name: &str, description: &str) -> Option<String> {
        self.insert(name, description, LabelOrigin::Induced)
    }

    /// Like [`register`](Self::register) but marks the label as seeded.
    pub fn seed(&mut self, name: &str, description: &str) -> Option<String> {
        self.insert(name, description, LabelOrigin::Seed)
    }

    fn insert(&mut self, name: &str, description: &str, origin: LabelOrigin) -> Option<String> {
        let name = name.trim();
        if name.is_empty() {
            return None;
        }
        let key = fold_key(name);
        if let Some(existing) = self.folded.get(&key) {
            return Some(existing.clone());
        }
        self.folded.insert(key, name.to_string());
        self.labels.insert(
            name.to_string(),
            CanonicalLabel {
                name: name.to_string(),
                description: description.trim().to_string(),
                aliases: Vec::new(),
                examples: Vec::new(),
                origin,
            },
        );
        Some(name.to_string())
    }

    /// Record `raw` as an alias of `canonical`.
    ///
    /// No-op (logged at debug) when the canonical name is unknown, when `raw`
    /// is the canonical name itself, or when the alias is already recorded.
    /// Returns whether an alias was added.
    pub fn add_alias(&mut self, canonical: &str, raw: &str) -> bool {
        let raw = raw.trim();
        if raw.is_empty() {
            return false;
        }
        let Some(entry) = self.labels.get_mut(canonical) else {
            tracing::debug!(
                dimension = %self.dimension,
                canonical,
                raw,
                "alias for unknown canonical label ignored"
            );
            return false;
        };
        if raw == entry.name || entry.aliases.iter().any(|a| a == raw) {
            return false;
        }
        entry.aliases.push(raw.to_string());
        self.alias_index
            .entry(raw.to_string())
            .or_insert_with(|| canonical.to_string());
        true
    }

    /// Attach an example item id to a label, keeping at most `cap` examples.
    pub fn add_example(&mut self, canonical: &str, example: &str, cap: usize) {
        if let Some(entry) = self.labels.get_mut(canonical) {
            if entry.examples.len() < cap && !entry.examples.iter().any(|e| e == example) {
                entry.examples.push(example.to_string());
            }
        }
    }

    /// Resolve a raw label without any model call: exact name, then
    /// case/whitespace-folded name, then a previously confirmed alias.
    pub fn resolve(&self, raw: &str) -> Option<&str> {
        let raw = raw.trim();
        if let Some((name, _)) = self.labels.get_key_value(raw) {
            return Some(name.as_str());
        }
        if let Some(name) = self.folded.get(&fold_key(raw)) {
            return Some(name.as_str());
        }
        self.alias_index.get(raw).map(String::as_str)
    }

    /// Sorted canonical names.
    pub fn to_comparison_text(&self) -> Vec<String> {
        self.labels.keys().cloned().collect()
    }

    /// `(name, text to embed)` pairs in name order.
    pub fn comparison_texts(&self, basis: ComparisonBasis) -> Vec<(String, String)> {
        self.labels
            .values()
            .map(|l| {
                let text = match basis {
                    ComparisonBasis::NamesOnly => l.name.clone(),
                    ComparisonBasis::NamesWithDescriptions if !l.description.is_empty() => {
                        format!("{}: {}", l.name, l.description)
                    }
                    ComparisonBasis::NamesWithDescriptions => l.name.clone(),
                };
                (l.name.clone(), text)
            })
            .collect()
    }

    /// Registry rendered for the semantic-merge prompt.
    pub fn to_prompt_text(&self) -> String {
        if self.labels.is_empty() {
            return "(no labels yet)".to_string();
        }
        let mut out = String::new();
        for l in self.labels.values() {
            out.push_str("- ");
            out.push_str(&l.name);
            if !l.description.is_empty() {
                out.push_str(": ");
                out.push_str(&l.description);
            }
            if !l.aliases.is_empty() {
                out.push_str(" (aliases: ");
                out.push_str(&l.aliases.join(", "));
                out.push(')');
            }
            out.push('\n');
        }
        out
    }

    pub fn snapshot(&self) -> BTreeMap<String, CanonicalLabel> {
        self.labels.clone()
    }

    pub fn stats(&self) -> RegistryStats {
        let induced_labels: Vec<String> = self
            .labels
            .values()
            .filter(|l| l.origin == LabelOrigin::Induced)
            .map(|l| l.name.clone())
            .collect();
        RegistryStats {
            dimension: self.dimension,
            total: self.labels.len(),
            seeded: self.labels.len() - induced_labels.len(),
            induced: induced_labels.len(),
            aliases: self.labels.values().map(|l| l.aliases.len()).sum(),
            induced_labels,
        }
    }

    /// Merge entries into this registry. Existing entries keep their
    /// description and gain any new aliases and examples. Returns the number
    /// of labels added.
    pub fn merge(&mut self, entries: impl IntoIterator<Item = CanonicalLabel>) -> usize {
        let before = self.len();
        for entry in entries {
            let Some(name) = self.insert(&entry.name, &entry.description, entry.origin) else {
                continue;
            };
            for alias in &entry.aliases {
                self.add_alias(&name, alias);
            }
            if let Some(label) = self.labels.get_mut(&name) {
                for example in entry.examples {
                    if !label.examples.contains(&example) {
                        label.examples.push(example);
                    }
                }
            }
        }
        self.len() - before
    }

    /// Write the registry as pretty JSON through a temp file and rename.
    pub fn save(&self, path: &Path) -> Result<(), RegistryError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(io_err(parent))?;
            }
        }
        let json = serde_json::to_string_pretty(&self.labels)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(io_err(&tmp))?;
        std::fs::rename(&tmp, path).map_err(io_err(path))?;
        Ok(())
    }

    /// Merge a saved registry file into this one. A missing file adds nothing.
    pub fn load(&mut self, path: &Path) -> Result<usize, RegistryError> {
        if !path.exists() {
            return Ok(0);
        }
        let text = std::fs::read_to_string(path).map_err(io_err(path))?;
        let entries: BTreeMap<String, CanonicalLabel> =
            serde_json::from_str(&text).map_err(|source| RegistryError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        Ok(self.merge(entries.into_values()))
    }
}

/// A seed vocabulary entry: a bare name or `{name, description}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SeedEntry {
    Name(String),
    Full {
        name: String,
        #[serde(default)]
        description: String,
    },
}

impl SeedEntry {
    fn parts(&self) -> (&str, &str) {
        match self {
            SeedEntry::Name(n) => (n, ""),
            SeedEntry::Full { name, description } => (name, description),
        }
    }
}

/// Dimension -> seed labels, as read from a seed file.
pub type SeedVocabulary = BTreeMap<Dimension, Vec<SeedEntry>>;

pub fn load_seed_vocabulary(path: &Path) -> Result<SeedVocabulary, RegistryError> {
    let text = std::fs::read_to_string(path).map_err(io_err(path))?;
    serde_json::from_str(&text).map_err(|source| RegistryError::Parse {
        path: path.display().to_string(),
        source,
    })
}

/// The four per-dimension registries, each behind its own lock.
///
/// Normalizing different dimensions can proceed in parallel; writes within a
/// dimension are serialized by holding that dimension's guard.
pub struct RegistrySet {
    dir: Option<PathBuf>,
    /// Indexed by `Dimension::index`.
    registries: [Mutex<LabelRegistry>; 4],
}

impl RegistrySet {
    pub fn in_memory() -> Self {
        Self {
            dir: None,
            registries: Dimension::ALL.map(|d| Mutex::new(LabelRegistry::new(d))),
        }
    }

    /// Open (or start) the registries stored under `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let dir = dir.into();
        let mut loaded = Dimension::ALL.map(LabelRegistry::new);
        for reg in loaded.iter_mut() {
            let dim = reg.dimension();
            let added = reg.load(&Self::path_in(&dir, dim))?;
            tracing::debug!(dimension = %dim, labels = added, "registry loaded");
        }
        Ok(Self {
            dir: Some(dir),
            registries: loaded.map(Mutex::new),
        })
    }

    fn path_in(dir: &Path, dim: Dimension) -> PathBuf {
        dir.join(format!("{}.json", dim.as_str()))
    }

    pub fn path_for(&self, dim: Dimension) -> Option<PathBuf> {
        self.dir.as_deref().map(|d| Self::path_in(d, dim))
    }

    pub async fn lock(&self, dim: Dimension) -> MutexGuard<'_, LabelRegistry> {
        self.registries[dim.index()].lock().await
    }

    /// Persist one registry through a guard the caller already holds.
    pub fn save_locked(&self, registry: &LabelRegistry) -> Result<(), RegistryError> {
        match self.path_for(registry.dimension()) {
            Some(path) => registry.save(&path),
            None => Ok(()),
        }
    }

    pub async fn save_all(&self) -> Result<(), RegistryError> {
        for dim in Dimension::ALL {
            let guard = self.lock(dim).await;
            self.save_locked(&guard)?;
        }
        Ok(())
    }

    /// Seed every dimension named in `vocab`. Returns labels actually added.
    pub async fn seed(&self, vocab: &SeedVocabulary) -> usize {
        let mut added = 0;
        for (dim, entries) in vocab {
            let mut guard = self.lock(*dim).await;
            for entry in entries {
                let before = guard.len();
                let (name, description) = entry.parts();
                guard.seed(name, description);
                added += guard.len() - before;
            }
        }
        added
    }

    pub async fn stats(&self) -> Vec<RegistryStats> {
        let mut out = Vec::with_capacity(Dimension::ALL.len());
        for dim in Dimension::ALL {
            out.push(self.lock(dim).await.stats());
        }
        out
    }

    pub async fn snapshot(&self) -> BTreeMap<Dimension, BTreeMap<String, CanonicalLabel>> {
        let mut out = BTreeMap::new();
        for dim in Dimension::ALL {
            out.insert(dim, self.lock(dim).await.snapshot());
        }
        out
    }
}
