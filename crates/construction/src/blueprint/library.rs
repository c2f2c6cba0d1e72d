use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use tracing::{debug, info, warn};

use crate::types::BlueprintId;

use super::format::{decode_blueprint, BLUEPRINT_FILE_EXTENSION};
use super::{Blueprint, BlueprintError, ValidationLimits};

static MEMORY_SOURCE_POISON_WARNED: AtomicBool = AtomicBool::new(false);

fn warn_memory_source_poison_once(operation: &'static str) {
    if MEMORY_SOURCE_POISON_WARNED
        .compare_exchange(false, true, Ordering::Relaxed, Ordering::Relaxed)
        .is_ok()
    {
        warn!(operation, "blueprint memory source lock poisoned; recovered inner value");
    }
}

/// Where blueprint bytes come from. Implementations only fetch; decoding
/// and caching belong to [`BlueprintLibrary`].
pub trait BlueprintSource: Send + Sync {
    fn read(&self, identifier: &BlueprintId) -> Result<Vec<u8>, BlueprintError>;

    /// Every identifier this source can currently serve, sorted.
    fn list(&self) -> io::Result<Vec<BlueprintId>>;
}

/// Reads `<root>/<identifier>.blueprint`; identifiers may contain `/`.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, identifier: &BlueprintId) -> PathBuf {
        self.root
            .join(format!("{}.{BLUEPRINT_FILE_EXTENSION}", identifier.as_str()))
    }
}

impl BlueprintSource for DirectorySource {
    fn read(&self, identifier: &BlueprintId) -> Result<Vec<u8>, BlueprintError> {
        validate_identifier(identifier)?;
        let path = self.path_for(identifier);
        match fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                Err(BlueprintError::NotFound {
                    identifier: identifier.clone(),
                    path,
                })
            }
            Err(source) => Err(BlueprintError::Io {
                identifier: identifier.clone(),
                path,
                source,
            }),
        }
    }

    fn list(&self) -> io::Result<Vec<BlueprintId>> {
        let mut identifiers = Vec::new();
        if self.root.is_dir() {
            collect_blueprint_files(&self.root, &self.root, &mut identifiers)?;
        }
        identifiers.sort();
        Ok(identifiers)
    }
}

fn collect_blueprint_files(
    root: &Path,
    dir: &Path,
    identifiers: &mut Vec<BlueprintId>,
) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_blueprint_files(root, &path, identifiers)?;
            continue;
        }
        if path.extension().and_then(|ext| ext.to_str()) != Some(BLUEPRINT_FILE_EXTENSION) {
            continue;
        }
        let Ok(relative) = path.with_extension("").strip_prefix(root).map(Path::to_path_buf)
        else {
            continue;
        };
        let segments = relative
            .components()
            .filter_map(|component| match component {
                Component::Normal(segment) => segment.to_str(),
                _ => None,
            })
            .collect::<Vec<_>>();
        if !segments.is_empty() {
            identifiers.push(BlueprintId::new(segments.join("/")));
        }
    }
    Ok(())
}

fn validate_identifier(identifier: &BlueprintId) -> Result<(), BlueprintError> {
    let raw = identifier.as_str();
    let escapes_root = raw.is_empty()
        || raw.starts_with('/')
        || raw.contains('\\')
        || raw.split('/').any(|segment| segment.is_empty() || segment == "." || segment == "..");
    if escapes_root {
        return Err(BlueprintError::malformed(
            identifier,
            "identifier must be a relative path of non-empty segments",
        ));
    }
    Ok(())
}

/// In-memory source. Clones share the same contents, so tests and tools can
/// keep a handle and swap bytes under a live library.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    entries: Arc<RwLock<BTreeMap<BlueprintId, Vec<u8>>>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, identifier: BlueprintId, bytes: Vec<u8>) {
        let mut entries = self.entries.write().unwrap_or_else(|poisoned| {
            warn_memory_source_poison_once("insert");
            poisoned.into_inner()
        });
        entries.insert(identifier, bytes);
    }

    pub fn remove(&self, identifier: &BlueprintId) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(|poisoned| {
            warn_memory_source_poison_once("remove");
            poisoned.into_inner()
        });
        entries.remove(identifier).is_some()
    }
}

impl BlueprintSource for MemorySource {
    fn read(&self, identifier: &BlueprintId) -> Result<Vec<u8>, BlueprintError> {
        let entries = self.entries.read().unwrap_or_else(|poisoned| {
            warn_memory_source_poison_once("read");
            poisoned.into_inner()
        });
        entries
            .get(identifier)
            .cloned()
            .ok_or_else(|| BlueprintError::NotFound {
                identifier: identifier.clone(),
                path: PathBuf::from(format!("memory:{identifier}")),
            })
    }

    fn list(&self) -> io::Result<Vec<BlueprintId>> {
        let entries = self.entries.read().unwrap_or_else(|poisoned| {
            warn_memory_source_poison_once("list");
            poisoned.into_inner()
        });
        Ok(entries.keys().cloned().collect())
    }
}

/// By-identifier cache of validated blueprints. Only successful parses are
/// cached; a failed load leaves no entry behind.
pub struct BlueprintLibrary {
    source: Box<dyn BlueprintSource>,
    cache: HashMap<BlueprintId, Arc<Blueprint>>,
    limits: ValidationLimits,
}

impl BlueprintLibrary {
    pub fn new(source: impl BlueprintSource + 'static, limits: ValidationLimits) -> Self {
        Self {
            source: Box::new(source),
            cache: HashMap::new(),
            limits,
        }
    }

    pub fn limits(&self) -> ValidationLimits {
        self.limits
    }

    pub fn load(&mut self, identifier: &BlueprintId) -> Result<Arc<Blueprint>, BlueprintError> {
        if let Some(cached) = self.cache.get(identifier) {
            debug!(blueprint = %identifier, "blueprint_cache_hit");
            return Ok(Arc::clone(cached));
        }
        self.load_uncached(identifier)
    }

    /// Drops any cached copy, then parses the resource again.
    pub fn force_reload(
        &mut self,
        identifier: &BlueprintId,
    ) -> Result<Arc<Blueprint>, BlueprintError> {
        let previous_hash = self
            .cache
            .remove(identifier)
            .map(|previous| previous.source_hash().to_string());
        let reloaded = self.load_uncached(identifier)?;
        match previous_hash {
            Some(previous) if previous != reloaded.source_hash() => warn!(
                blueprint = %identifier,
                previous_hash = %previous,
                source_hash = %reloaded.source_hash(),
                "blueprint_changed_on_reload"
            ),
            Some(_) => info!(blueprint = %identifier, "blueprint_reloaded_unchanged"),
            None => {}
        }
        Ok(reloaded)
    }

    pub fn invalidate(&mut self, identifier: &BlueprintId) -> bool {
        self.cache.remove(identifier).is_some()
    }

    pub fn cached(&self, identifier: &BlueprintId) -> Option<Arc<Blueprint>> {
        self.cache.get(identifier).cloned()
    }

    pub fn cached_count(&self) -> usize {
        self.cache.len()
    }

    pub fn list(&self) -> io::Result<Vec<BlueprintId>> {
        self.source.list()
    }

    fn load_uncached(
        &mut self,
        identifier: &BlueprintId,
    ) -> Result<Arc<Blueprint>, BlueprintError> {
        let parsed = self
            .source
            .read(identifier)
            .and_then(|bytes| decode_blueprint(identifier, &bytes, self.limits));
        let blueprint = match parsed {
            Ok(blueprint) => Arc::new(blueprint),
            Err(error) => {
                warn!(blueprint = %identifier, error = %error, "blueprint_load_failed");
                return Err(error);
            }
        };
        info!(
            blueprint = %identifier,
            dimensions = %blueprint.dimensions(),
            unit_count = blueprint.units().len(),
            source_hash = %blueprint.source_hash(),
            "blueprint_loaded"
        );
        self.cache.insert(identifier.clone(), Arc::clone(&blueprint));
        Ok(blueprint)
    }
}

impl std::fmt::Debug for BlueprintLibrary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlueprintLibrary")
            .field("cached", &self.cache.len())
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}
