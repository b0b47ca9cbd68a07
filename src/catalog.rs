//! The rule catalog store: loads, validates, and serves immutable
//! [`RuleCatalog`] snapshots, and exposes an atomic hot reload.
//!
//! All access to the live catalog goes through a single `ArcSwap` pointer
//! (the teacher's `Store` guards its on-disk files with a `FileLock`; here
//! there's no writer contending with readers, so the equivalent mechanism
//! is a single-writer/many-reader atomic swap rather than a lock). Readers
//! snapshot the pointer once per request and never observe a torn catalog.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, instrument, warn};

use crate::errors::{LoadError, ParseErrorKind, SchemaViolation, SemanticError};
use crate::format::{BreakpointEntry, Comparison, MethodKind, RuleCatalog, Unit};

/// Parses one catalog document. All fields optional, since a directory's
/// logical catalog is the union of however many files define each table.
#[derive(Debug, Default, serde::Deserialize)]
struct CatalogDocument {
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    breakpoints: Vec<BreakpointEntry>,
    #[serde(default, rename = "expertRules")]
    expert_rules: Vec<crate::format::ExpertRule>,
    #[serde(default, rename = "intrinsicResistance")]
    intrinsic_resistance: Vec<crate::format::IntrinsicRule>,
    #[serde(default, rename = "organismGroups")]
    organism_groups: crate::format::SortedMap<String, crate::format::SortedSet<crate::format::GroupMember>>,
    #[serde(default, rename = "antibioticClasses")]
    antibiotic_classes: crate::format::SortedMap<String, crate::format::SortedSet<crate::format::AntibioticKey>>,
    #[serde(default)]
    policy: Option<crate::format::CatalogPolicy>,
}

enum DocFormat {
    Toml,
    Yaml,
    Json,
}

fn detect_format(path: &Path) -> Result<DocFormat, ParseErrorKind> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => Ok(DocFormat::Toml),
        Some("yaml") | Some("yml") => Ok(DocFormat::Yaml),
        Some("json") => Ok(DocFormat::Json),
        _ => Err(ParseErrorKind::UnknownExtension),
    }
}

fn parse_document(path: &Path, text: &str) -> Result<CatalogDocument, LoadError> {
    let format = detect_format(path).map_err(|source| LoadError::ParseError {
        path: path.to_owned(),
        source,
    })?;
    let parsed = match format {
        DocFormat::Toml => toml::from_str(text).map_err(ParseErrorKind::from),
        DocFormat::Yaml => serde_yaml::from_str(text).map_err(ParseErrorKind::from),
        DocFormat::Json => serde_json::from_str(text).map_err(ParseErrorKind::from),
    };
    parsed.map_err(|source| LoadError::ParseError {
        path: path.to_owned(),
        source,
    })
}

/// Recursively lists every catalog document under `path` (or just `path`
/// itself, if it's a file).
fn collect_catalog_files(path: &Path) -> Result<Vec<PathBuf>, LoadError> {
    if !path.exists() {
        return Err(LoadError::FileMissing(path.to_owned()));
    }
    if path.is_file() {
        return Ok(vec![path.to_owned()]);
    }
    let mut files = Vec::new();
    let mut queue = VecDeque::from([path.to_owned()]);
    while let Some(dir) = queue.pop_front() {
        let entries = fs::read_dir(&dir).map_err(|e| LoadError::ParseError {
            path: dir.clone(),
            source: ParseErrorKind::Io(e),
        })?;
        for entry in entries {
            let entry = entry.map_err(|e| LoadError::ParseError {
                path: dir.clone(),
                source: ParseErrorKind::Io(e),
            })?;
            let entry_path = entry.path();
            if entry_path.is_dir() {
                queue.push_back(entry_path);
            } else if matches!(
                entry_path.extension().and_then(|e| e.to_str()),
                Some("toml") | Some("yaml") | Some("yml") | Some("json")
            ) {
                files.push(entry_path);
            }
        }
    }
    files.sort();
    Ok(files)
}

/// Parses and merges every document under `path` into one [`RuleCatalog`],
/// then validates it. Does not touch the live snapshot -- the caller
/// decides whether and when to publish the result.
#[instrument(skip_all, fields(path = %path.display()))]
pub fn load_catalog(path: &Path) -> Result<RuleCatalog, LoadError> {
    let files = collect_catalog_files(path)?;
    let mut catalog = RuleCatalog::default();
    let mut version: Option<String> = None;

    for file in &files {
        let text = fs::read_to_string(file).map_err(|e| LoadError::ParseError {
            path: file.clone(),
            source: ParseErrorKind::Io(e),
        })?;
        let doc = parse_document(file, &text)?;

        if let Some(v) = doc.version {
            match &version {
                None => version = Some(v),
                Some(existing) if existing != &v => {
                    return Err(LoadError::SemanticError {
                        errors: vec![SemanticError {
                            kind: "version-mismatch".to_owned(),
                            detail: format!(
                                "{} declares version {:?} but a previous file declared {:?}",
                                file.display(),
                                v,
                                existing
                            ),
                        }],
                    });
                }
                _ => {}
            }
        }

        catalog.breakpoints.extend(doc.breakpoints);
        catalog.expert_rules.extend(doc.expert_rules);
        catalog.intrinsic_resistance.extend(doc.intrinsic_resistance);
        catalog.organism_groups.extend(doc.organism_groups);
        catalog.antibiotic_classes.extend(doc.antibiotic_classes);
        if let Some(policy) = doc.policy {
            catalog.policy = policy;
        }
    }

    catalog.version_label = version.unwrap_or_else(|| "unversioned".to_owned());

    validate(&catalog)?;
    Ok(catalog)
}

/// Schema and semantic validation for a freshly-parsed catalog. Collects
/// every violation before returning, per spec: a reload failure must never
/// report only the first problem found.
fn validate(catalog: &RuleCatalog) -> Result<(), LoadError> {
    let mut violations: Vec<SchemaViolation> = Vec::new();
    let mut semantic: Vec<SemanticError> = Vec::new();

    // Comparator must agree with method/unit.
    for entry in &catalog.breakpoints {
        let ok = match (entry.method, entry.unit, entry.comparator) {
            (MethodKind::Mic | MethodKind::Gradient, Unit::MgPerL, Comparison::InverseForDisc) => false,
            (MethodKind::Mic | MethodKind::Gradient, Unit::MgPerL, _) => true,
            (MethodKind::Disc, Unit::Mm, Comparison::InverseForDisc) => true,
            (MethodKind::Disc, Unit::Mm, _) => false,
            _ => false,
        };
        if !ok {
            violations.push(SchemaViolation {
                path: PathBuf::new(),
                reason: format!(
                    "breakpoint for {} {} ({:?}) has an inconsistent comparator/unit combination: {:?}/{:?}",
                    entry.antibiotic, entry.organism_scope_debug(), entry.method, entry.comparator, entry.unit
                ),
                source_code: String::new(),
                span: None,
            });
        }
    }

    // At most one entry per (scope, antibiotic, method, source).
    let mut seen = std::collections::HashSet::new();
    for entry in &catalog.breakpoints {
        let key = (
            format!("{:?}", entry.organism_scope),
            entry.antibiotic.clone(),
            entry.method,
            entry.source,
        );
        if !seen.insert(key) {
            violations.push(SchemaViolation {
                path: PathBuf::new(),
                reason: format!(
                    "duplicate breakpoint entry for {} / {:?} / {:?} from source {:?}",
                    entry.antibiotic, entry.organism_scope, entry.method, entry.source
                ),
                source_code: String::new(),
                span: None,
            });
        }
    }

    // Expert-rule antibiotic-class references must resolve to non-empty sets.
    for rule in &catalog.expert_rules {
        if let Some(class) = &rule.when.antibiotic_class {
            match catalog.antibiotics_in_class(class) {
                None | Some(_) if catalog.antibiotics_in_class(class).map_or(true, |s| s.is_empty()) => {
                    semantic.push(SemanticError {
                        kind: "unknown-antibiotic-class".to_owned(),
                        detail: format!("rule {} references undefined or empty class {class:?}", rule.id),
                    });
                }
                _ => {}
            }
        }
        if let Some(class) = &rule.effect.applies_to {
            if catalog.antibiotics_in_class(class).map_or(true, |s| s.is_empty()) {
                semantic.push(SemanticError {
                    kind: "unknown-antibiotic-class".to_owned(),
                    detail: format!("rule {} effect references undefined or empty class {class:?}", rule.id),
                });
            }
        }
    }
    for rule in &catalog.intrinsic_resistance {
        if let Some(class) = &rule.antibiotic_class {
            if catalog.antibiotics_in_class(class).map_or(true, |s| s.is_empty()) {
                semantic.push(SemanticError {
                    kind: "unknown-antibiotic-class".to_owned(),
                    detail: format!(
                        "intrinsic rule {} references undefined or empty class {class:?}",
                        rule.id
                    ),
                });
            }
        }
    }

    // Organism groups must be acyclic.
    for group in catalog.organism_groups.keys() {
        if catalog.expand_group(group).is_none() {
            semantic.push(SemanticError {
                kind: "cyclic-organism-group".to_owned(),
                detail: format!("organism group {group:?} is part of a reference cycle"),
            });
        }
    }

    if !violations.is_empty() {
        return Err(LoadError::SchemaViolation { violations });
    }
    if !semantic.is_empty() {
        return Err(LoadError::SemanticError { errors: semantic });
    }
    Ok(())
}

impl BreakpointEntry {
    fn organism_scope_debug(&self) -> String {
        format!("{:?}", self.organism_scope)
    }
}

/// The process-wide, hot-reloadable catalog snapshot.
///
/// `current()` never blocks on a concurrent `reload()`; a reload either
/// publishes a brand-new, fully-validated catalog or leaves the live one
/// completely untouched.
pub struct CatalogStore {
    current: ArcSwap<RuleCatalog>,
    /// Serializes concurrent reloads -- at most one parse+validate+publish
    /// runs at a time (mirrors the teacher's `Mutex<CacheState>` treatment
    /// of concurrent cache writers in `storage.rs`).
    reload_lock: AsyncMutex<()>,
}

impl CatalogStore {
    /// Load the initial catalog from `path`. Fails if `path` doesn't parse
    /// or validate; there is no "empty but running" state.
    pub fn load(path: &Path) -> Result<Self, LoadError> {
        let catalog = load_catalog(path)?;
        info!(version = %catalog.version_label, "loaded rule catalog");
        Ok(CatalogStore {
            current: ArcSwap::from_pointee(catalog),
            reload_lock: AsyncMutex::new(()),
        })
    }

    /// Construct a store directly from an already-validated catalog
    /// (used by tests and by the native/dry-run CLI path).
    pub fn from_catalog(catalog: RuleCatalog) -> Self {
        CatalogStore {
            current: ArcSwap::from_pointee(catalog),
            reload_lock: AsyncMutex::new(()),
        }
    }

    /// The currently published snapshot. Cheap, lock-free, never blocks.
    pub fn current(&self) -> Arc<RuleCatalog> {
        self.current.load_full()
    }

    /// Parse, validate, and atomically publish a new catalog from `path`.
    /// On any failure the live snapshot is left untouched.
    #[instrument(skip(self), fields(path = %path.display()))]
    pub async fn reload(&self, path: &Path) -> Result<String, LoadError> {
        let _guard = self.reload_lock.lock().await;
        let catalog = load_catalog(path)?;
        let version = catalog.version_label.clone();
        self.current.store(Arc::new(catalog));
        info!(version = %version, "published new rule catalog");
        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_tmp(dir: &tempfile::TempDir, name: &str, contents: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn loads_minimal_toml_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_tmp(
            &dir,
            "catalog.toml",
            r#"
            version = "EUCAST-2025.1"

            [[breakpoints]]
            antibiotic = "Amoxicillin"
            method = "Mic"
            source = "Eucast"
            version-label = "EUCAST-2025.1"
            s-threshold = 8.0
            r-threshold = 8.0
            comparator = "LeSGeR"
            unit = "MgPerL"
            [breakpoints.organism-scope]
            scope = "any"
            "#,
        );
        let catalog = load_catalog(&path).expect("should load");
        assert_eq!(catalog.version_label, "EUCAST-2025.1");
        assert_eq!(catalog.breakpoints.len(), 1);
    }

    #[test]
    fn rejects_mismatched_comparator_unit() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_tmp(
            &dir,
            "catalog.toml",
            r#"
            version = "bad"

            [[breakpoints]]
            antibiotic = "Amoxicillin"
            method = "Mic"
            source = "Eucast"
            version-label = "bad"
            s-threshold = 8.0
            r-threshold = 8.0
            comparator = "InverseForDisc"
            unit = "MgPerL"
            [breakpoints.organism-scope]
            scope = "any"
            "#,
        );
        let err = load_catalog(&path).unwrap_err();
        assert!(matches!(err, LoadError::SchemaViolation { .. }));
    }

    #[test]
    fn detects_cyclic_organism_groups() {
        let mut catalog = RuleCatalog::default();
        catalog.organism_groups.insert(
            "a".to_owned(),
            [crate::format::GroupMember::GroupRef("b".to_owned())].into(),
        );
        catalog.organism_groups.insert(
            "b".to_owned(),
            [crate::format::GroupMember::GroupRef("a".to_owned())].into(),
        );
        let err = validate(&catalog).unwrap_err();
        assert!(matches!(err, LoadError::SemanticError { .. }));
    }

    #[test]
    fn reload_never_publishes_invalid_catalog() {
        let store = CatalogStore::from_catalog(RuleCatalog {
            version_label: "v1".to_owned(),
            ..Default::default()
        });
        let bad_dir = tempfile::tempdir().unwrap();
        let bad_path = write_tmp(&bad_dir, "bad.toml", "version = \"v2\"\nnot valid toml structure [[[");
        let rt = tokio::runtime::Runtime::new().unwrap();
        let result = rt.block_on(store.reload(&bad_path));
        assert!(result.is_err());
        assert_eq!(store.current().version_label, "v1");
    }
}
