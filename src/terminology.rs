//! Maps arbitrary organism/antibiotic designators -- coded or free-text --
//! to the canonical [`OrganismKey`]/[`AntibioticKey`] the rest of the
//! engine reasons about. Normalization is pure given a catalog snapshot and
//! the oracle cache; the oracle itself is consulted only as a last resort.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, instrument, warn};

use crate::errors::OracleError;
use crate::format::AntibioticKey;
use crate::format::OrganismKey;

/// The `(system?, code?, display?)` triple a caller presents for lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct TerminologyQuery {
    pub system: Option<String>,
    pub code: Option<String>,
    pub display: Option<String>,
}

impl TerminologyQuery {
    pub fn coded(system: impl Into<String>, code: impl Into<String>) -> Self {
        TerminologyQuery {
            system: Some(system.into()),
            code: Some(code.into()),
            display: None,
        }
    }

    pub fn display(display: impl Into<String>) -> Self {
        TerminologyQuery {
            system: None,
            code: None,
            display: Some(display.into()),
        }
    }
}

/// The oracle's answer for one query: the canonical key it resolved to, a
/// display string, and whether it considers the code currently valid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OracleResponse {
    pub canonical_key: String,
    pub display: String,
    pub valid: bool,
}

/// External terminology validation collaborator (spec §6.3). Consulted only
/// when the coded table and offline alias table both miss. Never fatal --
/// [`TerminologyNormalizer`] treats any [`OracleError`] the same as a clean
/// "not found" and falls back to `Unresolved`.
#[async_trait]
pub trait TerminologyOracle: Send + Sync {
    async fn lookup(&self, query: &TerminologyQuery) -> Result<Option<OracleResponse>, OracleError>;
}

/// No-op oracle for offline-only deployments: every query misses.
pub struct NullOracle;

#[async_trait]
impl TerminologyOracle for NullOracle {
    async fn lookup(&self, _query: &TerminologyQuery) -> Result<Option<OracleResponse>, OracleError> {
        Ok(None)
    }
}

/// An oracle backed by a terminology service reachable over HTTP -- a FHIR
/// `$lookup`-shaped endpoint in practice. Queried as `GET {base_url}/lookup`
/// with the populated fields of [`TerminologyQuery`] as query parameters;
/// expects a JSON body shaped like [`OracleResponse`], or `204 No Content`
/// for a clean miss.
pub struct HttpTerminologyOracle {
    client: reqwest::Client,
    base_url: url::Url,
}

impl HttpTerminologyOracle {
    pub fn new(base_url: url::Url) -> Self {
        HttpTerminologyOracle {
            client: reqwest::Client::new(),
            base_url,
        }
    }
}

#[derive(serde::Deserialize)]
struct OracleResponseBody {
    canonical_key: String,
    display: String,
    valid: bool,
}

#[async_trait]
impl TerminologyOracle for HttpTerminologyOracle {
    async fn lookup(&self, query: &TerminologyQuery) -> Result<Option<OracleResponse>, OracleError> {
        let mut request = self.client.get(self.base_url.join("lookup").map_err(|e| OracleError::Transport(e.to_string()))?);
        if let Some(system) = &query.system {
            request = request.query(&[("system", system)]);
        }
        if let Some(code) = &query.code {
            request = request.query(&[("code", code)]);
        }
        if let Some(display) = &query.display {
            request = request.query(&[("display", display)]);
        }

        let response = request.send().await.map_err(|e| OracleError::Transport(e.to_string()))?;
        if response.status() == reqwest::StatusCode::NO_CONTENT {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(OracleError::Transport(format!("oracle returned status {}", response.status())));
        }

        let body: OracleResponseBody = response.json().await.map_err(|e| OracleError::BadResponse(e.to_string()))?;
        Ok(Some(OracleResponse {
            canonical_key: body.canonical_key,
            display: body.display,
            valid: body.valid,
        }))
    }
}

/// A tiny hand-rolled LRU keyed by the normalized query, scoped to the
/// catalog's lifetime (cleared on reload by constructing a fresh
/// [`TerminologyNormalizer`]). Mirrors the plain `Mutex`-guarded cache state
/// the catalog store itself uses -- the critical section here is just as
/// small, so there's no reason to reach for anything lock-free.
struct LruCache {
    capacity: usize,
    map: HashMap<TerminologyQuery, OrganismOrAntibiotic>,
    order: VecDeque<TerminologyQuery>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum OrganismOrAntibiotic {
    Organism(OrganismKey),
    Antibiotic(AntibioticKey),
}

impl LruCache {
    fn new(capacity: usize) -> Self {
        LruCache {
            capacity,
            map: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&mut self, key: &TerminologyQuery) -> Option<OrganismOrAntibiotic> {
        if let Some(value) = self.map.get(key).cloned() {
            self.order.retain(|k| k != key);
            self.order.push_back(key.clone());
            Some(value)
        } else {
            None
        }
    }

    fn insert(&mut self, key: TerminologyQuery, value: OrganismOrAntibiotic) {
        if self.map.insert(key.clone(), value).is_some() {
            self.order.retain(|k| k != &key);
        } else if self.map.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.map.remove(&oldest);
            }
        }
        self.order.push_back(key);
    }
}

/// Normalizes organism and antibiotic designators to canonical keys.
///
/// Pure given `(catalog snapshot, oracle cache)`: the same query against the
/// same catalog and a cache in the same state always returns the same key.
pub struct TerminologyNormalizer {
    oracle: Arc<dyn TerminologyOracle>,
    oracle_timeout: Duration,
    cache: Mutex<LruCache>,
}

impl TerminologyNormalizer {
    pub fn new(oracle: Arc<dyn TerminologyOracle>, oracle_timeout: Duration, cache_capacity: usize) -> Self {
        TerminologyNormalizer {
            oracle,
            oracle_timeout,
            cache: Mutex::new(LruCache::new(cache_capacity)),
        }
    }

    /// An offline-only normalizer with a default cache size, useful for
    /// tests and dry-run tooling that never configures an oracle.
    pub fn offline(cache_capacity: usize) -> Self {
        TerminologyNormalizer::new(Arc::new(NullOracle), Duration::from_secs(2), cache_capacity)
    }

    #[instrument(skip(self, query), fields(display = ?query.display))]
    pub async fn normalize_organism(&self, query: &TerminologyQuery) -> OrganismKey {
        if let Some(hit) = self.cached(query) {
            if let OrganismOrAntibiotic::Organism(key) = hit {
                return key;
            }
        }

        if let Some(key) = coded_organism_lookup(query) {
            self.remember(query, OrganismOrAntibiotic::Organism(key.clone()));
            return key;
        }

        let normalized = query.display.as_deref().map(normalize_display);
        if let Some(normalized) = &normalized {
            if let Some(key) = organism_alias_table().get(normalized.as_str()) {
                let key = OrganismKey::new(key.to_string());
                self.remember(query, OrganismOrAntibiotic::Organism(key.clone()));
                return key;
            }
        }

        match self.consult_oracle(query).await {
            Some(response) => {
                let key = OrganismKey::new(response.canonical_key);
                self.remember(query, OrganismOrAntibiotic::Organism(key.clone()));
                key
            }
            None => OrganismKey::unresolved(),
        }
    }

    #[instrument(skip(self, query), fields(display = ?query.display))]
    pub async fn normalize_antibiotic(&self, query: &TerminologyQuery) -> AntibioticKey {
        if let Some(hit) = self.cached(query) {
            if let OrganismOrAntibiotic::Antibiotic(key) = hit {
                return key;
            }
        }

        if let Some(key) = coded_antibiotic_lookup(query) {
            self.remember(query, OrganismOrAntibiotic::Antibiotic(key.clone()));
            return key;
        }

        let normalized = query.display.as_deref().map(normalize_display);
        if let Some(normalized) = &normalized {
            if let Some(key) = antibiotic_alias_table().get(normalized.as_str()) {
                let key = AntibioticKey::new(key.to_string());
                self.remember(query, OrganismOrAntibiotic::Antibiotic(key.clone()));
                return key;
            }
        }

        match self.consult_oracle(query).await {
            Some(response) => {
                let key = AntibioticKey::new(response.canonical_key);
                self.remember(query, OrganismOrAntibiotic::Antibiotic(key.clone()));
                key
            }
            None => AntibioticKey::unresolved(),
        }
    }

    fn cached(&self, query: &TerminologyQuery) -> Option<OrganismOrAntibiotic> {
        self.cache.lock().unwrap().get(query)
    }

    fn remember(&self, query: &TerminologyQuery, value: OrganismOrAntibiotic) {
        self.cache.lock().unwrap().insert(query.clone(), value);
    }

    async fn consult_oracle(&self, query: &TerminologyQuery) -> Option<OracleResponse> {
        match tokio::time::timeout(self.oracle_timeout, self.oracle.lookup(query)).await {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                warn!(error = %err, "terminology oracle call failed, falling back to unresolved");
                None
            }
            Err(_) => {
                warn!("terminology oracle call timed out, falling back to unresolved");
                None
            }
        }
    }
}

/// Recognized coded systems for organism identification: SNOMED CT and
/// LOINC carry organism codes in practice; this table holds a handful of
/// common entries used by the offline path before any oracle is consulted.
fn coded_organism_lookup(query: &TerminologyQuery) -> Option<OrganismKey> {
    let system = query.system.as_deref()?;
    let code = query.code.as_deref()?;
    let table = organism_code_table();
    table.get(&(system.to_owned(), code.to_owned())).map(|s| OrganismKey::new(s.clone()))
}

fn coded_antibiotic_lookup(query: &TerminologyQuery) -> Option<AntibioticKey> {
    let system = query.system.as_deref()?;
    let code = query.code.as_deref()?;
    let table = antibiotic_code_table();
    table.get(&(system.to_owned(), code.to_owned())).map(|s| AntibioticKey::new(s.clone()))
}

const SNOMED_CT: &str = "http://snomed.info/sct";
const RXNORM: &str = "http://www.nlm.nih.gov/research/umls/rxnorm";
const ATC: &str = "http://www.whocc.no/atc";

fn organism_code_table() -> &'static HashMap<(String, String), String> {
    static TABLE: OnceLock<HashMap<(String, String), String>> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut m = HashMap::new();
        m.insert((SNOMED_CT.to_owned(), "112283007".to_owned()), "Escherichia coli".to_owned());
        m.insert((SNOMED_CT.to_owned(), "113961009".to_owned()), "Staphylococcus aureus".to_owned());
        m.insert((SNOMED_CT.to_owned(), "52499004".to_owned()), "Pseudomonas aeruginosa".to_owned());
        m.insert((SNOMED_CT.to_owned(), "90274004".to_owned()), "Klebsiella pneumoniae".to_owned());
        m.insert((SNOMED_CT.to_owned(), "78065002".to_owned()), "Enterococcus faecium".to_owned());
        m.insert((SNOMED_CT.to_owned(), "90272006".to_owned()), "Enterococcus faecalis".to_owned());
        m
    })
}

fn antibiotic_code_table() -> &'static HashMap<(String, String), String> {
    static TABLE: OnceLock<HashMap<(String, String), String>> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut m = HashMap::new();
        m.insert((RXNORM.to_owned(), "723".to_owned()), "Amoxicillin".to_owned());
        m.insert((RXNORM.to_owned(), "2231".to_owned()), "Ceftriaxone".to_owned());
        m.insert((RXNORM.to_owned(), "1665".to_owned()), "Ceftazidime".to_owned());
        m.insert((RXNORM.to_owned(), "7984".to_owned()), "Oxacillin".to_owned());
        m.insert((RXNORM.to_owned(), "2582".to_owned()), "Clindamycin".to_owned());
        m.insert((RXNORM.to_owned(), "9997".to_owned()), "Vancomycin".to_owned());
        m.insert((ATC.to_owned(), "J01CA04".to_owned()), "Amoxicillin".to_owned());
        m
    })
}

/// Offline alias table consulted after display-string normalization and
/// before any oracle call. Keys are already normalized.
fn organism_alias_table() -> &'static HashMap<&'static str, &'static str> {
    static TABLE: OnceLock<HashMap<&'static str, &'static str>> = OnceLock::new();
    TABLE.get_or_init(|| {
        HashMap::from([
            ("escherichia coli", "Escherichia coli"),
            ("e coli", "Escherichia coli"),
            ("e. coli", "Escherichia coli"),
            ("staphylococcus aureus", "Staphylococcus aureus"),
            ("s aureus", "Staphylococcus aureus"),
            ("pseudomonas aeruginosa", "Pseudomonas aeruginosa"),
            ("p aeruginosa", "Pseudomonas aeruginosa"),
            ("klebsiella pneumoniae", "Klebsiella pneumoniae"),
            ("k pneumoniae", "Klebsiella pneumoniae"),
            ("enterococcus faecium", "Enterococcus faecium"),
            ("enterococcus faecalis", "Enterococcus faecalis"),
        ])
    })
}

fn antibiotic_alias_table() -> &'static HashMap<&'static str, &'static str> {
    static TABLE: OnceLock<HashMap<&'static str, &'static str>> = OnceLock::new();
    TABLE.get_or_init(|| {
        HashMap::from([
            ("amoxicillin", "Amoxicillin"),
            ("ceftriaxone", "Ceftriaxone"),
            ("ceftazidime", "Ceftazidime"),
            ("oxacillin", "Oxacillin"),
            ("cefoxitin", "Cefoxitin"),
            ("clindamycin", "Clindamycin"),
            ("erythromycin", "Erythromycin"),
            ("vancomycin", "Vancomycin"),
            ("ertapenem", "Ertapenem"),
            ("meropenem", "Meropenem"),
            ("imipenem", "Imipenem"),
        ])
    })
}

/// Trims, lowercases, folds whitespace, strips punctuation, and removes a
/// handful of common taxonomic qualifiers ("sp.", "group", "spp.") that
/// don't change the organism's identity for breakpoint purposes.
pub fn normalize_display(display: &str) -> String {
    let lowered = display.trim().to_lowercase();
    let mut folded = String::with_capacity(lowered.len());
    let mut last_was_space = false;
    for c in lowered.chars() {
        if c.is_whitespace() {
            if !last_was_space {
                folded.push(' ');
            }
            last_was_space = true;
        } else if c.is_ascii_punctuation() && c != '-' {
            // drop punctuation but keep hyphens inside compound names
            continue;
        } else {
            folded.push(c);
            last_was_space = false;
        }
    }

    let mut words: Vec<&str> = folded.trim().split(' ').filter(|w| !w.is_empty()).collect();
    words.retain(|w| !matches!(*w, "sp" | "spp" | "group"));
    words.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_display_strips_qualifiers_and_punctuation() {
        assert_eq!(normalize_display("  Escherichia  coli. "), "escherichia coli");
        assert_eq!(normalize_display("Streptococcus sp."), "streptococcus");
        assert_eq!(normalize_display("Salmonella Group D"), "salmonella d");
    }

    #[tokio::test]
    async fn coded_lookup_hits_before_oracle() {
        let normalizer = TerminologyNormalizer::offline(16);
        let key = normalizer
            .normalize_organism(&TerminologyQuery::coded(SNOMED_CT, "112283007"))
            .await;
        assert_eq!(key, OrganismKey::new("Escherichia coli"));
    }

    #[tokio::test]
    async fn unresolved_when_nothing_matches() {
        let normalizer = TerminologyNormalizer::offline(16);
        let key = normalizer.normalize_organism(&TerminologyQuery::display("Xyzbacter novus")).await;
        assert!(key.is_unresolved());
    }

    #[tokio::test]
    async fn alias_table_normalizes_display_variants() {
        let normalizer = TerminologyNormalizer::offline(16);
        let key = normalizer.normalize_organism(&TerminologyQuery::display("E. coli")).await;
        assert_eq!(key, OrganismKey::new("Escherichia coli"));
    }
}
