//! The data model shared by every component of the classification engine:
//! normalized keys, measurements, breakpoint/rule catalog contents, and the
//! result types emitted at the end of the pipeline.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

// Collections based on how we're using them, so it's easy to swap out later.
pub type SortedMap<K, V> = BTreeMap<K, V>;
pub type SortedSet<T> = BTreeSet<T>;

////////////////////////////////////////////////////////////////////////////////////
//                                                                                //
//                                normalized keys                                 //
//                                                                                //
////////////////////////////////////////////////////////////////////////////////////

/// Canonical opaque identifier of a microbial taxon.
///
/// Two inputs that normalize to the same key are considered the same
/// organism regardless of how they were originally spelled or coded.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrganismKey(pub String);

impl OrganismKey {
    pub fn new(s: impl Into<String>) -> Self {
        OrganismKey(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The sentinel returned when normalization could not resolve a key.
    pub fn unresolved() -> Self {
        OrganismKey("Unresolved".to_owned())
    }

    pub fn is_unresolved(&self) -> bool {
        self.0 == "Unresolved"
    }

    /// The taxonomic genus, derived as the first whitespace-delimited token.
    pub fn genus(&self) -> &str {
        self.0.split(' ').next().unwrap_or(&self.0)
    }
}

impl fmt::Display for OrganismKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Canonical opaque identifier of an antimicrobial agent, derived
/// analogously to [`OrganismKey`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AntibioticKey(pub String);

impl AntibioticKey {
    pub fn new(s: impl Into<String>) -> Self {
        AntibioticKey(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn unresolved() -> Self {
        AntibioticKey("Unresolved".to_owned())
    }

    pub fn is_unresolved(&self) -> bool {
        self.0 == "Unresolved"
    }
}

impl fmt::Display for AntibioticKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

////////////////////////////////////////////////////////////////////////////////////
//                                                                                //
//                              measurements & methods                           //
//                                                                                //
////////////////////////////////////////////////////////////////////////////////////

/// Which value field a [`ClassificationInput`] is expected to carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MethodKind {
    #[serde(rename = "MIC")]
    Mic,
    #[serde(rename = "DISC")]
    Disc,
    #[serde(rename = "SCREEN")]
    Screen,
    #[serde(rename = "PHENOTYPE")]
    Phenotype,
    #[serde(rename = "GRADIENT")]
    Gradient,
}

impl fmt::Display for MethodKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            MethodKind::Mic => "MIC",
            MethodKind::Disc => "DISC",
            MethodKind::Screen => "SCREEN",
            MethodKind::Phenotype => "PHENOTYPE",
            MethodKind::Gradient => "GRADIENT",
        };
        f.write_str(s)
    }
}

/// Result of a screen-type assay (e.g. cefoxitin screen, chromogenic agar).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScreenResult {
    #[serde(rename = "POSITIVE")]
    Positive,
    #[serde(rename = "NEGATIVE")]
    Negative,
    #[serde(rename = "INDETERMINATE")]
    Indeterminate,
}

/// A phenotypic flag carried alongside (or standing in for) a measurement.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PhenotypeFlag {
    Esbl,
    AmpC,
    Carbapenemase(Option<String>),
    Mrsa,
    Mssa,
    Vre,
    Vse,
    InducibleClinda,
}

/// A comparator prefix carried over from a method that reports bounded
/// rather than exact values (e.g. HL7 `<=0.25`, `>32`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparator {
    Eq,
    Le,
    Lt,
    Ge,
    Gt,
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Comparator::Eq => "",
            Comparator::Le => "<=",
            Comparator::Lt => "<",
            Comparator::Ge => ">=",
            Comparator::Gt => ">",
        };
        f.write_str(s)
    }
}

/// A tagged union of the value a susceptibility test can report. The
/// variant must agree with the originating [`MethodKind`] -- this is an
/// invariant enforced by [`crate::gating`], not by the type system, because
/// the value commonly arrives missing (e.g. no `valueQuantity`) and that
/// absence must be observable rather than silently coerced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Measurement {
    Mic {
        /// micrograms per millilitre
        value: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        comparator: Option<Comparator>,
    },
    Disc {
        /// zone diameter, millimetres
        value: Option<i64>,
    },
    Screen {
        result: ScreenResult,
    },
    Phenotype {
        flag: PhenotypeFlag,
    },
}

impl Measurement {
    /// The [`MethodKind`] this measurement variant corresponds to.
    pub fn method_kind(&self) -> MethodKind {
        match self {
            Measurement::Mic { .. } => MethodKind::Mic,
            Measurement::Disc { .. } => MethodKind::Disc,
            Measurement::Screen { .. } => MethodKind::Screen,
            Measurement::Phenotype { .. } => MethodKind::Phenotype,
        }
    }

    /// Whether this measurement agrees in variant with the given method.
    /// `GRADIENT` (Etest-style MIC strips) reports as a MIC value.
    pub fn agrees_with(&self, method: MethodKind) -> bool {
        match (self, method) {
            (Measurement::Mic { .. }, MethodKind::Mic | MethodKind::Gradient) => true,
            (Measurement::Disc { .. }, MethodKind::Disc) => true,
            (Measurement::Screen { .. }, MethodKind::Screen) => true,
            (Measurement::Phenotype { .. }, MethodKind::Phenotype) => true,
            _ => false,
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////
//                                                                                //
//                              classification input                             //
//                                                                                //
////////////////////////////////////////////////////////////////////////////////////

/// Opaque specimen/isolate reference. If absent on ingestion, the adapter or
/// grouper assigns a synthetic value derived from input position.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SpecimenRef(pub String);

impl SpecimenRef {
    pub fn synthetic(index: usize) -> Self {
        SpecimenRef(format!("synthetic-specimen-{index}"))
    }
}

impl fmt::Display for SpecimenRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single normalized record ready for gating and classification.
///
/// `organism` may be `None` only transiently, for organism-only carrier
/// records that the grouper merges into sibling susceptibility inputs and
/// then drops; every input that reaches [`crate::gating`] has an organism,
/// possibly the `Unresolved` sentinel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationInput {
    pub specimen: SpecimenRef,
    pub organism: Option<OrganismKey>,
    pub antibiotic: Option<AntibioticKey>,
    pub method: MethodKind,
    pub value: Measurement,
    #[serde(default)]
    pub phenotypes: SortedSet<PhenotypeFlag>,
    #[serde(default)]
    pub auxiliary: SortedMap<String, String>,
}

impl ClassificationInput {
    /// True for a record that only carries an organism identification or a
    /// phenotype flag and has no antibiotic measurement of its own -- these
    /// are merged into siblings during grouping, not classified directly.
    pub fn is_organism_only(&self) -> bool {
        self.antibiotic.is_none()
    }
}

////////////////////////////////////////////////////////////////////////////////////
//                                                                                //
//                                   decisions                                    //
//                                                                                //
////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Decision {
    #[serde(rename = "S")]
    Susceptible,
    #[serde(rename = "I")]
    SusceptibleIncreasedExposure,
    #[serde(rename = "R")]
    Resistant,
    #[serde(rename = "RR")]
    ResistantRare,
    #[serde(rename = "Requires Review")]
    RequiresReview,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Decision::Susceptible => "S",
            Decision::SusceptibleIncreasedExposure => "I",
            Decision::Resistant => "R",
            Decision::ResistantRare => "RR",
            Decision::RequiresReview => "Requires Review",
        };
        f.write_str(s)
    }
}

/// The result of classifying one [`ClassificationInput`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub specimen: SpecimenRef,
    pub organism: Option<OrganismKey>,
    pub antibiotic: Option<AntibioticKey>,
    pub method: MethodKind,
    pub input: ClassificationInput,
    pub decision: Decision,
    pub reason: String,
    #[serde(rename = "fired-rules")]
    pub fired_rules: Vec<String>,
    #[serde(rename = "catalog-version")]
    pub catalog_version: String,
}

////////////////////////////////////////////////////////////////////////////////////
//                                                                                //
//                            breakpoints & rule catalog                         //
//                                                                                //
////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BreakpointSource {
    #[serde(rename = "EUCAST")]
    Eucast,
    #[serde(rename = "CLSI")]
    Clsi,
    #[serde(rename = "LOCAL")]
    Local,
}

impl fmt::Display for BreakpointSource {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            BreakpointSource::Eucast => "EUCAST",
            BreakpointSource::Clsi => "CLSI",
            BreakpointSource::Local => "LOCAL",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparison {
    /// `value <= S` is Susceptible, `value > R` is Resistant (standard MIC).
    LeSGeR,
    /// Like `LeSGeR` but Resistant is `> R` strictly (kept distinct so a
    /// catalog can be explicit about which boundary convention it uses).
    LeSGtR,
    /// Susceptible at `<= S`, Intermediate up to and including `I`,
    /// Resistant strictly above `I`.
    LeSLeIGtR,
    /// DISC semantics: larger zones are more susceptible.
    InverseForDisc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Unit {
    #[serde(rename = "MG_PER_L")]
    MgPerL,
    #[serde(rename = "MM")]
    Mm,
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Unit::MgPerL => "mg/L",
            Unit::Mm => "mm",
        };
        f.write_str(s)
    }
}

/// How a [`BreakpointEntry`] or [`ExpertRule`] selects the organisms it
/// applies to. Multiple scopes may match the same organism; the most
/// specific one wins (exact > group > genus).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "scope", content = "value", rename_all = "kebab-case")]
pub enum OrganismScope {
    Exact(OrganismKey),
    Group(String),
    Genus(String),
    /// Matches every organism; used by broad intrinsic-resistance and
    /// default expert rules.
    Any,
}

impl OrganismScope {
    /// Specificity rank used to break ties when more than one scope
    /// matches; higher wins.
    pub fn specificity(&self) -> u8 {
        match self {
            OrganismScope::Exact(_) => 3,
            OrganismScope::Group(_) => 2,
            OrganismScope::Genus(_) => 1,
            OrganismScope::Any => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RareResistance {
    /// The additional margin above `R_threshold` (in the breakpoint's
    /// unit) a value must clear before `RR` replaces `R`.
    pub margin: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakpointEntry {
    #[serde(rename = "organism-scope")]
    pub organism_scope: OrganismScope,
    pub antibiotic: AntibioticKey,
    pub method: MethodKind,
    pub source: BreakpointSource,
    #[serde(rename = "version-label")]
    pub version_label: String,
    #[serde(rename = "s-threshold", skip_serializing_if = "Option::is_none")]
    pub s_threshold: Option<f64>,
    #[serde(rename = "i-threshold", skip_serializing_if = "Option::is_none")]
    pub i_threshold: Option<f64>,
    #[serde(rename = "r-threshold", skip_serializing_if = "Option::is_none")]
    pub r_threshold: Option<f64>,
    pub comparator: Comparison,
    pub unit: Unit,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rare_resistance: Option<RareResistance>,
}

/// Organism-scoped declaration that an antibiotic (or antibiotic class) is
/// inherently resistant regardless of measured value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntrinsicRule {
    pub id: String,
    #[serde(rename = "organism-scope")]
    pub organism_scope: OrganismScope,
    /// A specific antibiotic, or a reference into `antibiotic-classes`.
    #[serde(rename = "antibiotic-class", skip_serializing_if = "Option::is_none")]
    pub antibiotic_class: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub antibiotic: Option<AntibioticKey>,
}

/// Predicate matched against a [`ClassificationInput`] (post-grouping, with
/// its organism resolved) to decide whether an [`ExpertRule`] applies.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RulePredicate {
    #[serde(default, rename = "organism-scope", skip_serializing_if = "Option::is_none")]
    pub organism_scope: Option<OrganismScope>,
    #[serde(default, skip_serializing_if = "SortedSet::is_empty")]
    pub phenotypes: SortedSet<PhenotypeFlag>,
    #[serde(default, rename = "antibiotic-set", skip_serializing_if = "SortedSet::is_empty")]
    pub antibiotic_set: SortedSet<AntibioticKey>,
    #[serde(default, rename = "antibiotic-class", skip_serializing_if = "Option::is_none")]
    pub antibiotic_class: Option<String>,
    #[serde(default, rename = "method-set", skip_serializing_if = "SortedSet::is_empty")]
    pub method_set: SortedSet<MethodKind>,
    #[serde(default, rename = "auxiliary-equals", skip_serializing_if = "SortedMap::is_empty")]
    pub auxiliary_equals: SortedMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleEffect {
    pub decision: Decision,
    #[serde(rename = "rationale-template")]
    pub rationale_template: String,
    /// Restrict the effect to an antibiotic class (in addition to whatever
    /// `when.antibiotic_class`/`antibiotic_set` already filtered to).
    #[serde(rename = "applies-to", skip_serializing_if = "Option::is_none")]
    pub applies_to: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpertRule {
    pub id: String,
    pub priority: i64,
    pub when: RulePredicate,
    pub effect: RuleEffect,
    #[serde(default, skip_serializing_if = "SortedSet::is_empty")]
    pub exceptions: SortedSet<AntibioticKey>,
}

/// One member of an `organism-groups` definition: either a leaf organism
/// key or a reference to another named group (validated acyclic at load).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GroupMember {
    Organism(OrganismKey),
    GroupRef(String),
}

/// An immutable, versioned snapshot of every breakpoint, expert rule, and
/// classification policy the engine consults. Constructed once by
/// [`crate::catalog::CatalogStore::reload`] and never mutated afterwards;
/// callers hold an `Arc` for the duration of one request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleCatalog {
    #[serde(rename = "version")]
    pub version_label: String,
    #[serde(default)]
    pub breakpoints: Vec<BreakpointEntry>,
    #[serde(default, rename = "expertRules")]
    pub expert_rules: Vec<ExpertRule>,
    #[serde(default, rename = "intrinsicResistance")]
    pub intrinsic_resistance: Vec<IntrinsicRule>,
    #[serde(default, rename = "organismGroups")]
    pub organism_groups: SortedMap<String, SortedSet<GroupMember>>,
    #[serde(default, rename = "antibioticClasses")]
    pub antibiotic_classes: SortedMap<String, SortedSet<AntibioticKey>>,
    #[serde(default)]
    pub policy: CatalogPolicy,
}

impl RuleCatalog {
    /// Fully expands `group` (following nested group references) into the
    /// set of concrete organism keys it contains. Returns `None` if the
    /// group is undefined. Assumes the catalog already passed acyclicity
    /// validation; a defensive depth cap prevents infinite recursion if it
    /// somehow didn't.
    pub fn expand_group(&self, group: &str) -> Option<SortedSet<OrganismKey>> {
        fn expand(
            catalog: &RuleCatalog,
            group: &str,
            depth: usize,
            out: &mut SortedSet<OrganismKey>,
            seen: &mut SortedSet<String>,
        ) -> bool {
            if depth > 32 || !seen.insert(group.to_owned()) {
                return false;
            }
            let Some(members) = catalog.organism_groups.get(group) else {
                return false;
            };
            for member in members {
                match member {
                    GroupMember::Organism(key) => {
                        out.insert(key.clone());
                    }
                    GroupMember::GroupRef(nested) => {
                        if !expand(catalog, nested, depth + 1, out, seen) {
                            return false;
                        }
                    }
                }
            }
            true
        }

        let mut out = SortedSet::new();
        let mut seen = SortedSet::new();
        if expand(self, group, 0, &mut out, &mut seen) {
            Some(out)
        } else {
            None
        }
    }

    /// Whether `organism` is a (possibly indirect) member of `group`.
    pub fn organism_in_group(&self, organism: &OrganismKey, group: &str) -> bool {
        self.expand_group(group)
            .map(|members| members.contains(organism))
            .unwrap_or(false)
    }

    pub fn antibiotics_in_class(&self, class: &str) -> Option<&SortedSet<AntibioticKey>> {
        self.antibiotic_classes.get(class)
    }

    /// Whether `scope` matches `organism`, consulting group membership as
    /// needed. Does not itself decide specificity among several matching
    /// scopes -- see [`OrganismScope::specificity`] for that.
    pub fn scope_matches(&self, scope: &OrganismScope, organism: &OrganismKey) -> bool {
        match scope {
            OrganismScope::Exact(key) => key == organism,
            OrganismScope::Group(name) => self.organism_in_group(organism, name),
            OrganismScope::Genus(genus) => organism.genus().eq_ignore_ascii_case(genus),
            OrganismScope::Any => true,
        }
    }
}

/// Catalog-configurable policy knobs referenced throughout spec.md as
/// "catalog-configurable" / "policy flag" without a fixed default shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogPolicy {
    /// Default breakpoint source preference, used when a request doesn't
    /// specify one.
    #[serde(rename = "default-source")]
    pub default_source: BreakpointSource,
    /// Fallback order when the preferred source lacks an entry.
    #[serde(rename = "source-fallback-order")]
    pub source_fallback_order: Vec<BreakpointSource>,
    /// Whether conflicting methods resolve via `method-precedence` or
    /// always require review.
    #[serde(rename = "method-precedence")]
    pub method_precedence: Option<Vec<MethodKind>>,
    /// Anti-MRSA cephalosporins exempted from the MRSA beta-lactam override
    /// (spec.md Open Question, resolved per-catalog rather than hardcoded).
    #[serde(rename = "anti-mrsa-cephalosporins")]
    pub anti_mrsa_cephalosporins: SortedSet<AntibioticKey>,
    /// If true, the anti-MRSA exception set is still forced to review
    /// rather than left to plain breakpoint interpretation.
    #[serde(rename = "anti-mrsa-cephalosporins-require-review")]
    pub anti_mrsa_cephalosporins_require_review: bool,
    /// Beta-lactam/inhibitor combinations and carbapenems exempted from the
    /// ESBL beta-lactam override.
    #[serde(rename = "esbl-exceptions")]
    pub esbl_exceptions: SortedSet<AntibioticKey>,
}

impl Default for CatalogPolicy {
    fn default() -> Self {
        CatalogPolicy {
            default_source: BreakpointSource::Eucast,
            source_fallback_order: vec![BreakpointSource::Eucast, BreakpointSource::Clsi],
            method_precedence: Some(vec![MethodKind::Mic, MethodKind::Disc]),
            anti_mrsa_cephalosporins: SortedSet::new(),
            anti_mrsa_cephalosporins_require_review: false,
            esbl_exceptions: SortedSet::new(),
        }
    }
}
