//! Associates standalone organism identifications and phenotype flags with
//! the susceptibility measurements that lack them, within one specimen.
//!
//! Implemented as a group-by on specimen followed by a small join, not a
//! back-patching mutation pass over shared input objects -- every
//! [`ClassificationInput`] produced here is a fresh, owned value.

use std::collections::HashMap;

use crate::format::{ClassificationInput, Measurement, OrganismKey, SortedSet};

/// Partitions `inputs` by specimen, merges organism identifications and
/// phenotype flags into sibling susceptibility measurements, and drops the
/// now-redundant organism-only/phenotype-only carrier records.
///
/// Every returned input either carries a concrete organism or the
/// `Unresolved` sentinel -- never `None` -- so gating can treat "no organism
/// in the partition" the same as "organism not recognized".
pub fn group(inputs: Vec<ClassificationInput>) -> Vec<ClassificationInput> {
    let mut order = Vec::new();
    let mut by_specimen: HashMap<_, Vec<ClassificationInput>> = HashMap::new();
    for input in inputs {
        let specimen = input.specimen.clone();
        if !by_specimen.contains_key(&specimen) {
            order.push(specimen.clone());
        }
        by_specimen.entry(specimen).or_default().push(input);
    }

    let mut results = Vec::new();
    for specimen in order {
        results.extend(group_partition(by_specimen.remove(&specimen).unwrap()));
    }
    results
}

fn group_partition(partition: Vec<ClassificationInput>) -> Vec<ClassificationInput> {
    let mut organisms: SortedSet<OrganismKey> = SortedSet::new();
    let mut phenotypes = SortedSet::new();
    let mut measurements = Vec::new();

    for input in partition {
        if let Measurement::Phenotype { flag } = &input.value {
            phenotypes.insert(flag.clone());
        }
        if input.is_organism_only() {
            if let Some(organism) = &input.organism {
                if !input.phenotypes.is_empty() {
                    phenotypes.extend(input.phenotypes.iter().cloned());
                }
                if !matches!(input.value, Measurement::Phenotype { .. }) {
                    organisms.insert(organism.clone());
                }
            }
            continue;
        }
        measurements.push(input);
    }

    let mut out = Vec::with_capacity(measurements.len());
    for mut input in measurements {
        input.phenotypes.extend(phenotypes.iter().cloned());

        if input.organism.is_some() {
            out.push(input);
            continue;
        }

        match organisms.len() {
            0 => {
                input.organism = Some(OrganismKey::unresolved());
                out.push(input);
            }
            1 => {
                input.organism = organisms.iter().next().cloned();
                out.push(input);
            }
            _ => {
                for organism in &organisms {
                    let mut duplicate = input.clone();
                    duplicate.organism = Some(organism.clone());
                    duplicate
                        .auxiliary
                        .insert("ambiguous-organism".to_owned(), "true".to_owned());
                    out.push(duplicate);
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{AntibioticKey, MethodKind, PhenotypeFlag, SpecimenRef};

    fn mic(specimen: &str, organism: Option<&str>, antibiotic: &str, value: f64) -> ClassificationInput {
        ClassificationInput {
            specimen: SpecimenRef(specimen.to_owned()),
            organism: organism.map(OrganismKey::new),
            antibiotic: Some(AntibioticKey::new(antibiotic)),
            method: MethodKind::Mic,
            value: Measurement::Mic {
                value: Some(value),
                comparator: None,
            },
            phenotypes: SortedSet::new(),
            auxiliary: Default::default(),
        }
    }

    fn organism_only(specimen: &str, organism: &str) -> ClassificationInput {
        ClassificationInput {
            specimen: SpecimenRef(specimen.to_owned()),
            organism: Some(OrganismKey::new(organism)),
            antibiotic: None,
            method: MethodKind::Screen,
            value: Measurement::Screen {
                result: crate::format::ScreenResult::Positive,
            },
            phenotypes: SortedSet::new(),
            auxiliary: Default::default(),
        }
    }

    fn phenotype_only(specimen: &str, flag: PhenotypeFlag) -> ClassificationInput {
        ClassificationInput {
            specimen: SpecimenRef(specimen.to_owned()),
            organism: None,
            antibiotic: None,
            method: MethodKind::Phenotype,
            value: Measurement::Phenotype { flag },
            phenotypes: SortedSet::new(),
            auxiliary: Default::default(),
        }
    }

    #[test]
    fn assigns_unique_organism_to_organism_less_measurement() {
        let inputs = vec![organism_only("S1", "Escherichia coli"), mic("S1", None, "Amoxicillin", 4.0)];
        let grouped = group(inputs);
        assert_eq!(grouped.len(), 1);
        assert_eq!(grouped[0].organism, Some(OrganismKey::new("Escherichia coli")));
    }

    #[test]
    fn duplicates_on_ambiguous_organism() {
        let inputs = vec![
            organism_only("S1", "Escherichia coli"),
            organism_only("S1", "Klebsiella pneumoniae"),
            mic("S1", None, "Amoxicillin", 4.0),
        ];
        let grouped = group(inputs);
        assert_eq!(grouped.len(), 2);
        assert!(grouped.iter().all(|i| i.auxiliary.get("ambiguous-organism").map(String::as_str) == Some("true")));
    }

    #[test]
    fn merges_phenotype_flags_into_siblings() {
        let inputs = vec![phenotype_only("S1", PhenotypeFlag::Esbl), mic("S1", Some("Escherichia coli"), "Ceftazidime", 1.0)];
        let grouped = group(inputs);
        assert_eq!(grouped.len(), 1);
        assert!(grouped[0].phenotypes.contains(&PhenotypeFlag::Esbl));
    }

    #[test]
    fn unresolved_when_no_organism_in_partition() {
        let grouped = group(vec![mic("S1", None, "Amoxicillin", 4.0)]);
        assert_eq!(grouped.len(), 1);
        assert!(grouped[0].organism.as_ref().unwrap().is_unresolved());
    }
}
