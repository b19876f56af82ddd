//! Backend-agnostic post-filtering of query results
//!
//! Both backends hand their raw definitions to [`post_filter`], so architecture scoping, the RedHat
//! release-suffix heuristic and definition-id deduplication behave identically whatever the store.

use std::collections::HashSet;

use crate::family::Partition;
use crate::models::{Definition, Package};

/// What a query was keyed on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup<'a> {
    Package(&'a str),
    Cve(&'a str),
}

/// Treat an empty architecture the same as no architecture.
pub fn requested_arch(arch: Option<&str>) -> Option<&str> {
    arch.map(str::trim).filter(|a| !a.is_empty())
}

/// Apply the partition family's filters to definitions read from a backend.
pub fn post_filter(
    partition: &Partition,
    lookup: Lookup<'_>,
    arch: Option<&str>,
    defs: Vec<Definition>,
) -> Vec<Definition> {
    let family = partition.family;
    let arch = requested_arch(arch).filter(|_| family.filters_by_arch());

    let mut defs: Vec<Definition> = defs
        .into_iter()
        .map(|mut def| {
            if let Some(arch) = arch {
                def.affected_packs = filter_by_arch(def.affected_packs, arch);
            }
            if family.filters_by_major_suffix() {
                def.affected_packs = filter_by_major_suffix(def.affected_packs, partition.major());
            }
            def
        })
        .collect();

    if let Lookup::Package(name) = lookup {
        defs.retain(|def| def.affects(name));
    }

    if family.dedupes_by_definition_id() {
        defs = dedupe_by_definition_id(defs);
    }
    defs
}

pub fn filter_by_arch(packs: Vec<Package>, arch: &str) -> Vec<Package> {
    packs.into_iter().filter(|p| p.arch == arch).collect()
}

/// Keep packages whose fixed version belongs to the given RHEL major (`.el7`, `.module+el8...`).
///
/// One RedHat definition can list fixed versions for several majors and the partition join cannot
/// tell them apart. This is a substring heuristic, not a version comparison.
pub fn filter_by_major_suffix(packs: Vec<Package>, major: &str) -> Vec<Package> {
    let el = format!(".el{major}");
    let module = format!(".module+el{major}");
    packs
        .into_iter()
        .filter(|p| p.version.contains(&el) || p.version.contains(&module))
        .collect()
}

/// Drop repeated definitions, keeping the first occurrence of each key.
pub fn dedupe_by_definition_id(defs: Vec<Definition>) -> Vec<Definition> {
    let mut seen = HashSet::new();
    defs.into_iter()
        .filter(|def| seen.insert(def.key().to_string()))
        .collect()
}
