//! Canonical advisory records shared by every backend.
//!
//! Vendor collaborators produce `Definition` values in this shape; the relational store splits them
//! across joined tables and the key-value store keeps them as self-contained JSON blobs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::meta::zero_time;

/// One advisory / vulnerability entry of a snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Definition {
    /// Source-scoped identifier, unique only within its source file
    #[serde(default)]
    pub definition_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub advisory: Advisory,
    /// Debian/Ubuntu cross-reference
    #[serde(default)]
    pub debian: Option<Debian>,
    #[serde(default)]
    pub affected_packs: Vec<Package>,
    #[serde(default)]
    pub references: Vec<Reference>,
}

impl Definition {
    /// Identifier used when a definition has to be keyed without a database id.
    ///
    /// Some feeds omit the definition id, the title is the closest stable substitute.
    pub fn key(&self) -> &str {
        if self.definition_id.is_empty() {
            &self.title
        } else {
            &self.definition_id
        }
    }

    pub fn cve_ids(&self) -> impl Iterator<Item = &str> {
        self.advisory.cves.iter().map(|c| c.cve_id.as_str())
    }

    pub fn affects(&self, package_name: &str) -> bool {
        self.affected_packs.iter().any(|p| p.name == package_name)
    }
}

/// Severity, CVE and CPE details of a definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Advisory {
    #[serde(default)]
    pub severity: String,
    #[serde(default)]
    pub cves: Vec<Cve>,
    #[serde(default)]
    pub bugzillas: Vec<Bugzilla>,
    #[serde(default)]
    pub affected_cpe_list: Vec<Cpe>,
    #[serde(default = "zero_time")]
    pub issued: DateTime<Utc>,
    #[serde(default = "zero_time")]
    pub updated: DateTime<Utc>,
}

impl Default for Advisory {
    fn default() -> Self {
        Self {
            severity: String::new(),
            cves: Vec::new(),
            bugzillas: Vec::new(),
            affected_cpe_list: Vec::new(),
            issued: zero_time(),
            updated: zero_time(),
        }
    }
}

/// CVE record; the CVSS and CWE fields are only filled by RedHat feeds
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cve {
    pub cve_id: String,
    #[serde(default)]
    pub cvss2: String,
    #[serde(default)]
    pub cvss3: String,
    #[serde(default)]
    pub cwe: String,
    #[serde(default)]
    pub impact: String,
    #[serde(default)]
    pub href: String,
    #[serde(default)]
    pub public: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bugzilla {
    #[serde(default)]
    pub bugzilla_id: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub title: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cpe {
    pub cpe: String,
}

/// Affected package
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Package {
    pub name: String,
    /// Affected earlier than this version, in the vendor's own syntax
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub arch: String,
    /// Ubuntu: no fixed version published yet
    #[serde(default)]
    pub not_fixed_yet: bool,
    /// RHEL8+ module stream, e.g. `nodejs:12`
    #[serde(default)]
    pub modularity_label: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub ref_id: String,
    #[serde(default)]
    pub ref_url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Debian {
    #[serde(default)]
    pub cve_id: String,
    #[serde(default)]
    pub more_info: String,
}
