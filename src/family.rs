//! OS family and release normalization
//!
//! Every stored snapshot is keyed by a canonical (family, version) partition. Vendors name their
//! releases inconsistently (`8.4`, `16.04.3`, `2018.03`, `2 (Karoo)`), so each family carries its
//! own rule for collapsing a raw release string into the partition version, and its own
//! post-filters for query results.

use chrono::NaiveDate;
use std::fmt;

use crate::error::FamilyError;

/// Supported OS families, after alias resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    Debian,
    Ubuntu,
    RedHat,
    Oracle,
    Fedora,
    Epel,
    Amazon,
    Alpine,
    OpenSuse,
    OpenSuseLeap,
    SuseEnterpriseServer,
    SuseEnterpriseDesktop,
}

/// Accepted family names. Aliases map onto the family whose feed they share.
const FAMILY_NAMES: &[(&str, Family)] = &[
    ("debian", Family::Debian),
    ("raspbian", Family::Debian),
    ("ubuntu", Family::Ubuntu),
    ("redhat", Family::RedHat),
    ("centos", Family::RedHat),
    ("oracle", Family::Oracle),
    ("fedora", Family::Fedora),
    ("epel", Family::Epel),
    ("amazon", Family::Amazon),
    ("alpine", Family::Alpine),
    ("opensuse", Family::OpenSuse),
    ("opensuse.leap", Family::OpenSuseLeap),
    ("suse.linux.enterprise.server", Family::SuseEnterpriseServer),
    ("suse.linux.enterprise.desktop", Family::SuseEnterpriseDesktop),
];

/// Amazon Linux releases that are stored under their own partition
const AMAZON_RELEASES: &[&str] = &["1", "2", "2022", "2023"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VersionRule {
    Major,
    MajorMinor,
    AmazonRelease,
}

impl Family {
    /// Resolve a family name or alias, case-insensitively.
    pub fn lookup(name: &str) -> Result<Family, FamilyError> {
        let wanted = name.trim().to_lowercase();
        FAMILY_NAMES
            .iter()
            .find(|(n, _)| *n == wanted)
            .map(|(_, f)| *f)
            .ok_or_else(|| FamilyError::UnknownFamily(name.to_string()))
    }

    /// Canonical family name used in partition keys
    pub fn as_str(self) -> &'static str {
        match self {
            Family::Debian => "debian",
            Family::Ubuntu => "ubuntu",
            Family::RedHat => "redhat",
            Family::Oracle => "oracle",
            Family::Fedora => "fedora",
            Family::Epel => "epel",
            Family::Amazon => "amazon",
            Family::Alpine => "alpine",
            Family::OpenSuse => "opensuse",
            Family::OpenSuseLeap => "opensuse.leap",
            Family::SuseEnterpriseServer => "suse.linux.enterprise.server",
            Family::SuseEnterpriseDesktop => "suse.linux.enterprise.desktop",
        }
    }

    fn version_rule(self) -> VersionRule {
        match self {
            Family::Debian | Family::RedHat | Family::Oracle | Family::Fedora | Family::Epel => {
                VersionRule::Major
            }
            Family::Ubuntu
            | Family::Alpine
            | Family::OpenSuse
            | Family::OpenSuseLeap
            | Family::SuseEnterpriseServer
            | Family::SuseEnterpriseDesktop => VersionRule::MajorMinor,
            Family::Amazon => VersionRule::AmazonRelease,
        }
    }

    /// Collapse a raw release string into this family's partition version.
    pub fn normalize_version(self, raw: &str) -> Result<String, FamilyError> {
        let raw = raw.trim();
        let version = match self.version_rule() {
            VersionRule::Major => major(raw).to_string(),
            VersionRule::MajorMinor => major_minor(raw),
            VersionRule::AmazonRelease => amazon_release(raw).unwrap_or_default().to_string(),
        };

        if version.is_empty() {
            return Err(FamilyError::InvalidVersion {
                family: self.as_str().to_string(),
                version: raw.to_string(),
            });
        }
        Ok(version)
    }

    /// Families whose feeds list one package entry per architecture
    pub fn filters_by_arch(self) -> bool {
        matches!(
            self,
            Family::Amazon | Family::Oracle | Family::Fedora | Family::Epel
        )
    }

    /// Families whose definitions carry fixed versions for several major releases at once
    pub fn filters_by_major_suffix(self) -> bool {
        matches!(self, Family::RedHat)
    }

    /// Families whose feeds repeat the same definition id across source files
    pub fn dedupes_by_definition_id(self) -> bool {
        matches!(
            self,
            Family::OpenSuse
                | Family::OpenSuseLeap
                | Family::SuseEnterpriseServer
                | Family::SuseEnterpriseDesktop
        )
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical (family, version) key of one stored snapshot
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Partition {
    pub family: Family,
    pub version: String,
}

impl Partition {
    pub fn family_name(&self) -> &'static str {
        self.family.as_str()
    }

    /// Major release component, used by the RedHat suffix filter
    pub fn major(&self) -> &str {
        major(&self.version)
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.family, self.version)
    }
}

/// Resolve a raw (family, version) pair into its canonical partition.
pub fn normalize(family: &str, raw_version: &str) -> Result<Partition, FamilyError> {
    let family = Family::lookup(family)?;
    let version = family.normalize_version(raw_version)?;
    Ok(Partition { family, version })
}

fn major(version: &str) -> &str {
    version.split('.').next().unwrap_or_default()
}

fn major_minor(version: &str) -> String {
    let parts: Vec<&str> = version.split('.').collect();
    if parts.len() < 3 {
        return version.to_string();
    }
    parts[..2].join(".")
}

/// `2 (Karoo)` -> `2`, `2018.03` -> `1`
fn amazon_release(version: &str) -> Option<&'static str> {
    let token = version.split_whitespace().next()?;
    if let Some(release) = AMAZON_RELEASES.iter().find(|r| **r == token) {
        return Some(*release);
    }
    if is_dated_release(token) {
        return Some("1");
    }
    None
}

/// Amazon Linux 1 releases are named `yyyy.MM`.
fn is_dated_release(token: &str) -> bool {
    token.len() == 7 && NaiveDate::parse_from_str(&format!("{token}.01"), "%Y.%m.%d").is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn norm(family: &str, version: &str) -> (String, String) {
        let p = normalize(family, version).expect("Failed to normalize");
        (p.family_name().to_string(), p.version)
    }

    fn pair(family: &str, version: &str) -> (String, String) {
        (family.to_string(), version.to_string())
    }

    #[test]
    fn test_normalize_major_families() {
        assert_eq!(norm("debian", "10.9"), pair("debian", "10"));
        assert_eq!(norm("redhat", "8.4"), pair("redhat", "8"));
        assert_eq!(norm("oracle", "7.9"), pair("oracle", "7"));
        assert_eq!(norm("fedora", "35"), pair("fedora", "35"));
        assert_eq!(norm("epel", "8.5"), pair("epel", "8"));
    }

    #[test]
    fn test_normalize_major_minor_families() {
        assert_eq!(norm("ubuntu", "16.04.3"), pair("ubuntu", "16.04"));
        assert_eq!(norm("ubuntu", "20.04"), pair("ubuntu", "20.04"));
        assert_eq!(norm("alpine", "3.15.4"), pair("alpine", "3.15"));
        assert_eq!(norm("alpine", "3.15"), pair("alpine", "3.15"));
        assert_eq!(norm("opensuse.leap", "15.3.1"), pair("opensuse.leap", "15.3"));
        assert_eq!(
            norm("suse.linux.enterprise.server", "12.5"),
            pair("suse.linux.enterprise.server", "12.5")
        );
    }

    #[test]
    fn test_normalize_tumbleweed_literal() {
        assert_eq!(norm("opensuse", "tumbleweed"), pair("opensuse", "tumbleweed"));
    }

    #[test]
    fn test_normalize_aliases() {
        assert_eq!(norm("raspbian", "11.2"), pair("debian", "11"));
        assert_eq!(norm("centos", "7.9.2009"), pair("redhat", "7"));
        assert_eq!(norm("CentOS", "8"), pair("redhat", "8"));
    }

    #[test]
    fn test_normalize_amazon() {
        assert_eq!(norm("amazon", "2018.03"), pair("amazon", "1"));
        assert_eq!(norm("amazon", "2"), pair("amazon", "2"));
        assert_eq!(norm("amazon", "2 (Karoo)"), pair("amazon", "2"));
        assert_eq!(norm("amazon", "2022"), pair("amazon", "2022"));
        assert_eq!(norm("amazon", "2023"), pair("amazon", "2023"));
        assert_eq!(norm("amazon", "1"), pair("amazon", "1"));
    }

    #[test]
    fn test_normalize_amazon_unknown_release() {
        let err = normalize("amazon", "karoo").unwrap_err();
        assert!(matches!(err, FamilyError::InvalidVersion { .. }));

        assert!(normalize("amazon", "2018.13").is_err());
        assert!(normalize("amazon", "3").is_err());
    }

    #[test]
    fn test_normalize_unknown_family() {
        let err = normalize("windows", "10").unwrap_err();
        assert_eq!(err, FamilyError::UnknownFamily("windows".to_string()));

        assert!(normalize("suse.openstack.cloud", "9").is_err());
    }

    #[test]
    fn test_normalize_empty_version() {
        assert!(normalize("debian", "").is_err());
        assert!(normalize("ubuntu", "  ").is_err());
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let cases = [
            ("debian", "10.9"),
            ("raspbian", "11"),
            ("ubuntu", "16.04.3"),
            ("redhat", "8.4"),
            ("centos", "7.9.2009"),
            ("oracle", "8.5"),
            ("fedora", "36"),
            ("epel", "7"),
            ("amazon", "2018.03"),
            ("amazon", "2 (Karoo)"),
            ("alpine", "3.16.2"),
            ("opensuse", "tumbleweed"),
            ("opensuse.leap", "15.4.0"),
            ("suse.linux.enterprise.desktop", "15.1"),
        ];

        for (family, version) in cases {
            let once = normalize(family, version).expect("Failed to normalize");
            let twice =
                normalize(once.family_name(), &once.version).expect("Failed to renormalize");
            assert_eq!(once, twice, "{family} {version}");
        }
    }

    #[test]
    fn test_family_behaviour_flags() {
        assert!(Family::Amazon.filters_by_arch());
        assert!(Family::Oracle.filters_by_arch());
        assert!(!Family::Debian.filters_by_arch());

        assert!(Family::RedHat.filters_by_major_suffix());
        assert!(!Family::Oracle.filters_by_major_suffix());

        assert!(Family::OpenSuseLeap.dedupes_by_definition_id());
        assert!(!Family::Ubuntu.dedupes_by_definition_id());
    }

    #[test]
    fn test_partition_major_and_display() {
        let p = normalize("redhat", "8.4").unwrap();
        assert_eq!(p.major(), "8");
        assert_eq!(p.to_string(), "redhat 8");
    }
}
