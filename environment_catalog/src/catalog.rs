//! Distribution catalog and matrix expansion.

use std::collections::{BTreeSet, HashSet};

use serde::{Deserialize, Serialize};

use matrix_shared_types::{
    Architecture, DistributionSpec, IdentitySelection, LibcVariant, MatrixCell, PackageFamily,
};

use crate::CatalogError;

/// User-supplied narrowing of the matrix. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellFilter {
    #[serde(default)]
    pub distributions: Vec<String>,
    #[serde(default)]
    pub versions: Vec<String>,
    #[serde(default)]
    pub architectures: Vec<Architecture>,
    #[serde(default)]
    pub libc_variants: Vec<LibcVariant>,
    #[serde(default)]
    pub identities: IdentitySelection,
}

/// A cell the catalog produced, either runnable or skipped with a reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlannedCell {
    Run(MatrixCell),
    Skip { cell: MatrixCell, reason: String },
}

impl PlannedCell {
    pub fn cell(&self) -> &MatrixCell {
        match self {
            PlannedCell::Run(cell) => cell,
            PlannedCell::Skip { cell, .. } => cell,
        }
    }
}

/// The set of distributions under test.
#[derive(Debug, Clone)]
pub struct Catalog {
    entries: Vec<DistributionSpec>,
}

impl Catalog {
    /// Build a catalog, rejecting duplicate releases and empty support sets.
    pub fn new(entries: Vec<DistributionSpec>) -> Result<Self, CatalogError> {
        let mut seen = HashSet::new();
        for entry in &entries {
            if !seen.insert((entry.name.to_ascii_lowercase(), entry.version.clone())) {
                return Err(CatalogError::Duplicate {
                    name: entry.name.clone(),
                    version: entry.version.clone(),
                });
            }
            if entry.architectures.is_empty() || entry.libc_variants.is_empty() {
                return Err(CatalogError::Invalid(format!(
                    "{} supports no architecture/libc combination",
                    entry.slug()
                )));
            }
        }
        Ok(Self { entries })
    }

    /// The built-in distribution list.
    pub fn builtin() -> Self {
        Self {
            entries: builtin_distributions(),
        }
    }

    /// Built-in entries followed by `extra`.
    pub fn with_extra(extra: Vec<DistributionSpec>) -> Result<Self, CatalogError> {
        let mut entries = builtin_distributions();
        entries.extend(extra);
        Self::new(entries)
    }

    pub fn entries(&self) -> &[DistributionSpec] {
        &self.entries
    }

    pub fn find(&self, name: &str, version: &str) -> Option<&DistributionSpec> {
        self.entries
            .iter()
            .find(|e| e.name.eq_ignore_ascii_case(name) && e.version == version)
    }

    /// Expand the catalog against a filter.
    ///
    /// Without architecture/libc filters only supported combinations are
    /// produced. Explicitly requested combinations a release does not
    /// support come back as [`PlannedCell::Skip`]. A filter that selects no
    /// release at all is an error.
    pub fn list_cells(&self, filter: &CellFilter) -> Result<Vec<PlannedCell>, CatalogError> {
        let selected: Vec<&DistributionSpec> = self
            .entries
            .iter()
            .filter(|e| {
                filter.distributions.is_empty()
                    || filter.distributions.iter().any(|d| d.eq_ignore_ascii_case(&e.name))
            })
            .filter(|e| filter.versions.is_empty() || filter.versions.contains(&e.version))
            .collect();

        if selected.is_empty() {
            return Err(CatalogError::NoMatch {
                filter: describe(filter),
                available: self.entries.iter().map(DistributionSpec::slug).collect(),
            });
        }

        let mut cells = Vec::new();
        for spec in selected {
            let explicit = !filter.architectures.is_empty() || !filter.libc_variants.is_empty();
            let archs: BTreeSet<Architecture> = if filter.architectures.is_empty() {
                spec.architectures.clone()
            } else {
                filter.architectures.iter().copied().collect()
            };
            let libcs: BTreeSet<LibcVariant> = if filter.libc_variants.is_empty() {
                spec.libc_variants.clone()
            } else {
                filter.libc_variants.iter().copied().collect()
            };

            for &arch in &archs {
                for &libc in &libcs {
                    let supported = spec.supports(arch, libc);
                    if !supported && !explicit {
                        continue;
                    }
                    for &identity in filter.identities.identities() {
                        let cell = MatrixCell {
                            distribution: spec.name.clone(),
                            version: spec.version.clone(),
                            architecture: arch,
                            libc,
                            identity,
                        };
                        if supported {
                            cells.push(PlannedCell::Run(cell));
                        } else {
                            cells.push(PlannedCell::Skip {
                                cell,
                                reason: format!("{} does not support {}/{}", spec.slug(), arch, libc),
                            });
                        }
                    }
                }
            }
        }

        Ok(cells)
    }
}

fn describe(filter: &CellFilter) -> String {
    let mut parts = Vec::new();
    if !filter.distributions.is_empty() {
        parts.push(format!("distribution={}", filter.distributions.join(",")));
    }
    if !filter.versions.is_empty() {
        parts.push(format!("version={}", filter.versions.join(",")));
    }
    if parts.is_empty() {
        "(empty catalog)".to_string()
    } else {
        parts.join(" ")
    }
}

fn spec(
    name: &str,
    version: &str,
    base_image: &str,
    family: PackageFamily,
    architectures: &[Architecture],
    libc_variants: &[LibcVariant],
) -> DistributionSpec {
    let bootstrap: &[&str] = match family {
        PackageFamily::Apt => &["unzip", "sudo", "ca-certificates"],
        PackageFamily::Yum => &["unzip", "sudo", "shadow-utils", "findutils"],
        PackageFamily::Apk => &["unzip", "sudo", "bash", "shadow"],
    };
    DistributionSpec {
        name: name.to_string(),
        version: version.to_string(),
        architectures: architectures.iter().copied().collect(),
        libc_variants: libc_variants.iter().copied().collect(),
        base_image: base_image.to_string(),
        package_family: family,
        bootstrap_packages: bootstrap.iter().map(|p| p.to_string()).collect(),
    }
}

/// Releases the installer is expected to work on.
pub fn builtin_distributions() -> Vec<DistributionSpec> {
    use Architecture::{Aarch64, X86_64};
    use LibcVariant::{Glibc, Musl};
    use PackageFamily::{Apk, Apt, Yum};

    let both_arch = &[X86_64, Aarch64];
    let both_libc = &[Glibc, Musl];

    vec![
        // Ubuntu
        spec("ubuntu", "24.04", "ubuntu:24.04", Apt, both_arch, both_libc),
        spec("ubuntu", "22.04", "ubuntu:22.04", Apt, both_arch, both_libc),
        spec("ubuntu", "20.04", "ubuntu:20.04", Apt, &[X86_64], both_libc),
        // Debian
        spec("debian", "12", "debian:12", Apt, both_arch, both_libc),
        spec("debian", "11", "debian:11", Apt, &[X86_64], both_libc),
        // Amazon Linux
        spec("amazonlinux", "2023", "amazonlinux:2023", Yum, both_arch, both_libc),
        spec("amazonlinux", "2", "amazonlinux:2", Yum, &[X86_64], &[Glibc]),
        // Rocky Linux
        spec("rockylinux", "9", "rockylinux:9", Yum, both_arch, both_libc),
        spec("rockylinux", "8", "rockylinux:8", Yum, both_arch, &[Glibc]),
        // Fedora
        spec("fedora", "39", "fedora:39", Yum, &[X86_64], both_libc),
        spec("fedora", "38", "fedora:38", Yum, &[X86_64], both_libc),
        // Alpine
        spec("alpine", "3.19", "alpine:3.19", Apk, both_arch, &[Musl]),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use matrix_shared_types::Identity;

    #[test]
    fn test_builtin_catalog_is_valid() {
        let entries = builtin_distributions();
        assert!(Catalog::new(entries).is_ok());
    }

    #[test]
    fn test_filter_by_distribution_is_case_insensitive() {
        let catalog = Catalog::builtin();
        let filter = CellFilter {
            distributions: vec!["Alpine".to_string()],
            identities: IdentitySelection::Root,
            ..Default::default()
        };
        let cells = catalog.list_cells(&filter).unwrap();
        assert_eq!(cells.len(), 2);
        assert!(cells.iter().all(|c| matches!(c, PlannedCell::Run(_))));
        assert!(cells.iter().all(|c| c.cell().libc == LibcVariant::Musl));
    }

    #[test]
    fn test_both_identities_root_first() {
        let catalog = Catalog::builtin();
        let filter = CellFilter {
            distributions: vec!["ubuntu".to_string()],
            versions: vec!["22.04".to_string()],
            architectures: vec![Architecture::X86_64],
            libc_variants: vec![LibcVariant::Glibc],
            identities: IdentitySelection::Both,
        };
        let cells = catalog.list_cells(&filter).unwrap();
        let identities: Vec<Identity> = cells.iter().map(|c| c.cell().identity).collect();
        assert_eq!(identities, vec![Identity::Root, Identity::User]);
    }

    #[test]
    fn test_unsupported_combination_is_skipped() {
        let catalog = Catalog::builtin();
        let filter = CellFilter {
            distributions: vec!["alpine".to_string()],
            libc_variants: vec![LibcVariant::Glibc],
            identities: IdentitySelection::Root,
            ..Default::default()
        };
        let cells = catalog.list_cells(&filter).unwrap();
        assert_eq!(cells.len(), 2);
        for planned in cells {
            match planned {
                PlannedCell::Skip { reason, .. } => assert!(reason.contains("alpine-3.19")),
                PlannedCell::Run(cell) => panic!("unexpected runnable cell {cell}"),
            }
        }
    }

    #[test]
    fn test_no_match_is_an_error() {
        let catalog = Catalog::builtin();
        let filter = CellFilter {
            distributions: vec!["ubunto".to_string()],
            ..Default::default()
        };
        let err = catalog.list_cells(&filter).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("ubunto"));
        assert!(message.contains("ubuntu-22.04"));
    }

    #[test]
    fn test_duplicate_entries_rejected() {
        let extra = builtin_distributions().into_iter().take(1).collect();
        assert!(matches!(
            Catalog::with_extra(extra),
            Err(CatalogError::Duplicate { .. })
        ));
    }

    #[test]
    fn test_extra_entry_is_listed() {
        let extra = vec![spec(
            "opensuse",
            "15.5",
            "opensuse/leap:15.5",
            PackageFamily::Yum,
            &[Architecture::X86_64],
            &[LibcVariant::Glibc],
        )];
        let catalog = Catalog::with_extra(extra).unwrap();
        let filter = CellFilter {
            distributions: vec!["opensuse".to_string()],
            ..Default::default()
        };
        assert_eq!(catalog.list_cells(&filter).unwrap().len(), 2);
    }
}
