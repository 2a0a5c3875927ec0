//! CLI command implementations.

use clap::Args;

use environment_catalog::CellFilter;
use matrix_shared_types::{Architecture, IdentitySelection, LibcVariant};

pub mod definition;
pub mod list;
pub mod run;

/// Matrix selection shared by `run` and `list`. Repeat a flag or separate
/// values with commas to select several.
#[derive(Args, Debug, Clone, Default)]
pub struct FilterArgs {
    /// Distribution name, e.g. ubuntu
    #[arg(long = "distro", value_delimiter = ',')]
    pub distributions: Vec<String>,

    /// Distribution version, e.g. 22.04
    #[arg(long = "version", value_delimiter = ',')]
    pub versions: Vec<String>,

    /// Architecture: x86_64 or aarch64
    #[arg(long = "arch", value_delimiter = ',')]
    pub architectures: Vec<Architecture>,

    /// libc variant: glibc or musl
    #[arg(long = "libc", value_delimiter = ',')]
    pub libc_variants: Vec<LibcVariant>,

    /// Identities to test: root, user or both
    #[arg(long, default_value = "both")]
    pub identity: IdentitySelection,
}

impl FilterArgs {
    pub fn to_filter(&self) -> CellFilter {
        CellFilter {
            distributions: self.distributions.clone(),
            versions: self.versions.clone(),
            architectures: self.architectures.clone(),
            libc_variants: self.libc_variants.clone(),
            identities: self.identity,
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        filter: FilterArgs,
    }

    #[test]
    fn test_filter_flags() {
        let harness = Harness::parse_from([
            "install-matrix",
            "--distro",
            "ubuntu,debian",
            "--arch",
            "amd64",
            "--libc",
            "musl",
            "--identity",
            "user",
        ]);
        let filter = harness.filter.to_filter();
        assert_eq!(filter.distributions, vec!["ubuntu", "debian"]);
        assert_eq!(filter.architectures, vec![Architecture::X86_64]);
        assert_eq!(filter.libc_variants, vec![LibcVariant::Musl]);
        assert_eq!(filter.identities, IdentitySelection::User);
        assert!(filter.versions.is_empty());
    }

    #[test]
    fn test_identity_defaults_to_both() {
        let harness = Harness::parse_from(["install-matrix"]);
        assert_eq!(harness.filter.identity, IdentitySelection::Both);
    }
}
