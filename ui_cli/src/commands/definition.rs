//! Definition command - print the generated container definition.

use clap::Args;
use serde::Serialize;

use environment_catalog::{Catalog, DefinitionGenerator};
use matrix_shared_types::{Architecture, EnvironmentDefinition};

use crate::config::FileConfig;
use crate::error::{CliError, Result, EXIT_OK};
use crate::output::section;
use crate::OutputFormat;

/// Arguments for the definition command.
#[derive(Args)]
pub struct DefinitionArgs {
    /// Distribution name
    #[arg(long = "distro")]
    distribution: String,

    /// Distribution version
    #[arg(long)]
    version: String,

    /// Target architecture
    #[arg(long, default_value = "x86_64")]
    arch: Architecture,

    /// Output format
    #[arg(long, value_enum, default_value = "table")]
    format: OutputFormat,
}

#[derive(Serialize)]
struct DefinitionReport<'a> {
    tag: String,
    containerfile: String,
    definition: &'a EnvironmentDefinition,
}

/// Execute the definition command.
pub fn execute(args: DefinitionArgs, config: FileConfig) -> Result<u8> {
    let catalog = Catalog::with_extra(config.distributions)?;
    let spec = catalog
        .find(&args.distribution, &args.version)
        .ok_or_else(|| {
            CliError::Usage(format!(
                "{} {} is not in the catalog (try `install-matrix list`)",
                args.distribution, args.version
            ))
        })?;
    if !spec.architectures.contains(&args.arch) {
        return Err(CliError::Usage(format!(
            "{} does not support {}",
            spec.slug(),
            args.arch
        )));
    }

    let definition = DefinitionGenerator::new(config.orchestrator.test_user).generate(spec, args.arch);
    let tag = definition.image_tag().to_string();
    let containerfile = definition.render();

    match args.format {
        OutputFormat::Table => {
            section(&format!("{} ({})", tag, definition.platform));
            print!("{}", containerfile);
            for injection in &definition.injections {
                section(&format!("{} (mode {:o})", injection.path, injection.mode));
                print!("{}", injection.contents);
            }
        }
        OutputFormat::Json => {
            let report = DefinitionReport {
                tag,
                containerfile,
                definition: &definition,
            };
            println!("{}", serde_json::to_string_pretty(&report).map_err(anyhow::Error::from)?);
        }
    }
    Ok(EXIT_OK)
}
