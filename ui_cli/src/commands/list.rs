//! List command - show the cells a filter selects.

use clap::Args;
use serde::Serialize;
use tabled::Tabled;

use environment_catalog::{Catalog, PlannedCell};

use super::FilterArgs;
use crate::config::FileConfig;
use crate::error::{Result, EXIT_OK};
use crate::output::{self, print_data, section};
use crate::OutputFormat;

/// Arguments for the list command.
#[derive(Args)]
pub struct ListArgs {
    #[command(flatten)]
    filter: FilterArgs,

    /// Output format
    #[arg(long, value_enum, default_value = "table")]
    format: OutputFormat,
}

#[derive(Debug, Serialize, Tabled)]
struct CellRow {
    #[tabled(rename = "Cell")]
    label: String,
    #[tabled(rename = "Plan")]
    plan: &'static str,
    #[tabled(rename = "Note")]
    note: String,
}

impl From<&PlannedCell> for CellRow {
    fn from(planned: &PlannedCell) -> Self {
        match planned {
            PlannedCell::Run(cell) => Self {
                label: cell.label(),
                plan: "run",
                note: String::new(),
            },
            PlannedCell::Skip { cell, reason } => Self {
                label: cell.label(),
                plan: "skip",
                note: reason.clone(),
            },
        }
    }
}

/// Execute the list command.
pub fn execute(args: ListArgs, config: FileConfig) -> Result<u8> {
    let catalog = Catalog::with_extra(config.distributions)?;
    let planned = catalog.list_cells(&args.filter.to_filter())?;

    let rows: Vec<CellRow> = planned.iter().map(CellRow::from).collect();
    if args.format == OutputFormat::Table {
        section("Cells");
    }
    print_data(&rows, args.format)?;

    let runnable = planned.iter().filter(|p| matches!(p, PlannedCell::Run(_))).count();
    output::info(&format!(
        "{} cell(s) selected, {} would run",
        planned.len(),
        runnable
    ));
    Ok(EXIT_OK)
}
