//! Terminal output helpers.

use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

use crate::OutputFormat;

pub fn success(message: &str) {
    eprintln!("{} {}", "✓".green().bold(), message);
}

pub fn info(message: &str) {
    eprintln!("{} {}", "→".blue(), message);
}

pub fn warn(message: &str) {
    eprintln!("{} {}", "!".yellow().bold(), message.yellow());
}

pub fn error(message: &str) {
    eprintln!("{} {}", "✗".red().bold(), message.red());
}

/// Section heading on stdout.
pub fn section(title: &str) {
    println!();
    println!("{}", title.bold().underline());
}

/// Print rows as a table or as a JSON array.
pub fn print_data<T: Tabled + Serialize>(rows: &[T], format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Table => {
            if rows.is_empty() {
                println!("  {}", "(none)".dimmed());
            } else {
                println!("{}", Table::new(rows).with(Style::rounded()));
            }
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(rows)?),
    }
    Ok(())
}
