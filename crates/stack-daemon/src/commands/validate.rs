use crate::OutputFormat;
use anyhow::{Context, Result};
use comfy_table::Table;
use std::path::Path;

pub fn run(config_path: &Path, format: OutputFormat) -> Result<()> {
    let config = stack_config::parse_file(config_path)
        .with_context(|| format!("Failed to parse {}", config_path.display()))?;
    let resolver = stack_config::build_graph(&config).context("Invalid dependency graph")?;

    let all: std::collections::BTreeSet<String> = config.services.keys().cloned().collect();
    let batches = resolver.start_batches(&all);

    if format == OutputFormat::Json {
        let summary = serde_json::json!({
            "name": config.name,
            "services": config.services.len(),
            "groups": resolver.groups(),
            "start_batches": batches,
        });
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!("✓ {} is valid", config_path.display());
    if let Some(name) = &config.name {
        println!("  Stack: {}", name);
    }
    println!("  Services: {}", config.services.len());

    let mut table = Table::new();
    table.set_header(vec!["GROUP", "SERVICES"]);
    for (group, services) in resolver.groups() {
        table.add_row(vec![group, services.join(", ")]);
    }
    println!("{}", table);
    println!("  Full start order: {} batches", batches.len());
    Ok(())
}
