use std::path::Path;

use anyhow::{Context, Result};

use stagewise_engine::config::parser;
use stagewise_engine::config::validator;
use stagewise_engine::orchestrator;

/// Execute the `check` command: validate config, target store and state database.
pub fn execute(pipeline_path: &Path) -> Result<()> {
    // 1. Parse pipeline YAML
    let config = parser::parse_pipeline(pipeline_path)
        .with_context(|| format!("Failed to parse pipeline: {}", pipeline_path.display()))?;

    // 2. Validate pipeline structure
    validator::validate_pipeline(&config)?;
    println!("Pipeline structure: OK ({} stages)", config.stages.len());

    // 3. Open store and state
    let result = orchestrator::check_pipeline(&config, pipeline_path.parent())?;

    // 4. Report results
    for warning in &result.warnings {
        println!("Warning:            {warning}");
    }
    print_status("Target store:", result.store_ok);
    print_status("State backend:", result.state_ok);

    if result.is_ok() {
        println!("\nAll checks passed.");
        Ok(())
    } else {
        anyhow::bail!("One or more checks failed")
    }
}

fn print_status(label: &str, ok: bool) {
    println!("{label:18} {}", if ok { "OK" } else { "FAILED" });
}
