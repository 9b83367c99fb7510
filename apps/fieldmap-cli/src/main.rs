//! fieldmap CLI
//!
//! Command-line front end for the form-field position engine:
//!
//! - `extract` — pull field positions out of a template document
//! - `fill` — render a filled document from stored positions and a values file
//! - `compare` — audit stored positions against a reference set
//! - `templates` — list templates with stored positions
//!
//! Logs go to stderr so that `compare --json` output stays pipeable.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use fieldmap_core::{EngineConfig, FieldValue, FillRequest, PositionEngine};

#[derive(Parser, Debug)]
#[command(name = "fieldmap")]
#[command(about = "Form-field position engine for PDF templates")]
#[command(version)]
struct Cli {
    /// Path to a TOML config file (built-in defaults apply when omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Extract field positions from a template document
    Extract {
        /// Template id the positions are stored under
        template_id: String,

        /// Source document; defaults to {templates_dir}/{template_id}.pdf
        #[arg(short, long)]
        source: Option<PathBuf>,
    },

    /// Render a filled document from stored positions and a values file
    Fill {
        /// Template id to fill
        template_id: String,

        /// JSON file mapping field names to values
        values: PathBuf,

        /// Output path; defaults to {template_id}_filled.pdf
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Compare stored positions against a reference position file
    Compare {
        /// Template id whose stored positions are audited
        template_id: String,

        /// Reference position file to compare against
        reference: PathBuf,

        /// Print the full report as JSON instead of a summary
        #[arg(long)]
        json: bool,
    },

    /// List templates with stored positions
    Templates,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive(log_level.into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = match &cli.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    let engine = PositionEngine::new(config);

    match cli.command {
        Commands::Extract {
            template_id,
            source,
        } => cmd_extract(&engine, &template_id, source),
        Commands::Fill {
            template_id,
            values,
            output,
        } => cmd_fill(&engine, &template_id, &values, output),
        Commands::Compare {
            template_id,
            reference,
            json,
        } => cmd_compare(&engine, &template_id, &reference, json),
        Commands::Templates => cmd_templates(&engine),
    }
}

fn cmd_extract(
    engine: &PositionEngine,
    template_id: &str,
    source: Option<PathBuf>,
) -> anyhow::Result<()> {
    let source = source.unwrap_or_else(|| engine.template_source_path(template_id));
    let result = engine
        .extract(&source, template_id)
        .with_context(|| format!("Extraction failed for {}", source.display()))?;

    if result.has_fields() {
        println!(
            "Extracted {} field(s) across {} page(s) from {}",
            result.fields.len(),
            result.page_count,
            source.display()
        );
        for (name, position) in result.fields.iter() {
            println!(
                "  {}  page {}  ({:.1}, {:.1})  {:.1}x{:.1}mm  [{}]",
                name,
                position.page,
                position.x,
                position.y,
                position.width,
                position.height,
                position.field_type.as_str()
            );
        }
        println!(
            "Saved to {}",
            engine.store().path_for(template_id).display()
        );
    } else {
        println!(
            "No form fields found; rasterized {} of {} page(s) into {}",
            result.background_images.len(),
            result.page_count,
            engine.config().backgrounds_dir.display()
        );
        println!("Author a position file by hand to fill against the backgrounds.");
    }
    Ok(())
}

fn cmd_fill(
    engine: &PositionEngine,
    template_id: &str,
    values_path: &Path,
    output: Option<PathBuf>,
) -> anyhow::Result<()> {
    let content = fs::read_to_string(values_path)
        .with_context(|| format!("Failed to read values file: {}", values_path.display()))?;
    let values: BTreeMap<String, FieldValue> =
        serde_json::from_str(&content).context("Failed to parse values JSON")?;

    let output_path =
        output.unwrap_or_else(|| PathBuf::from(format!("{}_filled.pdf", template_id)));
    let request = FillRequest {
        template_id: template_id.to_string(),
        values,
        output_path,
    };
    let outcome = engine
        .fill(&request)
        .with_context(|| format!("Fill failed for template {}", template_id))?;

    println!(
        "Wrote {} ({} page(s), {} bytes): {} field(s) filled, {} skipped",
        outcome.output_path.display(),
        outcome.page_count,
        outcome.bytes_written,
        outcome.fields_filled,
        outcome.fields_skipped
    );
    Ok(())
}

fn cmd_compare(
    engine: &PositionEngine,
    template_id: &str,
    reference: &Path,
    json: bool,
) -> anyhow::Result<()> {
    let report = engine
        .compare(template_id, reference)
        .with_context(|| format!("Comparison failed for template {}", template_id))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    for line in report.summary_lines() {
        println!("{}", line);
    }
    for overlap in &report.overlaps {
        println!(
            "overlap: {} and {} on page {}",
            overlap.field_a, overlap.field_b, overlap.page
        );
    }
    for violation in &report.spacing_violations {
        println!(
            "tight spacing: {} and {} on page {} ({:.2}mm gap)",
            violation.field_a, violation.field_b, violation.page, violation.gap_mm
        );
    }
    if let Some((dx, dy)) = report.suggested_correction {
        println!(
            "mean drift of misaligned fields: ({:+.2}, {:+.2})mm",
            dx, dy
        );
    }
    Ok(())
}

fn cmd_templates(engine: &PositionEngine) -> anyhow::Result<()> {
    let templates = engine
        .templates()
        .context("Failed to list stored positions")?;
    if templates.is_empty() {
        println!(
            "No stored positions under {}",
            engine.store().dir().display()
        );
    } else {
        for template_id in templates {
            println!("{}", template_id);
        }
    }
    Ok(())
}
