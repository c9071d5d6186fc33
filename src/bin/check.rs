//! Schema Check CLI
//!
//! Offline tooling: diff two SDL files statically, validate an SDL file and
//! print the canonical form and fingerprint of an operation.

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use usage_registry::checksum::Checksum;
use usage_registry::version::VersionBump;
use usage_registry::{diff, Criticality, NormalizeOptions, OperationNormalizer, SchemaModel};

#[derive(Parser)]
#[command(name = "schema-check")]
#[command(about = "Diff GraphQL schemas and fingerprint operations")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Diff two SDL files without usage data
    Diff {
        /// Currently published schema
        old: PathBuf,
        /// Proposed schema
        new: PathBuf,
        /// Print changes as JSON
        #[arg(long)]
        json: bool,
        /// Write the changes to a JSON report file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Parse and validate an SDL file
    Validate {
        /// SDL file
        schema: PathBuf,
    },

    /// Print the canonical body and fingerprint of an operation
    Normalize {
        /// File holding the operation document
        operation: PathBuf,
        /// Operation to select when the document holds several
        #[arg(short, long)]
        name: Option<String>,
        /// Schema coordinate touched by the operation (repeatable)
        #[arg(short, long = "field")]
        fields: Vec<String>,
        /// Keep literal values
        #[arg(long)]
        keep_literals: bool,
        /// Keep response aliases
        #[arg(long)]
        keep_aliases: bool,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn read(path: &PathBuf) -> anyhow::Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}

fn parse(path: &PathBuf) -> anyhow::Result<SchemaModel> {
    SchemaModel::parse(&read(path)?).with_context(|| format!("parsing {}", path.display()))
}

fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Diff {
            old,
            new,
            json,
            output,
        } => {
            let old_schema = parse(&old)?;
            let new_schema = parse(&new)?;

            let mut changes = diff::diff(&old_schema, &new_schema);
            changes.sort_by(|a, b| {
                a.criticality
                    .cmp(&b.criticality)
                    .then_with(|| a.message.cmp(&b.message))
            });

            if let Some(path) = output {
                std::fs::write(&path, serde_json::to_string_pretty(&changes)?)
                    .with_context(|| format!("writing {}", path.display()))?;
                println!("📝 Report written to {}", path.display());
            }

            if json {
                println!("{}", serde_json::to_string_pretty(&changes)?);
            } else {
                println!("🔍 Comparing {} -> {}", old.display(), new.display());
                println!();
                if changes.is_empty() {
                    println!("✅ No changes");
                }
                for change in &changes {
                    let icon = match change.criticality {
                        Criticality::Breaking => "❌",
                        Criticality::Dangerous => "⚠️ ",
                        Criticality::Safe => "✅",
                    };
                    println!("{} {}", icon, change.message);
                }
                println!();
            }

            let breaking = changes.iter().filter(|c| c.is_breaking()).count();
            if breaking > 0 {
                bail!("{} breaking change(s)", breaking);
            }

            if !json {
                let bumped = VersionBump::for_changes(&changes);
                println!("🎉 Compatible, publishing would be a {:?} bump", bumped);
            }
            Ok(())
        }

        Commands::Validate { schema } => {
            let model = parse(&schema)?;
            let errors = model.validate();
            if errors.is_empty() {
                let checksum = Checksum::of_sdl(&read(&schema)?);
                println!(
                    "✅ {} - {} types, checksum {}",
                    schema.display(),
                    model.types.len(),
                    checksum
                );
                Ok(())
            } else {
                for error in &errors {
                    println!("❌ {}", error);
                }
                bail!("{} validation error(s)", errors.len());
            }
        }

        Commands::Normalize {
            operation,
            name,
            fields,
            keep_literals,
            keep_aliases,
        } => {
            let document = read(&operation)?;
            let normalizer = OperationNormalizer::new(NormalizeOptions {
                hide_literals: !keep_literals,
                remove_aliases: !keep_aliases,
            });
            let normalized = normalizer.normalize(&document, name.as_deref(), &fields)?;

            println!("📦 {} {}", normalized.kind, normalized.name.as_deref().unwrap_or("(anonymous)"));
            println!("   body:        {}", normalized.body);
            println!("   hash:        {}", normalized.hash);
            println!("   coordinates: {}", normalized.coordinates.join(", "));
            Ok(())
        }
    }
}
