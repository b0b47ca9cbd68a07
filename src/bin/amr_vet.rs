//! `amr-vet`: a local, scriptable stand-in for the HTTP collaborator the
//! core classification engine is otherwise driven by. Not a transport
//! implementation -- just a developer-facing way to run the same pipeline
//! from a file on disk.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};

use amr_vet::catalog::{load_catalog, CatalogStore};
use amr_vet::correlation::CorrelationId;
use amr_vet::engine::ClassificationEngine;

#[derive(Parser)]
#[clap(name = "amr-vet", author, version, about = "Antimicrobial susceptibility classification engine CLI")]
struct Cli {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Classify a single input file against a catalog.
    Classify {
        /// Path to the rule catalog (a file or a directory of catalog
        /// documents). Defaults to `<config dir>/amr-vet/catalog`.
        #[clap(long)]
        catalog: Option<PathBuf>,
        /// Input payload format. `auto` detects from the payload itself.
        #[clap(long, default_value = "auto")]
        format: String,
        /// Path to the input payload.
        input: PathBuf,
    },
    /// Rule catalog maintenance.
    #[clap(subcommand)]
    Rules(RulesCommand),
}

#[derive(Subcommand)]
enum RulesCommand {
    /// Parse and validate a catalog without publishing it anywhere.
    Validate {
        /// Path to the rule catalog.
        path: PathBuf,
    },
    /// Classify a file against a catalog without needing a running engine
    /// process -- useful for catalog authors iterating on breakpoints.
    DryRun {
        /// Path to the rule catalog.
        catalog: PathBuf,
        /// Path to the input payload.
        input: PathBuf,
    },
    /// Show which breakpoints, expert rules, and intrinsic rules changed
    /// between two catalog versions.
    Diff {
        /// Path to the older rule catalog.
        old: PathBuf,
        /// Path to the newer rule catalog.
        new: PathBuf,
    },
}

/// Resolves the default catalog location under the user's config
/// directory, used when `--catalog` is omitted.
fn default_catalog_path() -> Result<PathBuf, String> {
    dirs::config_dir()
        .map(|dir| dir.join("amr-vet").join("catalog"))
        .ok_or_else(|| "could not determine a config directory; pass --catalog explicitly".to_owned())
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let cli = Cli::parse();
    match run(cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("{} {message}", style("error:").red().bold());
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Command) -> Result<(), String> {
    match command {
        Command::Classify { catalog, format, input } => {
            let catalog = match catalog {
                Some(path) => path,
                None => default_catalog_path()?,
            };
            classify(&catalog, &format, &input).await
        }
        Command::Rules(RulesCommand::Validate { path }) => validate(&path),
        Command::Rules(RulesCommand::DryRun { catalog, input }) => classify(&catalog, "auto", &input).await,
        Command::Rules(RulesCommand::Diff { old, new }) => diff(&old, &new),
    }
}

async fn classify(catalog_path: &PathBuf, format: &str, input_path: &PathBuf) -> Result<(), String> {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::with_template("{spinner} {msg}").unwrap());
    spinner.set_message(format!("loading catalog from {}", catalog_path.display()));
    spinner.enable_steady_tick(std::time::Duration::from_millis(80));

    let catalog = load_catalog(catalog_path).map_err(|e| e.to_string())?;
    let store = Arc::new(CatalogStore::from_catalog(catalog));
    let engine = ClassificationEngine::offline(store);

    let payload = std::fs::read(input_path).map_err(|e| format!("reading {}: {e}", input_path.display()))?;
    let correlation_id = CorrelationId::new(format!("cli-{}", input_path.display()));

    spinner.set_message("classifying");
    let results = match format {
        "native" => {
            let text = String::from_utf8(payload).map_err(|e| e.to_string())?;
            engine.classify_native(&text, correlation_id).await
        }
        "fhir" => {
            let text = String::from_utf8(payload).map_err(|e| e.to_string())?;
            engine.classify_fhir(&text, correlation_id).await
        }
        "hl7v2" => {
            let text = String::from_utf8(payload).map_err(|e| e.to_string())?;
            engine.classify_hl7v2(&text, correlation_id).await
        }
        "auto" => engine.classify_auto(&payload, correlation_id).await,
        other => {
            spinner.finish_and_clear();
            return Err(format!("unrecognized format {other:?}; expected native, fhir, hl7v2, or auto"));
        }
    }
    .map_err(|e| e.to_string())?;

    spinner.finish_and_clear();
    let rendered = serde_json::to_string_pretty(&results).map_err(|e| e.to_string())?;
    println!("{rendered}");
    Ok(())
}

/// Pretty-prints each catalog as stable, sorted text and diffs the two
/// renderings line by line -- the same "render then diff" shape as the
/// teacher's own `cargo vet diff`.
fn diff(old_path: &PathBuf, new_path: &PathBuf) -> Result<(), String> {
    let old = load_catalog(old_path).map_err(|e| e.to_string())?;
    let new = load_catalog(new_path).map_err(|e| e.to_string())?;

    let old_text = serde_yaml::to_string(&old).map_err(|e| e.to_string())?;
    let new_text = serde_yaml::to_string(&new).map_err(|e| e.to_string())?;

    let diff = similar::TextDiff::from_lines(&old_text, &new_text);
    for change in diff.iter_all_changes() {
        let sign = match change.tag() {
            similar::ChangeTag::Delete => style("-").red(),
            similar::ChangeTag::Insert => style("+").green(),
            similar::ChangeTag::Equal => style(" ").dim(),
        };
        print!("{sign}{change}");
    }
    Ok(())
}

fn validate(path: &PathBuf) -> Result<(), String> {
    match load_catalog(path) {
        Ok(catalog) => {
            println!("{} catalog {} is valid ({} breakpoints, {} expert rules)", style("ok:").green().bold(), catalog.version_label, catalog.breakpoints.len(), catalog.expert_rules.len());
            Ok(())
        }
        Err(err) => Err(err.to_string()),
    }
}
