use clap::{Parser, Subcommand};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{error, info};

use stagechain::config::Config;
use stagechain::selector::{self, PlanSummary};
use stagechain::{CapabilityProfile, Stage, TechniqueCatalog};

/// Stagechain - staged technique planner with transactional rollback
#[derive(Parser, Debug)]
#[command(name = "stagechain", version, about)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level regardless of config
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List techniques and chain templates in a catalog
    Catalog {
        /// Technique catalog (TOML)
        #[arg(long)]
        catalog: PathBuf,
    },
    /// Select a plan for an offline profile and print it as JSON
    Plan {
        /// Technique catalog (TOML)
        #[arg(long)]
        catalog: PathBuf,

        /// JSON object of target attributes
        #[arg(long)]
        profile: PathBuf,

        /// Operation type; unknown operations use the default template
        #[arg(short, long, default_value = "default")]
        operation: String,

        /// Identifier recorded in the plan
        #[arg(long, default_value = "offline")]
        target_id: String,
    },
}

#[derive(Serialize)]
struct TechniqueListing {
    name: String,
    stage: Stage,
    success_weight: f64,
    scripted: bool,
}

#[derive(Serialize)]
struct CatalogListing {
    default_template: String,
    templates: BTreeMap<String, Vec<String>>,
    techniques: Vec<TechniqueListing>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    let level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        config.log_level.parse().unwrap_or(tracing::Level::INFO)
    };
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "stagechain starting");

    let result = match args.command {
        Command::Catalog { catalog } => list_catalog(&catalog),
        Command::Plan {
            catalog,
            profile,
            operation,
            target_id,
        } => plan(&catalog, &profile, &operation, &target_id),
    };

    if let Err(e) = &result {
        error!(error = %e, "command failed");
    }
    result
}

fn list_catalog(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let catalog = TechniqueCatalog::from_file(path)?;

    let templates = catalog
        .template_names()
        .map(|name| {
            let (_, template) = catalog.template(name);
            (name.to_string(), template.techniques.clone())
        })
        .collect();
    let techniques = catalog
        .techniques()
        .map(|t| TechniqueListing {
            name: t.name.clone(),
            stage: t.stage,
            success_weight: t.success_weight,
            scripted: t.script.is_some(),
        })
        .collect();

    let listing = CatalogListing {
        default_template: catalog.default_template().to_string(),
        templates,
        techniques,
    };
    println!("{}", serde_json::to_string_pretty(&listing)?);
    Ok(())
}

fn plan(
    catalog_path: &Path,
    profile_path: &Path,
    operation: &str,
    target_id: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let catalog = TechniqueCatalog::from_file(catalog_path)?;
    let attributes: BTreeMap<String, String> =
        serde_json::from_str(&std::fs::read_to_string(profile_path)?)?;
    let profile = CapabilityProfile::new(target_id, attributes);

    let plan = selector::select(&profile, operation, &catalog);
    if plan.is_empty() {
        info!(operation = %operation, "no compatible plan for this profile");
    }
    let summary: PlanSummary = plan.summary();
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
