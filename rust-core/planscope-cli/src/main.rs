// SPDX-License-Identifier: PMPL-1.0-or-later
//! PlanScope command-line plan inspector
//!
//! Reads a showplan XML document from a file (or `-` for stdin) and prints
//! the operator tree, warnings and missing indexes.

use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use planscope_plan::{is_well_formed, ExecutionPlanParser, PlanDocument};
use planscope_service::sanitize::redact_plan_parameters;
use planscope_service::ServiceConfig;
use tracing::{debug, info};

const VERSION: &str = env!("CARGO_PKG_VERSION");

// ---------------------------------------------------------------------------
// CLI argument parsing
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "planscope", version = VERSION, about = "Execution plan inspector")]
struct Cli {
    /// JSON service configuration; only the parser section is used here.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print a parsed plan.
    Show {
        /// Plan document, or `-` for stdin.
        file: PathBuf,

        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,

        /// Also list the N operators with the highest own cost.
        #[arg(long)]
        top: Option<usize>,
    },
    /// Check that a document is well-formed and count its operators.
    Check {
        file: PathBuf,
    },
    /// Print the document with parameter values redacted.
    Redact {
        file: PathBuf,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    let parser = ExecutionPlanParser::new(config.parser);

    match cli.command {
        Command::Show { file, format, top } => {
            let document = read_document(&file)?;
            let plan = parser
                .parse(&document)
                .with_context(|| format!("failed to parse {}", file.display()))?;
            info!(
                operators = plan.operator_count(),
                warnings = plan.all_warnings().len(),
                "Parsed plan"
            );
            match format {
                OutputFormat::Text => {
                    print!("{}", plan.render_text());
                    if let Some(n) = top {
                        print!("{}", render_most_expensive(&plan, n));
                    }
                }
                OutputFormat::Json => println!("{}", plan.to_json()?),
            }
        }
        Command::Check { file } => {
            let document = read_document(&file)?;
            if !is_well_formed(&document) {
                bail!("{} is not a well-formed plan document", file.display());
            }
            let plan = parser.parse(&document)?;
            println!(
                "ok: {} operator(s), {} warning(s), {} missing index(es)",
                plan.operator_count(),
                plan.all_warnings().len(),
                plan.missing_indexes.len()
            );
        }
        Command::Redact { file } => {
            let document = read_document(&file)?;
            print!("{}", redact_plan_parameters(&document));
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<ServiceConfig> {
    let Some(path) = path else {
        return Ok(ServiceConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let config = ServiceConfig::from_json(&text)
        .with_context(|| format!("invalid config {}", path.display()))?;
    debug!(path = %path.display(), "Loaded configuration");
    Ok(config)
}

fn read_document(path: &Path) -> Result<String> {
    if path.as_os_str() == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("failed to read stdin")?;
        return Ok(buf);
    }
    std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

fn render_most_expensive(plan: &PlanDocument, n: usize) -> String {
    let mut out = String::from("\n--- Most Expensive ---\n");
    for op in plan.most_expensive(n) {
        out.push_str(&format!(
            "  [{}] {} own cost {:.4} ({:.1}%)\n",
            op.id,
            op.physical_op,
            op.own_cost(),
            op.cost_percent
        ));
    }
    out
}
