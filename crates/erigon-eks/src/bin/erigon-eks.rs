//! erigon-eks CLI - synthesize and lint the Erigon EKS stacks.

use std::path::PathBuf;

use anyhow::{bail, Context as _, Result};
use cfn::Environment;
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use erigon_eks::{build_app, nag, Context, ContextOverride, InfraConfig};

/// Synthesize CloudFormation for an EKS cluster running Erigon.
#[derive(Parser)]
#[command(name = "erigon-eks")]
#[command(about = "Synthesize and lint the Erigon EKS stacks")]
struct Cli {
    /// Context file with a top-level `context` map.
    #[arg(long, global = true, default_value = "cdk.json")]
    config: PathBuf,

    /// Context override (`key=value`), may be repeated.
    #[arg(long = "context", short = 'c', global = true)]
    overrides: Vec<ContextOverride>,

    /// AWS account to deploy to (or set `CDK_DEFAULT_ACCOUNT` env var).
    #[arg(long, global = true, env = "CDK_DEFAULT_ACCOUNT", default_value = "")]
    account: String,

    /// AWS region to deploy to (or set `CDK_DEFAULT_REGION` env var).
    #[arg(long, global = true, env = "CDK_DEFAULT_REGION", default_value = "")]
    region: String,

    /// Enable verbose logging and detailed lint output.
    #[arg(short, long, global = true, default_value = "false")]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Synthesize the cloud assembly.
    Synth {
        /// Output directory.
        #[arg(short, long, default_value = "cdk.out")]
        output: PathBuf,
    },

    /// List stacks in deployment order with their dependencies.
    List,

    /// Run the policy lint over every template.
    Lint,
}

fn load_config(cli: &Cli) -> Result<InfraConfig> {
    let mut context = if cli.config.exists() {
        Context::from_file(&cli.config)?
    } else {
        info!(path = %cli.config.display(), "Context file not found, using overrides only");
        Context::new()
    };
    context.apply(&cli.overrides);
    InfraConfig::from_context(&context, Environment::new(&cli.account, &cli.region))
        .context("Invalid configuration")
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = load_config(&cli)?;
    let app = build_app(&config)?;

    match &cli.command {
        Commands::Synth { output } => {
            let assembly = app.synth().context("Synthesis failed")?;
            assembly
                .write_to(output)
                .with_context(|| format!("Failed to write assembly to {}", output.display()))?;
            println!(
                "{} {}",
                "✓".green().bold(),
                format!("Synthesized {} stacks to {}", assembly.templates.len(), output.display()).green()
            );
        }

        Commands::List => {
            let edges = app.dependencies()?;
            println!("\n{:<16} {:<24} {}", "ID", "STACK NAME", "DEPENDS ON");
            println!("{}", "-".repeat(70));
            for id in app.deployment_order()? {
                let name = app.stack(&id).map(cfn::Stack::name).unwrap_or_default();
                let producers: Vec<&str> = edges
                    .iter()
                    .filter(|e| e.consumer == id)
                    .map(|e| e.producer.as_str())
                    .collect();
                println!("{:<16} {:<24} {}", id, name, producers.join(", "));
            }
        }

        Commands::Lint => {
            let assembly = app.synth().context("Synthesis failed")?;
            let report = nag::check_assembly(&assembly);
            report.print(cli.verbose);
            if !report.is_clean() {
                bail!("{} unsuppressed lint findings", report.unsuppressed().count());
            }
        }
    }

    Ok(())
}
