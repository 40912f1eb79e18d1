//! FieldOps E2E operator tool
//!
//! Inspects what the dual-mode harness would do without running the UI
//! suite: mode resolution, fixture health and production seeding.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use fieldops_e2e::env::ProcessEnv;
use fieldops_e2e::{
    default_catalog, HarnessConfig, HttpLiveSystem, IsolatedDataProvider, LiveSystem,
    MemoryLiveSystem, ModeDetector, ProductionTestDataProvider, ScenarioTags,
};

#[derive(Parser)]
#[command(name = "fieldops-e2e")]
#[command(author, version, about = "Dual-mode data lifecycle tool for the FieldOps E2E suite", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Harness configuration file (defaults apply when missing)
    #[arg(long, default_value = "fieldops-e2e.toml", env = "FIELDOPS_CONFIG", global = true)]
    config: PathBuf,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve the execution mode for a set of scenario tags
    Detect {
        /// Scenario tag, e.g. `--tag @production` (repeatable)
        #[arg(long = "tag")]
        tags: Vec<String>,
    },

    /// List fixture bundles and check that each one restores
    Fixtures {
        /// Only list, do not restore
        #[arg(long)]
        list_only: bool,
    },

    /// Ensure the synthetic catalog exists in the live system
    Seed {
        /// Run against an in-memory system instead of the configured URL
        #[arg(long)]
        dry_run: bool,
    },

    /// Print the effective configuration
    Config {
        /// Also write it back to the configuration file
        #[arg(long)]
        write: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level)),
        )
        .with_target(false)
        .init();

    let env = Arc::new(ProcessEnv);
    let mut config = HarnessConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    config.apply_env(env.as_ref())?;

    match cli.command {
        Commands::Detect { tags } => {
            let decision = ModeDetector::new(env).decide(&ScenarioTags::parse(&tags))?;
            println!("declared:  {}", decision.declared);
            println!("execution: {}", decision.execution);
            println!("source:    {:?}", decision.source);
        }
        Commands::Fixtures { list_only } => {
            let provider = IsolatedDataProvider::new(config.isolated.clone(), config.retry.policy());
            let fixtures = provider.list_fixtures()?;
            if fixtures.is_empty() {
                println!("No fixtures in {}", config.isolated.fixtures_dir.display());
            }

            let mut broken = 0;
            for fixture in fixtures {
                if list_only {
                    println!("{}  {}", fixture.name, fixture.path.display());
                    continue;
                }
                match provider.load(&fixture.name).await {
                    Ok(ctx) => {
                        println!("✅ {} ({} records)", fixture.name, ctx.test_data().len());
                        ctx.cleanup().await?;
                    }
                    Err(e) => {
                        broken += 1;
                        println!("❌ {} - {}", fixture.name, e);
                    }
                }
            }
            if broken > 0 {
                std::process::exit(1);
            }
        }
        Commands::Seed { dry_run } => {
            let live: Arc<dyn LiveSystem> = if dry_run {
                Arc::new(MemoryLiveSystem::new())
            } else {
                Arc::new(HttpLiveSystem::new(&config.production)?)
            };
            let provider =
                ProductionTestDataProvider::new(live, &config.production, config.retry.policy());
            let catalog = default_catalog(provider.naming(), &config.production.locations);

            let ctx = provider.ensure(&catalog).await?;
            for (category, record) in ctx.test_data().iter() {
                println!("{:<10} {:<12} {}", category.kind(), record.id, record.name);
            }
            ctx.cleanup().await?;
        }
        Commands::Config { write } => {
            print!("{}", toml::to_string_pretty(&config)?);
            if write {
                config.save(&cli.config)?;
                println!("# written to {}", cli.config.display());
            }
        }
    }

    Ok(())
}
