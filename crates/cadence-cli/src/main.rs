//! CLI binary for running and validating Cadence experiment definitions.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use cadence_timeline::{
    load_definition, naive_timeline_count, naive_trial_count, validate, Executor, NodeDesc,
    PluginRegistry, RunConfig, Severity, TimelineDesc,
};
use cadence_types::{RunMode, SimulationMode};

#[derive(Parser)]
#[command(name = "cadence", version, about = "Timeline runner for behavioral experiments")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum SimulateArg {
    DataOnly,
    Visual,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an experiment from a definition file
    Run {
        /// Path to the experiment definition (JSON)
        definition: PathBuf,

        /// Simulate instead of waiting for real responses
        #[arg(long, value_enum, num_args = 0..=1, default_missing_value = "data-only")]
        simulate: Option<SimulateArg>,

        /// RNG seed for a reproducible run (default: drawn from entropy)
        #[arg(long)]
        seed: Option<u64>,

        /// Write the resulting data as CSV to this path
        #[arg(long)]
        csv: Option<PathBuf>,

        /// Write the resulting data as JSON to this path
        #[arg(long)]
        json: Option<PathBuf>,

        /// Pretty-print JSON output
        #[arg(long)]
        pretty: bool,

        /// Default inter-trial gap in milliseconds
        #[arg(long, default_value = "0")]
        iti: u64,
    },

    /// Validate a definition file without running it
    Validate {
        /// Path to the experiment definition (JSON)
        definition: PathBuf,
    },

    /// Show information about a definition
    Info {
        /// Path to the experiment definition (JSON)
        definition: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup tracing
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .init();

    match cli.command {
        Commands::Run {
            definition,
            simulate,
            seed,
            csv,
            json,
            pretty,
            iti,
        } => {
            cmd_run(
                &definition,
                simulate,
                seed,
                csv.as_deref(),
                json.as_deref(),
                pretty,
                iti,
            )
            .await?;
        }
        Commands::Validate { definition } => {
            cmd_validate(&definition)?;
        }
        Commands::Info { definition } => {
            cmd_info(&definition)?;
        }
    }

    Ok(())
}

fn load_experiment(path: &std::path::Path) -> anyhow::Result<TimelineDesc> {
    let source = std::fs::read_to_string(path)?;
    let desc = load_definition(&source)?;
    tracing::debug!(path = %path.display(), bytes = source.len(), "definition loaded");
    Ok(desc)
}

async fn cmd_run(
    path: &std::path::Path,
    simulate: Option<SimulateArg>,
    seed: Option<u64>,
    csv: Option<&std::path::Path>,
    json: Option<&std::path::Path>,
    pretty: bool,
    iti: u64,
) -> anyhow::Result<()> {
    let desc = load_experiment(path)?;

    let mode = match simulate {
        None => RunMode::Normal,
        Some(SimulateArg::DataOnly) => RunMode::Simulate(SimulationMode::DataOnly),
        Some(SimulateArg::Visual) => RunMode::Simulate(SimulationMode::Visual),
    };

    let mut config = RunConfig::new().mode(mode).default_iti_ms(iti);
    if let Some(seed) = seed {
        config = config.seed(seed);
    }

    println!("Running experiment: {}", path.display());
    println!("Planned trials: {}", naive_trial_count(&desc));
    if mode.is_simulation() {
        println!("(simulation mode -- synthesized responses)");
    }

    let executor = Executor::new(PluginRegistry::with_builtins());
    let outcome = executor.run(&desc, config).await?;
    tracing::info!(
        trials_run = outcome.trials_run,
        seed = outcome.seed,
        "run finished"
    );

    println!("\nExperiment completed");
    println!("Trials run: {}", outcome.trials_run);
    println!("Seed: {}", outcome.seed);

    if let Some(csv_path) = csv {
        std::fs::write(csv_path, outcome.data.csv())?;
        println!("CSV written to {}", csv_path.display());
    }
    if let Some(json_path) = json {
        std::fs::write(json_path, outcome.data.json(pretty)?)?;
        println!("JSON written to {}", json_path.display());
    }
    if csv.is_none() && json.is_none() {
        println!("\n{}", outcome.data.json(pretty)?);
    }

    Ok(())
}

fn cmd_validate(path: &std::path::Path) -> anyhow::Result<()> {
    let desc = load_experiment(path)?;
    let registry = PluginRegistry::with_builtins();
    let diagnostics = validate(&desc, Some(&registry));

    if diagnostics.is_empty() {
        println!("Definition is valid");
        return Ok(());
    }

    let mut has_error = false;
    for diag in &diagnostics {
        let severity = match diag.severity {
            Severity::Error => {
                has_error = true;
                "ERROR"
            }
            Severity::Warning => "WARN",
        };
        println!("[{}] {}: {}", severity, diag.path, diag.message);
    }

    if has_error {
        std::process::exit(1);
    }
    Ok(())
}

fn cmd_info(path: &std::path::Path) -> anyhow::Result<()> {
    let desc = load_experiment(path)?;

    println!("Experiment: {}", path.display());
    if let Some(name) = &desc.name {
        println!("Name: {}", name);
    }
    println!("Planned trials: {}", naive_trial_count(&desc));
    println!("Timelines: {}", naive_timeline_count(&desc));
    println!("Variable sets: {}", count_variable_sets(&desc));

    let mut plugins = Vec::new();
    let mut extensions = Vec::new();
    collect_references(&desc, &mut plugins, &mut extensions);
    plugins.sort();
    plugins.dedup();
    extensions.sort();
    extensions.dedup();

    println!("Plugins: {}", plugins.join(", "));
    if !extensions.is_empty() {
        println!("Extensions: {}", extensions.join(", "));
    }
    Ok(())
}

fn count_variable_sets(desc: &TimelineDesc) -> usize {
    desc.timeline_variables.len()
        + desc
            .children
            .iter()
            .map(|child| match child {
                NodeDesc::Timeline(t) => count_variable_sets(t),
                NodeDesc::Trial(_) => 0,
            })
            .sum::<usize>()
}

fn collect_references(desc: &TimelineDesc, plugins: &mut Vec<String>, extensions: &mut Vec<String>) {
    for child in &desc.children {
        match child {
            NodeDesc::Trial(trial) => {
                plugins.push(trial.plugin.clone());
                extensions.extend(trial.extensions.iter().cloned());
            }
            NodeDesc::Timeline(timeline) => collect_references(timeline, plugins, extensions),
        }
    }
}
