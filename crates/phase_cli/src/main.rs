use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use phase_core::{
    build_solver, parse, parse_scalar, validate_problem, BatchSolution, EquationSystem,
    EventFunction, EventLog, IntegratorOptions, Params, ScalarExpression,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::level_filters::LevelFilter;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "phase")]
#[command(about = "Parse and integrate ODE systems written in Mathematica-like notation", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Integrate a problem file and write the trajectories as JSON
    Run {
        /// Path to the problem JSON file
        problem_path: PathBuf,
        /// Output JSON file path (optional, defaults to stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Parse an equation and list its state variables and parameters
    Parse {
        /// Equation text, e.g. "{x'[t], y'[t]} == {y[t], -x[t]}"
        equation: String,
    },
    /// Validate a problem file without integrating it
    Check {
        /// Path to the problem JSON file
        problem_path: PathBuf,
    },
}

/// Integrator section of a problem file.
#[derive(Debug, Deserialize)]
struct IntegratorSection {
    #[serde(flatten)]
    options: IntegratorOptions,
    #[serde(default)]
    t_eval: Option<Vec<f64>>,
}

#[derive(Debug, Deserialize)]
struct Problem {
    #[serde(default)]
    name: Option<String>,
    equations: String,
    #[serde(default)]
    parameters: Params,
    timespan: (f64, f64),
    initial_conditions: Vec<Vec<f64>>,
    #[serde(default)]
    integrator: Option<IntegratorSection>,
    #[serde(default)]
    events: Vec<String>,
}

/// A problem whose text has been compiled and whose shapes have been checked.
struct Prepared {
    system: EquationSystem,
    events: Vec<ScalarExpression>,
    options: IntegratorOptions,
    t_eval: Option<Vec<f64>>,
}

#[derive(Serialize)]
struct RunOutput<'a> {
    name: Option<&'a str>,
    variables: &'a [String],
    backend: &'a str,
    method: &'a str,
    times: &'a [f64],
    trajectories: &'a [Vec<Vec<f64>>],
    events: &'a [EventLog],
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Run {
            problem_path,
            output,
        } => cmd_run(&problem_path, output.as_deref()),
        Commands::Parse { equation } => cmd_parse(&equation),
        Commands::Check { problem_path } => cmd_check(&problem_path),
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();
}

fn load_problem(path: &Path) -> Result<Problem> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read problem file {}", path.display()))?;
    serde_json::from_str(&text)
        .with_context(|| format!("failed to decode problem file {}", path.display()))
}

fn prepare(problem: &Problem) -> Result<Prepared> {
    let system = parse(&problem.equations).context("failed to parse equations")?;

    let events = problem
        .events
        .iter()
        .map(|text| {
            parse_scalar(text, system.variables())
                .with_context(|| format!("failed to parse event {text:?}"))
        })
        .collect::<Result<Vec<_>>>()?;

    let (options, t_eval) = match &problem.integrator {
        Some(section) => (section.options.clone(), section.t_eval.clone()),
        None => (IntegratorOptions::default(), None),
    };
    options.validate().context("invalid integrator options")?;

    validate_problem(
        system.variables().len(),
        problem.timespan,
        &problem.initial_conditions,
        t_eval.as_deref(),
    )
    .context("invalid problem shape")?;

    let missing: Vec<&str> = system
        .parameters()
        .iter()
        .chain(events.iter().flat_map(|e| e.parameters()))
        .filter(|name| !problem.parameters.contains_key(name.as_str()))
        .map(String::as_str)
        .collect();
    if !missing.is_empty() {
        warn!(?missing, "parameters without a value evaluate to 0");
    }

    Ok(Prepared {
        system,
        events,
        options,
        t_eval,
    })
}

fn cmd_run(problem_path: &Path, output: Option<&Path>) -> Result<()> {
    let problem = load_problem(problem_path)?;
    let prepared = prepare(&problem)?;
    let solver = build_solver(prepared.options.clone())?;

    let bound: Vec<_> = prepared
        .events
        .iter()
        .map(|e| e.bind(&problem.parameters))
        .collect();
    let events: Vec<&dyn EventFunction> = bound.iter().map(|b| b as &dyn EventFunction).collect();

    let method = solver.options().method.name();
    info!(
        backend = solver.name(),
        method,
        rows = problem.initial_conditions.len(),
        "integrating"
    );
    let solution: BatchSolution = solver
        .solve_batch(
            &prepared.system,
            problem.timespan,
            &problem.initial_conditions,
            &problem.parameters,
            prepared.t_eval.as_deref(),
            &events,
        )
        .context("integration failed")?;
    let rows_with_events = solution.events.iter().filter(|log| !log.is_empty()).count();
    info!(rows_with_events, "integration finished");

    let result = RunOutput {
        name: problem.name.as_deref(),
        variables: prepared.system.variables(),
        backend: solver.name(),
        method,
        times: &solution.times,
        trajectories: &solution.trajectories,
        events: &solution.events,
    };
    let json = serde_json::to_string_pretty(&result).context("failed to encode result")?;

    match output {
        Some(path) => {
            fs::write(path, json)
                .with_context(|| format!("failed to write {}", path.display()))?;
            eprintln!("Wrote {} trajectories to {}", solution.trajectories.len(), path.display());
        }
        None => println!("{json}"),
    }
    Ok(())
}

fn cmd_parse(equation: &str) -> Result<()> {
    let system = parse(equation)?;
    println!("variables:  {}", system.variables().join(", "));
    if system.parameters().is_empty() {
        println!("parameters: (none)");
    } else {
        println!("parameters: {}", system.parameters().join(", "));
    }
    println!("{system}");
    Ok(())
}

fn cmd_check(problem_path: &Path) -> Result<()> {
    let problem = load_problem(problem_path)?;
    let prepared = prepare(&problem)?;
    println!(
        "✓ {} is valid: {} variable(s), {} row(s), {} event(s), {}",
        problem.name.as_deref().unwrap_or("problem"),
        prepared.system.variables().len(),
        problem.initial_conditions.len(),
        prepared.events.len(),
        prepared.options.method,
    );
    Ok(())
}
