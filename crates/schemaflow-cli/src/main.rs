mod catalog;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rusqlite::Connection;
use schemaflow_common::{Direction, MigrationId};
use schemaflow_config::{AppConfig, ConfigLoader};
use schemaflow_db::{
    DdlMode, MigrationDefinition, MigrationOutcome, MigrationRegistry, MigrationRunner, Operation,
    open_store, open_store_read_only,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "schemaflow",
    about = "Apply, inspect and roll back versioned SQLite migrations",
    version
)]
struct Cli {
    /// Path to config file (YAML or TOML)
    #[arg(long, global = true, env = "SCHEMAFLOW_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite database to migrate (overrides `database.path`)
    #[arg(long, global = true, env = "SCHEMAFLOW_DATABASE")]
    database: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Show applied, pending and unknown migrations
    Status {
        /// Print the status as JSON
        #[arg(long)]
        json: bool,
    },
    /// List every migration in the catalog with its steps
    Plan,
    /// Apply pending migrations
    Up {
        /// Stop after this migration id (inclusive)
        #[arg(long)]
        to: Option<String>,

        /// Show what would be applied without touching the store
        #[arg(long)]
        dry_run: bool,
    },
    /// Revert the most recently applied migrations
    Rollback {
        /// Number of migrations to revert
        #[arg(long, default_value_t = 1)]
        steps: usize,

        /// Permit reverting migrations whose down path loses data
        #[arg(long)]
        allow_lossy: bool,

        /// Show what would be reverted without touching the store
        #[arg(long)]
        dry_run: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    if let Err(err) = run(cli) {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn run(cli: Cli) -> Result<()> {
    let mut config = ConfigLoader::new(cli.config)
        .load()
        .context("failed to load configuration")?;
    if let Some(path) = cli.database {
        config.database.path = Some(path);
    }

    let registry = catalog::registry().context("migration catalog is invalid")?;

    match cli.command {
        Command::Plan => {
            plan(&registry);
            Ok(())
        }
        Command::Status { json } => {
            let conn = open_read_only(&config)?;
            status(&MigrationRunner::new(&registry, &config), &conn, json)
        }
        Command::Up { to, dry_run } => {
            let target = to.map(MigrationId::parse).transpose()?;
            let runner = MigrationRunner::new(&registry, &config);
            if dry_run {
                let conn = open_read_only(&config)?;
                return preview_up(&runner, &conn, target.as_ref());
            }
            let mut conn = open(&config)?;
            up(&runner, &mut conn, target.as_ref())
        }
        Command::Rollback {
            steps,
            allow_lossy,
            dry_run,
        } => {
            let runner = MigrationRunner::new(&registry, &config)
                .allow_lossy_rollback(allow_lossy || config.rollback.allow_lossy);
            if dry_run {
                let conn = open_read_only(&config)?;
                return preview_rollback(&runner, &conn, steps);
            }
            let mut conn = open(&config)?;
            rollback(&runner, &mut conn, steps)
        }
    }
}

fn database_path(config: &AppConfig) -> Result<&Path> {
    config
        .database
        .path
        .as_deref()
        .context("no database given; pass --database or set database.path")
}

fn open(config: &AppConfig) -> Result<Connection> {
    let path = database_path(config)?;
    open_store(path, &config.database)
        .with_context(|| format!("failed to open store at {}", path.display()))
}

fn open_read_only(config: &AppConfig) -> Result<Connection> {
    let path = database_path(config)?;
    open_store_read_only(path, &config.database)
        .with_context(|| format!("failed to open store at {}", path.display()))
}

fn status(runner: &MigrationRunner<'_>, conn: &Connection, json: bool) -> Result<()> {
    let status = runner.status(conn)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    match status.current() {
        Some(id) => println!("Current version: {id}"),
        None => println!("Current version: none"),
    }

    if status.applied.is_empty() {
        println!("Applied migrations: (none)");
    } else {
        println!("Applied migrations:");
        for record in &status.applied {
            println!("- {} ({}) at {}", record.id, record.name, record.applied_at);
        }
    }

    if status.pending.is_empty() {
        println!("Pending migrations: (none)");
    } else {
        println!("Pending migrations:");
        for id in &status.pending {
            println!("- {id}");
        }
    }

    if !status.unknown.is_empty() {
        println!("Unknown to this release (ledger diverges):");
        for id in &status.unknown {
            println!("- {id}");
        }
    }
    Ok(())
}

fn plan(registry: &MigrationRegistry) {
    for def in registry.enumerate() {
        let lossy = if def.is_lossy() { " [lossy down path]" } else { "" };
        println!("{} ({}){lossy}", def.id(), def.name());
        for direction in [Direction::Up, Direction::Down] {
            for (index, op) in def.steps(direction).iter().enumerate() {
                println!("  {direction}[{index}] {}", describe_step(op));
            }
        }
    }
}

fn describe_step(op: &Operation) -> String {
    let mode = match op.ddl_mode() {
        DdlMode::Transactional => "transactional",
        DdlMode::Emulated => "emulated",
        DdlMode::NonTransactional => "non-transactional",
    };
    match op {
        Operation::Schema(schema) => {
            format!("{} ({mode}): {}", schema.kind().as_str(), op.describe())
        }
        Operation::Data(data) => format!(
            "data ({mode}, {}, {}): {}",
            if data.is_invertible() { "invertible" } else { "lossy" },
            if data.is_idempotent() { "idempotent" } else { "not idempotent" },
            op.describe()
        ),
    }
}

fn preview_up(
    runner: &MigrationRunner<'_>,
    conn: &Connection,
    target: Option<&MigrationId>,
) -> Result<()> {
    let pending = runner.pending_for(conn, target)?;
    print_plan("Pending migrations to apply:", &pending);
    println!("Dry run complete. No migrations were applied.");
    Ok(())
}

fn up(runner: &MigrationRunner<'_>, conn: &mut Connection, target: Option<&MigrationId>) -> Result<()> {
    let report = runner.apply_pending_to(conn, target)?;
    if report.is_empty() {
        println!("No pending migrations. Store is up to date.");
        return Ok(());
    }
    for outcome in &report.migrations {
        print_outcome(outcome);
    }
    println!("Applied {} migration(s).", report.migrations.len());
    Ok(())
}

fn preview_rollback(runner: &MigrationRunner<'_>, conn: &Connection, steps: usize) -> Result<()> {
    let targets = runner.plan_rollback(conn, steps)?;
    print_plan("Migrations to revert (newest first):", &targets);
    println!("Dry run complete. No migrations were reverted.");
    Ok(())
}

fn rollback(runner: &MigrationRunner<'_>, conn: &mut Connection, steps: usize) -> Result<()> {
    let report = runner.rollback(conn, steps)?;
    if report.is_empty() {
        println!("Nothing to roll back.");
        return Ok(());
    }
    for outcome in &report.migrations {
        print_outcome(outcome);
    }
    info!("rolled back {} migration(s)", report.migrations.len());
    println!("Reverted {} migration(s).", report.migrations.len());
    Ok(())
}

fn print_plan(heading: &str, defs: &[&MigrationDefinition]) {
    if defs.is_empty() {
        println!("{heading} (none)");
        return;
    }
    println!("{heading}");
    for def in defs {
        let lossy = if def.is_lossy() { " [lossy]" } else { "" };
        println!("- {} ({}){lossy}", def.id(), def.name());
    }
}

fn print_outcome(outcome: &MigrationOutcome) {
    println!(
        "- {} {} ({} applied, {} skipped, {} rows, {} ms){}",
        outcome.direction,
        outcome.id,
        outcome.steps_applied,
        outcome.steps_skipped,
        outcome.rows_affected,
        outcome.elapsed_ms,
        if outcome.lossy { " [lossy]" } else { "" }
    );
}
