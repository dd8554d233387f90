//! Command handlers

use crate::cli::{Cli, Commands};
use anyhow::{anyhow, Context};
use colored::Colorize;
use schemagate::config::{GateConfig, ProbeSettings, DEFAULT_CONFIG_FILE};
use schemagate::connection::redact_connection_string;
use schemagate::migration::{
    ApplyOutcome, DowngradeTarget, GenerateMode, HistoryReader, MemoryHistoryStore,
    MigrationError, MigrationStatus, Migrator, ModelDiffEngine, PgHistoryReader,
    PostgresHistoryStore, PostgresIntrospector, SchemaModel, Target,
};
use schemagate::readiness::{Readiness, ReadinessGate};
use schemagate::{connect, PgExecutor};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Effective settings: CLI flags over `DATABASE_URL` over the config file
#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: String,
    pub migrations_dir: PathBuf,
    pub schema_file: PathBuf,
    pub schema_name: String,
    pub lock_timeout: Duration,
    pub ignore_tables: Vec<String>,
    pub probe: ProbeSettings,
}

impl Settings {
    pub fn resolve(cli: &Cli, config: GateConfig, env_database_url: Option<String>) -> Self {
        Self {
            database_url: cli
                .database_url
                .clone()
                .or(env_database_url)
                .unwrap_or(config.database.url),
            migrations_dir: cli
                .migrations_dir
                .clone()
                .unwrap_or_else(|| config.migrations.dir.clone()),
            schema_file: cli
                .schema_file
                .clone()
                .unwrap_or_else(|| config.migrations.schema_file.clone()),
            schema_name: config.migrations.schema_name.clone(),
            lock_timeout: config.migrations.lock_timeout(),
            ignore_tables: config.migrations.ignore_tables,
            probe: config.probe,
        }
    }

    /// Read `.env`, the config file and the environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but is invalid.
    pub fn load(cli: &Cli) -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let config_path = cli
            .config
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
        let config = GateConfig::load_from(&config_path)
            .with_context(|| format!("invalid configuration in {}", config_path.display()))?;

        Ok(Self::resolve(
            cli,
            config,
            std::env::var("DATABASE_URL").ok(),
        ))
    }

    fn migrator(&self) -> Migrator {
        Migrator::new(&self.migrations_dir).with_lock_timeout(self.lock_timeout)
    }
}

/// Run the parsed command
///
/// # Errors
///
/// Any failure; `main` prints it and exits with status 1.
pub fn run(cli: &Cli) -> anyhow::Result<()> {
    let settings = Settings::load(cli)?;
    log::debug!(
        "database: {}, migrations: {}",
        redact_connection_string(&settings.database_url),
        settings.migrations_dir.display()
    );

    match &cli.command {
        Commands::Generate {
            apply,
            empty,
            message,
        } => handle_generate(&settings, &Commands::message(message), *empty, *apply),
        Commands::Apply { target, dry_run } => handle_apply(&settings, target, *dry_run),
        Commands::Downgrade { target } => handle_downgrade(&settings, target),
        Commands::Status => handle_status(&settings),
        Commands::Check { wait } => handle_check(&settings, *wait),
        Commands::Probe => handle_probe(&settings),
    }
}

fn open_executor(settings: &Settings) -> Result<PgExecutor, MigrationError> {
    Ok(PgExecutor::new(connect(&settings.database_url)?))
}

fn handle_generate(
    settings: &Settings,
    message: &str,
    empty: bool,
    apply: bool,
) -> anyhow::Result<()> {
    let migrator = settings.migrator();

    let generated = if empty {
        migrator.generate(message, GenerateMode::Empty)
    } else {
        generate_from_diff(settings, &migrator, message)
    };

    match generated {
        Ok(script) => {
            let path = script
                .path
                .as_deref()
                .map_or_else(|| script.file_name(), |p| p.display().to_string());
            println!("{} Generated migration: {}", "✅".green(), path);
            if empty {
                println!("   Edit the -- +upgrade and -- +downgrade sections before applying");
            }
        }
        Err(e) if e.is_no_op() => {
            println!("{} No schema changes detected; nothing generated", "ℹ".blue());
        }
        Err(e) => return Err(e.into()),
    }

    if apply {
        handle_apply(settings, "head", false)?;
    }
    Ok(())
}

fn generate_from_diff(
    settings: &Settings,
    migrator: &Migrator,
    message: &str,
) -> Result<schemagate::migration::MigrationScript, MigrationError> {
    let model = SchemaModel::load(&settings.schema_file)?;
    let executor = open_executor(settings).map_err(|e| {
        MigrationError::DiffUnavailable(format!("cannot connect to the database: {e}"))
    })?;

    let store = PostgresHistoryStore::new(&executor);
    let introspector = PostgresIntrospector::new(&executor, settings.schema_name.clone());
    let engine = ModelDiffEngine::new(model, introspector)
        .with_ignored(settings.ignore_tables.iter().cloned());

    migrator.generate(
        message,
        GenerateMode::AutoDetect {
            engine: &engine,
            reader: &store,
        },
    )
}

fn parse_target(target: &str) -> anyhow::Result<Target> {
    Ok(target.parse::<Target>()?)
}

fn handle_apply(settings: &Settings, target: &str, dry_run: bool) -> anyhow::Result<()> {
    let target = parse_target(target)?;
    let migrator = settings.migrator();
    let executor = open_executor(settings)?;
    let store = PostgresHistoryStore::new(&executor);

    if dry_run {
        let record = store.applied_record()?;
        let preview = MemoryHistoryStore::with_head(record.head);
        let outcome = migrator.apply(&preview, &target)?;
        if outcome.is_noop() {
            println!("No pending migrations to apply");
        } else {
            println!("Would apply {} migration(s):", outcome.applied.len());
            print_versions(&migrator, &outcome.applied);
        }
        return Ok(());
    }

    println!("Applying migrations...");
    let outcome = migrator.apply(&store, &target)?;
    report_outcome(&outcome, "applied");
    Ok(())
}

fn handle_downgrade(settings: &Settings, target: &str) -> anyhow::Result<()> {
    let target = target.parse::<DowngradeTarget>()?;
    let migrator = settings.migrator();
    let executor = open_executor(settings)?;
    let store = PostgresHistoryStore::new(&executor);

    println!("Reverting migrations to {target}...");
    let outcome = migrator.downgrade(&store, &target)?;
    report_outcome(&outcome, "reverted");
    Ok(())
}

fn report_outcome(outcome: &ApplyOutcome, verb: &str) {
    if outcome.is_noop() {
        println!("{} Nothing to do; database is at {}", "✅".green(), outcome.record);
    } else {
        println!(
            "{} Successfully {verb} {} migration(s); database is at {}",
            "✅".green(),
            outcome.applied.len(),
            outcome.record
        );
    }
}

fn print_versions(migrator: &Migrator, versions: &[i64]) {
    let chain = migrator.repository().chain().ok();
    for (i, version) in versions.iter().enumerate() {
        let name = chain
            .as_ref()
            .and_then(|c| c.get(*version))
            .map(|s| s.file_name())
            .unwrap_or_else(|| version.to_string());
        println!("  {}. {}", i + 1, name);
    }
}

fn handle_status(settings: &Settings) -> anyhow::Result<()> {
    let migrator = settings.migrator();
    let executor = open_executor(settings)?;
    let store = PostgresHistoryStore::new(&executor);

    let status = migrator.status(&store)?;
    print_status(&status);
    Ok(())
}

fn print_status(status: &MigrationStatus) {
    let describe = |v: Option<i64>| v.map_or_else(|| "base".to_string(), |v| v.to_string());

    println!("\n📊 Migration Status\n");
    println!("Head: {}   Tip: {}", describe(status.head), describe(status.tip));
    println!();

    if status.applied.is_empty() {
        println!("✅ Applied Migrations: None");
    } else {
        println!("✅ Applied Migrations ({}):", status.applied_count);
        for script in &status.applied {
            println!("  {} m{}_{}", "✓".green(), script.version, script.name);
        }
    }

    println!();

    if status.pending.is_empty() {
        println!("⏳ Pending Migrations: None");
    } else {
        println!("⏳ Pending Migrations ({}):", status.pending_count);
        for script in &status.pending {
            let note = if script.reversible { "" } else { " (irreversible)" };
            println!("  {} m{}_{}{}", "⏳".yellow(), script.version, script.name, note);
        }
    }

    if !status.checksum_mismatches.is_empty() {
        println!();
        println!("{} Modified after apply:", "⚠".yellow());
        for mismatch in &status.checksum_mismatches {
            println!(
                "  m{}_{} (recorded {}, now {})",
                mismatch.version,
                mismatch.name,
                short(&mismatch.recorded),
                short(&mismatch.current)
            );
        }
    }

    println!(
        "\n📈 Summary: {} applied, {} pending",
        status.applied_count, status.pending_count
    );
}

fn short(checksum: &str) -> &str {
    checksum.get(..12).unwrap_or(checksum)
}

fn gate(settings: &Settings) -> ReadinessGate<PgHistoryReader> {
    ReadinessGate::new(
        &settings.migrations_dir,
        PgHistoryReader::new(settings.database_url.clone())
            .with_connect_timeout(settings.probe.connect_timeout()),
    )
}

fn handle_check(settings: &Settings, wait: Option<u64>) -> anyhow::Result<()> {
    let gate = gate(settings);
    let readiness = match wait {
        Some(seconds) => {
            gate.wait_until_ready(settings.probe.poll_interval(), Duration::from_secs(seconds))
        }
        None => gate.check_ready(),
    };

    println!("{}", readiness.to_json());
    match readiness {
        Readiness::Ready => Ok(()),
        Readiness::NotReady(reason) => Err(anyhow!("service is not ready: {reason}")),
    }
}

fn handle_probe(settings: &Settings) -> anyhow::Result<()> {
    let gate = Arc::new(gate(settings));
    let handle = schemagate::probe::serve(gate, &settings.probe).with_context(|| {
        format!(
            "failed to bind probe server on {}",
            settings.probe.bind_address()
        )
    })?;
    println!(
        "🩺 Probe server running at http://{}{}",
        settings.probe.bind_address(),
        settings.probe.readiness_path
    );
    handle
        .join()
        .map_err(|e| anyhow!("probe server stopped: {e:?}"))?;
    Ok(())
}
