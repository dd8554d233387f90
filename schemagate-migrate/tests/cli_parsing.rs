use clap::Parser;
use schemagate::config::GateConfig;
use schemagate::migration::DEFAULT_MESSAGE;
use schemagate_migrate::cli::{Cli, Commands};
use schemagate_migrate::commands::Settings;
use std::path::PathBuf;
use std::time::Duration;

fn parse(args: &[&str]) -> Cli {
    Cli::try_parse_from(std::iter::once("schemagate-migrate").chain(args.iter().copied()))
        .expect("arguments should parse")
}

#[test]
fn test_generate_joins_message_words() {
    let cli = parse(&["generate", "add", "reports", "table", "--apply"]);
    match cli.command {
        Commands::Generate {
            apply,
            empty,
            message,
        } => {
            assert!(apply);
            assert!(!empty);
            assert_eq!(Commands::message(&message), "add reports table");
        }
        other => panic!("unexpected command: {other:?}"),
    }
}

#[test]
fn test_generate_without_message_uses_default() {
    let cli = parse(&["generate", "--empty"]);
    match cli.command {
        Commands::Generate { empty, message, .. } => {
            assert!(empty);
            assert_eq!(Commands::message(&message), DEFAULT_MESSAGE);
        }
        other => panic!("unexpected command: {other:?}"),
    }
}

#[test]
fn test_apply_defaults_to_head() {
    let cli = parse(&["apply"]);
    match cli.command {
        Commands::Apply { target, dry_run } => {
            assert_eq!(target, "head");
            assert!(!dry_run);
        }
        other => panic!("unexpected command: {other:?}"),
    }

    let cli = parse(&["apply", "20240101000000", "--dry-run"]);
    match cli.command {
        Commands::Apply { target, dry_run } => {
            assert_eq!(target, "20240101000000");
            assert!(dry_run);
        }
        other => panic!("unexpected command: {other:?}"),
    }
}

#[test]
fn test_downgrade_requires_target() {
    assert!(Cli::try_parse_from(["schemagate-migrate", "downgrade"]).is_err());

    let cli = parse(&["downgrade", "base"]);
    assert!(matches!(cli.command, Commands::Downgrade { ref target } if target == "base"));
}

#[test]
fn test_check_wait_and_global_flags() {
    let cli = parse(&["check", "--wait", "30", "--migrations-dir", "sql", "-v"]);
    assert!(cli.verbose);
    assert_eq!(cli.migrations_dir, Some(PathBuf::from("sql")));
    assert!(matches!(cli.command, Commands::Check { wait: Some(30) }));
}

#[test]
fn test_verbose_conflicts_with_quiet() {
    assert!(Cli::try_parse_from(["schemagate-migrate", "-v", "-q", "status"]).is_err());
}

#[test]
fn test_settings_prefer_flag_over_env_over_config() {
    let mut config = GateConfig::default();
    config.database.url = "postgres://config/db".to_string();
    config.migrations.lock_timeout_seconds = 10;

    let cli = parse(&["status"]);
    let settings = Settings::resolve(&cli, config.clone(), None);
    assert_eq!(settings.database_url, "postgres://config/db");
    assert_eq!(settings.migrations_dir, PathBuf::from("db/migrations"));
    assert_eq!(settings.lock_timeout, Duration::from_secs(10));

    let settings = Settings::resolve(&cli, config.clone(), Some("postgres://env/db".to_string()));
    assert_eq!(settings.database_url, "postgres://env/db");

    let cli = parse(&[
        "status",
        "--database-url",
        "postgres://flag/db",
        "--schema-file",
        "model.toml",
    ]);
    let settings = Settings::resolve(&cli, config, Some("postgres://env/db".to_string()));
    assert_eq!(settings.database_url, "postgres://flag/db");
    assert_eq!(settings.schema_file, PathBuf::from("model.toml"));
}

#[test]
fn test_settings_load_reads_config_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("gate.toml");
    std::fs::write(
        &path,
        "[migrations]\ndir = \"sql/migrations\"\n\n[probe]\nport = 9100\n",
    )
    .expect("write config");

    let config = path.to_string_lossy().to_string();
    let cli = parse(&[
        "status",
        "--config",
        &config,
        "--database-url",
        "postgres://flag/db",
    ]);
    let settings = Settings::load(&cli).expect("load settings");

    assert_eq!(settings.database_url, "postgres://flag/db");
    assert_eq!(settings.migrations_dir, PathBuf::from("sql/migrations"));
    assert_eq!(settings.probe.port, 9100);
}

#[test]
fn test_settings_load_rejects_malformed_config() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("gate.toml");
    std::fs::write(&path, "[probe]\nport = \"not a number\"\n").expect("write config");

    let config = path.to_string_lossy().to_string();
    let cli = parse(&["status", "--config", &config]);
    assert!(Settings::load(&cli).is_err());
}
