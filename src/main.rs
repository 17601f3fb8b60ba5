use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;

use vecdb_coordinator::config::Config;
use vecdb_coordinator::db::{
    self, DatabaseLock, DatabaseRepository, MigrationOptions, SqlMigrationRunner, TransactionMode,
};
use vecdb_coordinator::{logging, DatabaseService, Version};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Bootstrap,
    Status,
    Upgrade { to: Option<String> },
    Migrate { transaction: Option<TransactionMode> },
}

struct Args {
    config_path: Option<PathBuf>,
    command: Command,
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = None;
    let mut command = None;
    let mut to = None;
    let mut transaction = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("vecdb-coordinator {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--config" | "-c" => {
                config_path = Some(PathBuf::from(require_value(&args, i)));
                i += 1;
            }
            "--to" => {
                to = Some(require_value(&args, i).to_string());
                i += 1;
            }
            "--transaction" => match require_value(&args, i).parse::<TransactionMode>() {
                Ok(mode) => {
                    transaction = Some(mode);
                    i += 1;
                }
                Err(e) => {
                    eprintln!("Error: {}", e);
                    std::process::exit(1);
                }
            },
            "bootstrap" | "status" | "upgrade" | "migrate" if command.is_none() => {
                command = Some(args[i].clone());
            }
            _ => {
                eprintln!("Unknown argument: {}", args[i]);
                print_help();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    let command = match command.as_deref() {
        None | Some("bootstrap") => Command::Bootstrap,
        Some("status") => Command::Status,
        Some("upgrade") => Command::Upgrade { to },
        Some(_) => Command::Migrate { transaction },
    };

    Args {
        config_path,
        command,
    }
}

fn require_value(args: &[String], i: usize) -> &str {
    match args.get(i + 1) {
        Some(value) => value.as_str(),
        None => {
            eprintln!("Error: {} requires an argument", args[i]);
            std::process::exit(1);
        }
    }
}

fn print_help() {
    println!(
        r#"vecdb-coordinator - PostgreSQL vector extension and migration coordinator

USAGE:
    vecdb-coordinator [OPTIONS] [COMMAND]

COMMANDS:
    bootstrap           Check the server, install/update the vector extension,
                        reindex and run migrations (default)
    status              Show server and extension versions
    upgrade             Upgrade the vector extension
        --to VERSION        Target version (default: newest available)
    migrate             Run pending migrations
        --transaction MODE  all, none or each (default: from config)

OPTIONS:
    --config, -c PATH   Path to config file
    --version, -V       Show version
    --help, -h          Show this help message

ENVIRONMENT:
    VECDB_DATABASE_URL       Database connection string
    VECDB_VECTOR_EXTENSION   pgvector or pgvecto.rs
    VECDB_LOG                Log level (trace, debug, info, warn, error)

Config file location: $XDG_CONFIG_HOME/vecdb-coordinator/config.toml"#
    );
}

fn open_repository(config: &Config) -> Result<DatabaseRepository> {
    // Configuration errors must surface before anything touches the database.
    let coordinator_config = config.resolve()?;
    let url = config.database_url()?;

    let migrations = if config.migrations.directory.is_dir() {
        SqlMigrationRunner::from_dir(&config.migrations.directory)?
    } else {
        tracing::warn!(
            directory = ?config.migrations.directory,
            "Migrations directory not found, no migrations will run"
        );
        SqlMigrationRunner::default()
    };

    let provider = db::open_pool(url, config.database.pool_size)?;
    Ok(DatabaseRepository::new(
        Arc::new(provider),
        coordinator_config,
        Box::new(migrations),
    ))
}

fn print_status(repository: &DatabaseRepository) -> Result<()> {
    let extension = repository.get_preferred_vector_extension();
    let show = |v: Option<Version>| v.map_or_else(|| "-".to_string(), |v| v.to_string());

    println!("PostgreSQL:         {}", repository.get_postgres_version()?);
    println!("Vector extension:   {} ({})", extension, extension.sql_name());
    println!(
        "Installed version:  {}",
        show(repository.get_extension_version(extension)?)
    );
    println!(
        "Available version:  {}",
        show(repository.get_available_extension_version(extension)?)
    );
    println!(
        "Supported range:    {}",
        repository.get_extension_version_range(repository.config().vector_extension)
    );
    println!("Locks:");
    for lock in DatabaseLock::ALL {
        println!("    {:<26}{}", lock.name(), lock.id());
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = parse_args();

    if let Err(e) = logging::init(None) {
        eprintln!("Warning: logging disabled: {:#}", e);
    }

    let config = match args.config_path {
        Some(path) => Config::load_from(&path)?,
        None => Config::load()?,
    };
    let repository = open_repository(&config)?;

    match args.command {
        Command::Bootstrap => {
            let report = DatabaseService::new(&repository)
                .init()
                .context("Database bootstrap failed")?;
            println!(
                "{} {} ready, {} migration(s) applied",
                report.extension,
                report.version,
                report.migrations.len()
            );
            if report.restart_required {
                println!("Restart the database server to finish the extension upgrade.");
            }
        }
        Command::Status => print_status(&repository)?,
        Command::Upgrade { to } => {
            let target = to.as_deref().map(Version::parse).transpose()?;
            let extension = repository.get_preferred_vector_extension();
            let result = repository.with_lock(DatabaseLock::Migrations, || {
                repository.update_vector_extension(extension, target.as_ref())
            })?;
            println!(
                "{} upgraded{}",
                extension,
                if result.restart_required {
                    ", restart the database server"
                } else {
                    ""
                }
            );
        }
        Command::Migrate { transaction } => {
            let options = MigrationOptions {
                transaction: transaction.unwrap_or(repository.config().migration_mode),
            };
            let applied = repository.with_lock(DatabaseLock::Migrations, || {
                repository.run_migrations(options)
            })?;
            for name in &applied {
                println!("applied {}", name);
            }
            println!("{} migration(s) applied", applied.len());
        }
    }

    Ok(())
}
