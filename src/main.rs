//! Magents CLI - administration entry point for the shared data store.

use clap::Parser;
use magents::cli::{Cli, Commands};
use magents::engine::{ConsistencyEngine, RestoreOptions};
use magents::storage::{ImportConfig, LegacyImporter, SchemaStore, StoreConfig};
use magents::sync::{SyncServer, SyncServerConfig};
use magents::{shared, Error, SharedStore};
use std::path::PathBuf;
use std::process;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("magents=info")),
        )
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Error> {
    let db_path = match cli.db_path {
        Some(p) => p,
        None => magents::storage::default_store_path()?,
    };

    match cli.command {
        Commands::Serve {
            addr,
            max_connections,
        } => {
            let store = open_store(&db_path)?;
            let config = SyncServerConfig {
                addr,
                max_connections,
                ..Default::default()
            };
            let server = SyncServer::bind(store, config).await?;
            println!("Listening on ws://{}/ws", server.local_addr());
            tokio::signal::ctrl_c().await?;
            server.stop().await;
        }

        Commands::Migrate => {
            // initialize() applies pending migrations on open.
            let store = SchemaStore::initialize(&StoreConfig::at(&db_path))?;
            println!("Store at version {}", store.version());
        }

        Commands::Import {
            data_dir,
            dry_run,
            verify,
        } => {
            let store = open_store(&db_path)?;
            let mut config = ImportConfig::new(data_dir);
            config.dry_run = dry_run;
            let mut importer = LegacyImporter::new(config);

            let store = store.lock().await;
            let report = importer.run(store.conn())?;
            println!(
                "Imported {} of {} projects, {} of {} agents{}",
                report.projects_imported,
                report.projects_found,
                report.agents_imported,
                report.agents_found,
                if report.dry_run { " (dry run)" } else { "" },
            );
            for err in &report.errors {
                eprintln!("  failed: {}: {}", err.item, err.error);
            }
            if verify && !dry_run && !importer.verify(store.conn())? {
                return Err(Error::Validation(
                    "store counts do not match the JSON sources".to_string(),
                ));
            }
            if !report.success {
                return Err(Error::Validation(format!(
                    "{} records failed to import",
                    report.errors.len()
                )));
            }
        }

        Commands::RollbackImport { data_dir } => {
            let mut importer = LegacyImporter::new(ImportConfig::new(data_dir));
            let found = importer.discover_backups()?;
            if found == 0 {
                return Err(Error::NotFound("no import backups found".to_string()));
            }
            importer.rollback(Some(&db_path))?;
            println!("Restored {} source files and removed the store", found);
        }

        Commands::Backup {
            description,
            backup_dir,
        } => {
            let engine = engine_for(open_store(&db_path)?, backup_dir)?;
            let meta = engine.create_backup(description).await?;
            println!("{} ({} bytes) -> {}", meta.id, meta.size, meta.file_path);
        }

        Commands::Restore {
            path,
            skip_version_check,
            no_backup,
            dry_run,
        } => {
            let engine = engine_for(open_store(&db_path)?, None)?;
            let options = RestoreOptions {
                create_backup_before_restore: !no_backup,
                skip_version_check,
                dry_run,
                ..Default::default()
            };
            engine.restore_from_backup(&path, options).await?;
            if dry_run {
                println!("Backup {} is valid", path.display());
            } else {
                println!("Restored from {}", path.display());
            }
        }

        Commands::Backups => {
            let engine = engine_for(open_store(&db_path)?, None)?;
            let mut history = engine.backup_history().await?;
            history.reverse();
            if history.is_empty() {
                println!("No backups recorded");
            }
            for meta in history {
                println!(
                    "{}  {}  {} bytes  {}{}",
                    meta.timestamp.to_rfc3339(),
                    meta.id,
                    meta.size,
                    if meta.auto_created { "auto" } else { "manual" },
                    meta.description
                        .as_deref()
                        .map(|d| format!("  {}", d))
                        .unwrap_or_default(),
                );
            }
        }

        Commands::Cleanup {
            retention_days,
            max_backups,
        } => {
            let engine = engine_for(open_store(&db_path)?, None)?;
            let report = engine.cleanup_old_backups(retention_days, max_backups).await?;
            println!("Removed {} backups, kept {}", report.removed, report.kept);
        }

        Commands::Status => {
            let store = open_store(&db_path)?;
            let store = store.lock().await;
            let stats = store.stats()?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
    }
    Ok(())
}

fn open_store(path: &PathBuf) -> Result<SharedStore, Error> {
    Ok(shared(SchemaStore::initialize(&StoreConfig::at(path))?))
}

fn engine_for(
    store: SharedStore,
    backup_dir: Option<PathBuf>,
) -> Result<ConsistencyEngine, Error> {
    match backup_dir {
        Some(dir) => Ok(ConsistencyEngine::with_backup_dir(store, dir)),
        None => ConsistencyEngine::new(store),
    }
}
