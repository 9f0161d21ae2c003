//! Bring a database in line with an entity definition file.
//!
//! The default mode prints the migration plan from the stored snapshots. `--apply` applies it,
//! and `--sync` updates tables in place instead. Destructive plans need `--allow-destructive`.

use clap::Parser;
use neo_db::{ensure_database_exists, ApplyOptions, DatabaseService, DatabaseSettings, EntityDefinition, MigrationStatus};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(version, about = "Plan, apply or sync PostgreSQL schema changes from entity definitions")]
struct Args {
    /// JSON file holding an array of entity definitions.
    entities: PathBuf,

    /// Database schema to manage; overrides NEO_DB_SCHEMA.
    #[clap(long)]
    schema: Option<String>,

    /// Print the plan without touching the database schema (default).
    #[clap(long, conflicts_with_all = ["apply", "sync"])]
    plan: bool,

    /// Apply the planned migrations.
    #[clap(long, conflicts_with = "sync")]
    apply: bool,

    /// Update tables in place without logging migrations.
    #[clap(long)]
    sync: bool,

    /// Allow migrations that drop tables or columns.
    #[clap(long)]
    allow_destructive: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("neo_db=info")),
        )
        .init();

    let args = Args::parse();
    let raw = std::fs::read_to_string(&args.entities)?;
    let entities: Vec<EntityDefinition> = serde_json::from_str(&raw)?;

    let mut settings = DatabaseSettings::from_env()?;
    if let Some(schema) = &args.schema {
        settings = settings.with_schema(schema.as_str());
    }
    settings.validate()?;
    ensure_database_exists(&settings.database_url).await?;
    let db = DatabaseService::connect(settings).await?;
    db.register_entities(&entities)?;
    db.initialize().await?;

    if args.sync {
        let report = db.sync_schema().await?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        db.close().await;
        if !report.is_ok() {
            std::process::exit(1);
        }
        return Ok(());
    }

    let plan = db.plan_migrations().await?;
    if plan.is_empty() {
        println!("schema is up to date");
        db.close().await;
        return Ok(());
    }
    for m in &plan.migrations {
        println!("{}  {}{}", m.version, m.name, if m.destructive { "  (destructive)" } else { "" });
        for statement in &m.up {
            println!("    {};", statement.replace('\n', "\n    "));
        }
    }
    for warning in plan.warnings() {
        println!("warning: {}", warning);
    }

    if !args.apply {
        db.close().await;
        return Ok(());
    }
    if plan.is_destructive() && !args.allow_destructive {
        eprintln!("plan discards data; rerun with --allow-destructive to apply");
        db.close().await;
        std::process::exit(1);
    }

    let options = ApplyOptions {
        allow_destructive: args.allow_destructive,
    };
    let results = db.apply_migrations(&plan.migrations, options).await?;
    let mut failed = false;
    for m in &results {
        match m.status {
            MigrationStatus::Applied => println!("applied  {}", m.version),
            MigrationStatus::Pending => println!("skipped  {}", m.version),
            MigrationStatus::Failed => {
                failed = true;
                println!("FAILED   {}: {}", m.version, m.error.as_deref().unwrap_or(""));
            }
        }
    }
    db.close().await;
    if failed {
        std::process::exit(1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_is_the_default_mode() {
        let args = Args::try_parse_from(["neo-sync", "entities.json"]).unwrap();
        assert_eq!(args.entities, PathBuf::from("entities.json"));
        assert!(!args.apply && !args.sync && !args.allow_destructive);
        assert!(args.schema.is_none());
    }

    #[test]
    fn apply_takes_schema_and_destructive_flags() {
        let args = Args::try_parse_from([
            "neo-sync",
            "entities.json",
            "--apply",
            "--schema",
            "tenant_a",
            "--allow-destructive",
        ])
        .unwrap();
        assert!(args.apply && args.allow_destructive);
        assert_eq!(args.schema.as_deref(), Some("tenant_a"));
    }

    #[test]
    fn modes_are_exclusive() {
        assert!(Args::try_parse_from(["neo-sync", "e.json", "--apply", "--sync"]).is_err());
        assert!(Args::try_parse_from(["neo-sync", "e.json", "--plan", "--apply"]).is_err());
        assert!(Args::try_parse_from(["neo-sync", "--apply"]).is_err());
    }
}
