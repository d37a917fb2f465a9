//! oxide-filter CLI
//!
//! Runs filtered queries against a SQLite database described by a schema
//! registry file.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::{json, Value as Json};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use oxide_filter::prelude::*;

/// Query a relational store with where/order/skip/limit/include/distinct filters.
#[derive(Parser)]
#[command(name = "oxide-filter")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Database URL (SQLite path or connection string).
    #[arg(short, long, env = "DATABASE_URL", default_value = "sqlite:db.sqlite3")]
    database: String,

    /// Schema registry file (JSON).
    #[arg(short, long, env = "OXIDE_FILTER_SCHEMA")]
    schema: PathBuf,

    /// Filter configuration file (JSON).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Session id passed to the store.
    #[arg(long, default_value = "cli")]
    session: String,

    /// Enable verbose output.
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List records matching the filters.
    Query {
        /// Entity to query.
        entity: String,

        /// Where condition as JSON, e.g. '{"title":{"like":"Test"}}'.
        #[arg(short = 'w', long = "where")]
        conditions: Vec<String>,

        /// Ordering, e.g. "id ASC".
        #[arg(short, long)]
        order: Vec<String>,

        /// Number of records to skip.
        #[arg(long)]
        skip: Option<i64>,

        /// Maximum number of records.
        #[arg(long)]
        limit: Option<i64>,

        /// Distinct field (repeatable).
        #[arg(long)]
        distinct: Vec<String>,

        /// Include tree as JSON or a dotted relationship path.
        #[arg(short, long)]
        include: Option<String>,

        /// Print only the first match.
        #[arg(long)]
        first: bool,
    },

    /// Count records matching the filters.
    Count {
        /// Entity to count.
        entity: String,

        /// Where condition as JSON.
        #[arg(short = 'w', long = "where")]
        conditions: Vec<String>,

        /// Distinct field (repeatable).
        #[arg(long)]
        distinct: Vec<String>,
    },

    /// Show one record by primary key.
    Get {
        /// Entity to read.
        entity: String,

        /// Primary key value.
        id: String,
    },
}

fn where_filters(conditions: &[String]) -> anyhow::Result<Vec<Json>> {
    conditions
        .iter()
        .map(|raw| {
            let parsed: Json = serde_json::from_str(raw)
                .with_context(|| format!("--where is not valid JSON: {raw}"))?;
            Ok(json!({ "where": parsed }))
        })
        .collect()
}

fn distinct_filter(distinct: &[String]) -> Option<Json> {
    (!distinct.is_empty()).then(|| json!({ "distinct": distinct }))
}

/// Accepts JSON, falling back to a bare string.
fn include_filter(include: &str) -> Json {
    let tree = serde_json::from_str(include).unwrap_or_else(|_| Json::String(include.to_string()));
    json!({ "include": tree })
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let schema = SchemaRegistry::from_file(&cli.schema)?;
    let config = match &cli.config {
        Some(path) => FilterConfig::from_file(path)?,
        None => FilterConfig::default(),
    };
    info!(entities = schema.entity_names().count(), "schema loaded");

    let store = RelationalStore::connect(&cli.database, Arc::new(schema), config).await?;

    match cli.command {
        Commands::Query {
            entity,
            conditions,
            order,
            skip,
            limit,
            distinct,
            include,
            first,
        } => {
            let mut filters = where_filters(&conditions)?;
            filters.extend(order.iter().map(|o| json!({ "order": o })));
            filters.extend(skip.map(|n| json!({ "skip": n })));
            filters.extend(limit.map(|n| json!({ "limit": n })));
            filters.extend(distinct_filter(&distinct));
            filters.extend(include.as_deref().map(include_filter));

            if first {
                let record = get_one_with_filters(&store, &cli.session, &entity, &filters).await?;
                print_json(&record)?;
            } else {
                let records = get_with_filters(&store, &cli.session, &entity, &filters).await?;
                print_json(&records)?;
            }
        }

        Commands::Count {
            entity,
            conditions,
            distinct,
        } => {
            let mut filters = where_filters(&conditions)?;
            filters.extend(distinct_filter(&distinct));
            let count = count_with_filters(&store, &cli.session, &entity, &filters).await?;
            println!("{count}");
        }

        Commands::Get { entity, id } => {
            let id = serde_json::from_str(&id).unwrap_or(Json::String(id));
            let record = get_by_id(&store, &cli.session, &entity, &id).await?;
            print_json(&record)?;
        }
    }

    Ok(())
}
