//! es - inspect an entity store from the command line

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use colored::Colorize;
use entitystore::{DocRef, Filter, Query, Store};
use eyre::{Context, Result, eyre};
use log::debug;
use serde_json::Value;

#[derive(Parser)]
#[command(name = "es", about = "Inspect an entity store", version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Store directory (defaults to the pipeline's data directory)
    #[arg(short, long, global = true)]
    store: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List collections and document counts
    Collections,

    /// Print one document
    Get { collection: String, id: String },

    /// Query a collection
    Query {
        collection: String,

        /// Equality filter as field=value (repeatable)
        #[arg(short = 'w', long = "where")]
        filters: Vec<String>,

        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Dump a collection as JSON lines
    Dump { collection: String },
}

fn default_store_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("footprintd")
        .join("store")
}

/// Parse `field=value`; the value is read as JSON when possible, else as a string
fn parse_filter(raw: &str) -> Result<Filter> {
    let (field, value) = raw
        .split_once('=')
        .ok_or_else(|| eyre!("filter must look like field=value: {}", raw))?;
    let value = serde_json::from_str::<Value>(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok(Filter::eq(field, value))
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let dir = cli.store.unwrap_or_else(default_store_dir);
    debug!("main: opening store at {}", dir.display());
    let store = Store::open(&dir).context(format!("Failed to open store at {}", dir.display()))?;

    match cli.command {
        Command::Collections => {
            for (name, count) in store.collections()? {
                println!("{:<20} {}", name.cyan(), count);
            }
        }
        Command::Get { collection, id } => {
            let reference = DocRef::new(collection, id);
            match store.get(&reference)? {
                Some(doc) => {
                    println!("{} {}", reference.to_string().bold(), format!("v{}", doc.version).dimmed());
                    println!("{}", serde_json::to_string_pretty(&doc.fields)?);
                }
                None => {
                    eprintln!("{} {}", "not found:".red(), reference);
                    std::process::exit(1);
                }
            }
        }
        Command::Query {
            collection,
            filters,
            limit,
        } => {
            let mut query = Query::new(collection);
            for raw in &filters {
                query = query.filter(parse_filter(raw)?);
            }
            if let Some(limit) = limit {
                query = query.limit(limit);
            }
            let docs = store.query(&query)?;
            for doc in &docs {
                println!("{} {}", doc.reference.to_string().cyan(), Value::Object(doc.fields.clone()));
            }
            println!("{}", format!("{} document(s)", docs.len()).dimmed());
        }
        Command::Dump { collection } => {
            for doc in store.query(&Query::new(collection))? {
                println!("{}", serde_json::to_string(&doc)?);
            }
        }
    }
    Ok(())
}
