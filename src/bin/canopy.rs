//! Canopy CLI binary.

use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::Level;

use canopy::docs::{Document, FieldValue};
use canopy::{Config, Directory, QueryParser, QuerySession, Result, TextModel, WriteSession};

#[derive(Parser)]
#[command(name = "canopy", version, about = "An embedded vector-space search engine")]
struct Args {
    /// Data directory.
    #[arg(short, long, default_value = "./canopy-data")]
    dir: PathBuf,

    /// Configuration file (`key = value` lines).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Index JSONL documents into a collection.
    Index {
        /// Collection name.
        collection: String,

        /// JSONL input file, one document object per line.
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Query a collection.
    Query {
        /// Collection name.
        collection: String,

        /// Query string, e.g. `+title:cat -body:"big dog"`.
        query: String,

        /// Field a bare term applies to.
        #[arg(long, default_value = "title")]
        field: String,

        /// Documents to skip in the sorted result.
        #[arg(long, default_value_t = 0)]
        skip: usize,

        /// Documents to return; 0 means all.
        #[arg(long, default_value_t = 10)]
        take: usize,

        /// Fields to return; repeatable. All fields when omitted.
        #[arg(long)]
        select: Vec<String>,
    },
}

fn main() {
    let args = Args::parse();

    let level = match args.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        _ => Level::DEBUG,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();

    if let Err(e) = run(args) {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::new(),
    };
    let directory = Arc::new(Directory::open(&args.dir)?);
    let model = Arc::new(TextModel::new());

    match args.command {
        Command::Index { collection, file } => {
            let collection_id = directory.collection_id(&collection);
            let mut session = WriteSession::new(collection_id, directory, model, &config)?;

            let input = BufReader::new(std::fs::File::open(file)?);
            let mut count = 0u64;
            for line in input.lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                session.put(parse_document(&line)?)?;
                count += 1;
            }
            session.flush()?;

            println!("indexed {count} documents into {collection}");
        }
        Command::Query {
            collection,
            query,
            field,
            skip,
            take,
            select,
        } => {
            let collection_id = directory.collection_id(&collection);
            let query = QueryParser::new(field)
                .parse(&query)?
                .with_window(skip, take)
                .with_select(select);

            let session = QuerySession::new(collection_id, directory, model, config);
            let result = session.query(&query)?;

            println!("{} matches", result.total);
            for doc in result.documents {
                let fields: serde_json::Map<String, serde_json::Value> = doc
                    .fields
                    .iter()
                    .map(|(name, value)| (name.clone(), to_json(value)))
                    .collect();
                println!(
                    "{:.4}\t{}\t{}",
                    doc.score,
                    doc.doc_id,
                    serde_json::Value::Object(fields)
                );
            }
        }
    }

    Ok(())
}

fn parse_document(line: &str) -> Result<Document> {
    let value: serde_json::Value = serde_json::from_str(line)?;
    let object = value.as_object().ok_or_else(|| {
        canopy::CanopyError::index("each input line must be a JSON object")
    })?;

    Ok(object
        .iter()
        .map(|(name, value)| (name.clone(), from_json(value)))
        .collect())
}

fn from_json(value: &serde_json::Value) -> FieldValue {
    match value {
        serde_json::Value::String(text) => FieldValue::Text(text.clone()),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => FieldValue::Integer(i),
            None => FieldValue::Float(n.as_f64().unwrap_or_default()),
        },
        serde_json::Value::Bool(b) => FieldValue::Bool(*b),
        other => FieldValue::Text(other.to_string()),
    }
}

fn to_json(value: &FieldValue) -> serde_json::Value {
    match value {
        FieldValue::Text(text) => serde_json::Value::String(text.clone()),
        FieldValue::Integer(n) => serde_json::Value::from(*n),
        FieldValue::Float(n) => serde_json::Value::from(*n),
        FieldValue::Bool(b) => serde_json::Value::Bool(*b),
    }
}
