//! Biblink - Main entry point
//!
//! `biblink harvest` pulls one OAI-PMH feed into in-memory storage, clusters
//! the records by the given match keys, and writes the merged clusters to
//! stdout as an OAI-PMH `ListRecords` response. `biblink decode` prints a
//! MARC-XML file as MARC-in-JSON.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use biblink_common::logging::{init_logging, LogConfig, LogLevel};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{error, info};

use biblink_server::config::Config;
use biblink_server::export::{format_datestamp, ClusterExportStream, ExportOptions};
use biblink_server::harvest::{HarvestConfig, HarvestService};
use biblink_server::marc::decode_str;
use biblink_server::matchkey::{MatchKeyConfig, MatchKeyEngine};
use biblink_server::storage::{JobStore, MemoryJobStore, MemoryStorage, Storage};

const OAI_NAMESPACE: &str = "http://www.openarchives.org/OAI/2.0/";

#[derive(Parser, Debug)]
#[command(name = "biblink", version, about = "MARC record aggregation over OAI-PMH")]
struct Cli {
    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Harvest a feed, cluster its records and export the clusters
    Harvest(HarvestArgs),

    /// Print a MARC-XML record as MARC-in-JSON
    Decode {
        /// MARC-XML file
        path: PathBuf,
    },
}

#[derive(Args, Debug)]
struct HarvestArgs {
    /// OAI-PMH endpoint
    #[arg(long)]
    url: String,

    /// Identifier of the harvested source
    #[arg(long)]
    source_id: String,

    #[arg(long, default_value = "marcxml")]
    metadata_prefix: String,

    #[arg(long)]
    from: Option<String>,

    #[arg(long)]
    until: Option<String>,

    /// OAI set to harvest
    #[arg(long)]
    set: Option<String>,

    /// Extra request header, `NAME=VALUE`
    #[arg(long = "header", value_parser = parse_pair)]
    headers: Vec<(String, String)>,

    /// Extra query parameter, `NAME=VALUE`
    #[arg(long = "param", value_parser = parse_pair)]
    params: Vec<(String, String)>,

    /// Match key, `ID=jsonpath:EXPR` or `ID=script:FILE`
    #[arg(long = "match-key", value_parser = parse_match_key)]
    match_keys: Vec<MatchKeyConfig>,

    /// setSpec written on exported records
    #[arg(long, default_value = "all")]
    set_spec: String,

    /// Export headers only
    #[arg(long)]
    identifiers_only: bool,
}

fn parse_pair(s: &str) -> std::result::Result<(String, String), String> {
    s.split_once('=')
        .filter(|(name, _)| !name.is_empty())
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .ok_or_else(|| format!("expected NAME=VALUE, got `{s}`"))
}

fn parse_match_key(s: &str) -> std::result::Result<MatchKeyConfig, String> {
    let (id, definition) = parse_pair(s)?;
    let (method, arg) = definition
        .split_once(':')
        .ok_or_else(|| format!("expected METHOD:ARG, got `{definition}`"))?;
    let params = match method {
        "jsonpath" => json!({ "expr": arg }),
        "script" | "javascript" => json!({ "filename": arg }),
        other => return Err(format!("unknown match key method `{other}`")),
    };
    Ok(MatchKeyConfig::new(id, method, params))
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_config = if cli.verbose {
        LogConfig::builder()
            .level(LogLevel::Debug)
            .log_file_prefix("biblink")
            .build()
    } else {
        LogConfig::builder()
            .level(LogLevel::Info)
            .log_file_prefix("biblink")
            .filter_directives("reqwest=warn,hyper=warn")
            .build()
    };

    // Environment variables take precedence
    let log_config = LogConfig::from_env().unwrap_or(log_config);
    if let Err(e) = init_logging(&log_config) {
        eprintln!("Warning: logging disabled: {e:#}");
    }

    let result = match cli.command {
        Command::Harvest(args) => harvest(args).await,
        Command::Decode { path } => decode(path).await,
    };

    if let Err(e) = result {
        error!(error = %e, "Command failed");
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

async fn harvest(args: HarvestArgs) -> Result<()> {
    let config = Config::load()?;

    let engine = Arc::new(MatchKeyEngine::new(config.match_key.limits()));
    let storage = Arc::new(MemoryStorage::new(engine));
    for key in args.match_keys {
        let id = key.id.clone();
        storage
            .add_match_key(key)
            .await
            .with_context(|| format!("match key {id}"))?;
    }

    let mut harvest = HarvestConfig::new(args.url, args.source_id);
    harvest.metadata_prefix = Some(args.metadata_prefix);
    harvest.from = args.from;
    harvest.until = args.until;
    harvest.set = args.set;
    harvest.headers = args.headers.into_iter().collect::<BTreeMap<_, _>>();
    harvest.params = args.params.into_iter().collect::<BTreeMap<_, _>>();
    info!(url = %harvest.display_url(), source_id = %harvest.source_id, "Starting harvest");

    let jobs = Arc::new(MemoryJobStore::new());
    jobs.create("cli", harvest).await?;

    let service = HarvestService::new(&config, jobs, storage.clone())?;
    let state = service.start("cli").await?.wait().await?;
    info!(
        total_records = state.total_records,
        total_requests = state.total_requests,
        "Harvest finished"
    );
    if let Some(message) = state.error {
        bail!("harvest failed after {} records: {message}", state.total_records);
    }

    let mut options = ExportOptions::from_settings(&config.export);
    options.with_metadata = !args.identifiers_only;
    let items = storage.export_items(&args.set_spec).await;
    let clusters = items.len();
    let verb = if options.with_metadata {
        "ListRecords"
    } else {
        "ListIdentifiers"
    };

    let mut out = tokio::io::stdout();
    write_open(&mut out, verb).await?;
    let storage: Arc<dyn Storage> = storage;
    let mut stream = ClusterExportStream::new(out, storage, options);
    for item in items {
        stream.write(item).await?;
    }
    let mut out = stream.end().await?;
    out.write_all(format!("</{verb}>\n</OAI-PMH>\n").as_bytes())
        .await?;
    out.flush().await?;

    info!(clusters, "Export finished");
    Ok(())
}

async fn write_open<W: AsyncWrite + Unpin>(out: &mut W, verb: &str) -> std::io::Result<()> {
    let head = format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <OAI-PMH xmlns=\"{OAI_NAMESPACE}\">\n\
         <responseDate>{}</responseDate>\n\
         <{verb}>\n",
        format_datestamp(Utc::now())
    );
    out.write_all(head.as_bytes()).await
}

async fn decode(path: PathBuf) -> Result<()> {
    let xml = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let doc = decode_str(&xml)?;
    println!("{}", serde_json::to_string_pretty(&doc.to_json())?);
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pair() {
        assert_eq!(
            parse_pair("X-Api-Key=a=b").unwrap(),
            ("X-Api-Key".to_string(), "a=b".to_string())
        );
        assert!(parse_pair("novalue").is_err());
        assert!(parse_pair("=v").is_err());
    }

    #[test]
    fn test_parse_match_key() {
        let key = parse_match_key("isbn=jsonpath:$.isbn[*]").unwrap();
        assert_eq!(key.id, "isbn");
        assert_eq!(key.method, "jsonpath");
        assert_eq!(key.params, json!({"expr": "$.isbn[*]"}));

        let key = parse_match_key("title=script:keys/title.js").unwrap();
        assert_eq!(key.params, json!({"filename": "keys/title.js"}));

        assert!(parse_match_key("isbn=xpath://isbn").is_err());
        assert!(parse_match_key("isbn").is_err());
    }

    #[test]
    fn test_cli_parses_harvest() {
        let cli = Cli::try_parse_from([
            "biblink",
            "harvest",
            "--url",
            "http://example.org/oai",
            "--source-id",
            "loc",
            "--header",
            "Authorization=Bearer x",
            "--match-key",
            "isbn=jsonpath:$.isbn",
        ])
        .unwrap();

        let Command::Harvest(args) = cli.command else {
            panic!("expected harvest");
        };
        assert_eq!(args.metadata_prefix, "marcxml");
        assert_eq!(args.headers.len(), 1);
        assert_eq!(args.match_keys.len(), 1);
        assert!(!args.identifiers_only);
    }
}
