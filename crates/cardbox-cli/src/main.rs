use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use cardbox_core::{ObjectEventBatch, StreamEventBatch};
use cardbox_extract::FieldExtractor;
use cardbox_pipeline::{
    ExtractPipeline, GraphPipeline, IndexPipeline, IntakePipeline, PipelineConfig,
};
use cardbox_storage::graph::GremlinGraph;
use cardbox_storage::memory::{
    MemoryGraph, MemoryObjectStore, MemorySearchIndex, MemoryStatusStore, MemoryStream,
    MemoryTextDetector,
};
use cardbox_storage::sigv4::AwsCredentials;
use cardbox_storage::{
    AwsApi, DynamoStatusStore, GraphStore, HttpSearchIndex, KinesisStream, ObjectStore,
    RedisCache, S3ObjectStore, SearchIndex, StatusStore, StreamTransport, TextDetector,
    TextractDetector,
};
use cardbox_web::{AppState, WebConfig};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "cardbox-cli")]
#[command(about = "Business card box command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve the search and pymk gateways.
    Serve,
    /// Run one pipeline over a batch event read from a JSON file.
    Invoke {
        #[arg(value_enum)]
        pipeline: PipelineKind,
        event: PathBuf,
        /// Process against in-memory stores instead of live services.
        #[arg(long)]
        offline: bool,
    },
    /// Drop every edge and vertex from the graph in batches.
    ClearGraph {
        #[arg(long, default_value_t = 1000, value_parser = parse_batch_size)]
        batch_size: usize,
    },
}

/// A zero batch would drop nothing and spin the clear loops forever.
fn parse_batch_size(raw: &str) -> Result<usize, String> {
    match raw.parse::<usize>() {
        Ok(0) => Err("batch size must be at least 1".to_string()),
        Ok(n) => Ok(n),
        Err(err) => Err(err.to_string()),
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PipelineKind {
    Intake,
    Extract,
    Index,
    Graph,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve().await,
        Commands::Invoke {
            pipeline,
            event,
            offline,
        } => invoke(pipeline, &event, offline).await,
        Commands::ClearGraph { batch_size } => clear_graph(batch_size).await,
    }
}

fn aws_region() -> String {
    std::env::var("AWS_REGION").unwrap_or_else(|_| "ap-northeast-2".to_string())
}

fn aws_api() -> Result<AwsApi> {
    let credentials = AwsCredentials::from_env()?;
    let mut api = AwsApi::new(aws_region(), credentials)?;
    if let Ok(endpoint) = std::env::var("CARDBOX_AWS_ENDPOINT") {
        api = api.with_endpoint(endpoint);
    }
    Ok(api)
}

fn object_store() -> Result<S3ObjectStore> {
    let credentials = AwsCredentials::from_env()?;
    let mut store = S3ObjectStore::new(aws_region(), credentials)?;
    if let Ok(endpoint) = std::env::var("CARDBOX_AWS_ENDPOINT") {
        store = store.with_endpoint(endpoint);
    }
    Ok(store)
}

fn search_index() -> Result<HttpSearchIndex> {
    let url = std::env::var("CARDBOX_SEARCH_URL")
        .unwrap_or_else(|_| "http://localhost:9200".to_string());
    HttpSearchIndex::new(url)
}

fn graph_store() -> Result<GremlinGraph> {
    let url = std::env::var("CARDBOX_GRAPH_URL")
        .unwrap_or_else(|_| "http://localhost:8182".to_string());
    GremlinGraph::new(url)
}

fn redis_cache() -> Result<RedisCache> {
    let url = std::env::var("CARDBOX_REDIS_URL")
        .unwrap_or_else(|_| "redis://localhost:6379".to_string());
    RedisCache::new(&url)
}

async fn serve() -> Result<()> {
    let state = AppState {
        search: Arc::new(search_index()?),
        graph: Arc::new(graph_store()?),
        cache: Arc::new(redis_cache()?),
        config: WebConfig::from_env(),
    };
    cardbox_web::serve(state).await
}

async fn invoke(pipeline: PipelineKind, event: &Path, offline: bool) -> Result<()> {
    let raw = std::fs::read_to_string(event)
        .with_context(|| format!("reading event file {}", event.display()))?;
    let config = PipelineConfig::from_env();

    let counters = match pipeline {
        PipelineKind::Intake => {
            let batch: ObjectEventBatch =
                serde_json::from_str(&raw).context("parsing object event batch")?;
            let (transport, status): (Arc<dyn StreamTransport>, Arc<dyn StatusStore>) =
                if offline {
                    (
                        Arc::new(MemoryStream::new()),
                        Arc::new(MemoryStatusStore::new()),
                    )
                } else {
                    let api = aws_api()?;
                    (
                        Arc::new(KinesisStream::new(api.clone())),
                        Arc::new(DynamoStatusStore::new(api, config.status_table.clone())),
                    )
                };
            IntakePipeline::new(transport, status, config).run(&batch).await
        }
        PipelineKind::Extract => {
            let batch: StreamEventBatch =
                serde_json::from_str(&raw).context("parsing stream event batch")?;
            let (detector, objects, transport, status): (
                Arc<dyn TextDetector>,
                Arc<dyn ObjectStore>,
                Arc<dyn StreamTransport>,
                Arc<dyn StatusStore>,
            ) = if offline {
                (
                    Arc::new(MemoryTextDetector::new()),
                    Arc::new(MemoryObjectStore::new()),
                    Arc::new(MemoryStream::new()),
                    Arc::new(MemoryStatusStore::new()),
                )
            } else {
                let api = aws_api()?;
                (
                    Arc::new(TextractDetector::new(api.clone())),
                    Arc::new(object_store()?),
                    Arc::new(KinesisStream::new(api.clone())),
                    Arc::new(DynamoStatusStore::new(api, config.status_table.clone())),
                )
            };
            ExtractPipeline::new(
                detector,
                objects,
                transport,
                status,
                FieldExtractor::new(),
                config,
            )
            .run(&batch)
            .await
        }
        PipelineKind::Index => {
            let batch: StreamEventBatch =
                serde_json::from_str(&raw).context("parsing stream event batch")?;
            let search: Arc<dyn SearchIndex> = if offline {
                Arc::new(MemorySearchIndex::new())
            } else {
                Arc::new(search_index()?)
            };
            IndexPipeline::new(search, config).run(&batch).await
        }
        PipelineKind::Graph => {
            let batch: StreamEventBatch =
                serde_json::from_str(&raw).context("parsing stream event batch")?;
            let graph: Arc<dyn GraphStore> = if offline {
                Arc::new(MemoryGraph::new())
            } else {
                Arc::new(graph_store()?)
            };
            GraphPipeline::new(graph).run(&batch).await
        }
    };

    println!("{counters}");
    Ok(())
}

async fn clear_graph(batch_size: usize) -> Result<()> {
    let graph: Arc<dyn GraphStore> = Arc::new(graph_store()?);

    loop {
        let remaining = graph.drop_edges(batch_size).await?;
        info!(remaining, "dropped edge batch");
        if remaining == 0 {
            break;
        }
    }
    loop {
        let remaining = graph.drop_vertices(batch_size).await?;
        info!(remaining, "dropped vertex batch");
        if remaining == 0 {
            break;
        }
    }

    println!("graph cleared");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clear_graph_rejects_a_zero_batch_size() {
        let err = Cli::try_parse_from(["cardbox-cli", "clear-graph", "--batch-size", "0"]);
        assert!(err.is_err());
    }

    #[test]
    fn clear_graph_parses_a_positive_batch_size() {
        let cli = Cli::try_parse_from(["cardbox-cli", "clear-graph", "--batch-size", "50"])
            .expect("parse");
        match cli.command {
            Some(Commands::ClearGraph { batch_size }) => assert_eq!(batch_size, 50),
            other => panic!("expected clear-graph, got {other:?}"),
        }
    }
}
