use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::Value;
use tracing::info;
use tracing_subscriber::EnvFilter;

use chunkdb_core::config::{expand_path, Config};
use chunkdb_core::embed::HashEmbedder;
use chunkdb_core::types::{
    Attributes, BackendProvider, Chunk, DeleteParams, IndexSpec, LogicalType, Scalar, SearchMode,
    SearchRequest, SimilarityMetric, WriteParams,
};
use chunkdb_core::{ChunkWriter, Embedder, QueryEngine, ReadOutcome};
use chunkdb_router::IndexRouter;

/// Manage chunk indexes across LanceDB, Tantivy, Neo4j and the remote search service.
#[derive(Parser, Debug)]
#[command(name = "chunkdb", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List indexes on every reachable backend.
    Indexes,
    CreateIndex(CreateArgs),
    DropIndex { name: String },
    /// Live chunk count of one index.
    Count { name: String },
    /// Load JSON-lines chunks into an index.
    Ingest(IngestArgs),
    Search(SearchArgs),
    /// Delete chunks by id, or by text and attributes.
    Delete(DeleteArgs),
}

#[derive(Args, Debug)]
struct CreateArgs {
    name: String,
    /// vector | text | graph | remote (lancedb, tantivy and neo4j also accepted)
    #[arg(long, default_value = "vector")]
    provider: BackendProvider,
    #[arg(long)]
    dimension: usize,
    #[arg(long, default_value = "cosine")]
    similarity: String,
    #[arg(long, default_value = "Chunk")]
    node_label: String,
    /// JSON Schema file describing the chunk payload.
    #[arg(long)]
    schema: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct IngestArgs {
    index: String,
    /// One chunk object per line.
    file: PathBuf,
    /// Compute hashed embeddings for chunks that carry none.
    #[arg(long)]
    embed: bool,
    #[arg(long, default_value_t = 256)]
    batch_size: usize,
    #[arg(long)]
    node_label: Option<String>,
}

#[derive(Args, Debug)]
struct SearchArgs {
    index: String,
    #[arg(long)]
    text: Option<String>,
    /// key=value, repeatable.
    #[arg(long = "attr", value_parser = parse_attr)]
    attrs: Vec<(String, Scalar)>,
    #[arg(long)]
    or: bool,
    #[arg(short, long, default_value_t = 10)]
    k: usize,
    /// vector | keyword | hybrid; inferred from the inputs when omitted.
    #[arg(long)]
    mode: Option<SearchMode>,
    /// Embed the query text with the hashed embedder.
    #[arg(long)]
    embed: bool,
}

#[derive(Args, Debug)]
struct DeleteArgs {
    index: String,
    #[arg(long = "id")]
    ids: Vec<String>,
    #[arg(long)]
    text: Option<String>,
    #[arg(long = "attr", value_parser = parse_attr)]
    attrs: Vec<(String, Scalar)>,
}

fn parse_attr(raw: &str) -> Result<(String, Scalar), String> {
    let (key, value) =
        raw.split_once('=').ok_or_else(|| format!("expected key=value, got '{raw}'"))?;
    let scalar = serde_json::from_str::<Value>(value)
        .ok()
        .and_then(|v| Scalar::from_json(&v))
        .unwrap_or_else(|| Scalar::from(value));
    Ok((key.trim().to_string(), scalar))
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Index dimension, needed to size hashed embeddings.
async fn dimension_of(router: &IndexRouter, index: &str) -> anyhow::Result<usize> {
    let info = router.get_index(index).await.into_result(index)?;
    info.embedding_dimension.with_context(|| format!("index '{index}' has no embedding dimension"))
}

fn read_chunks(path: &PathBuf) -> anyhow::Result<Vec<Chunk>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut chunks = Vec::new();
    for (n, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let chunk: Chunk = serde_json::from_str(&line)
            .with_context(|| format!("{}:{}", path.display(), n + 1))?;
        chunks.push(chunk);
    }
    Ok(chunks)
}

async fn ingest(router: &IndexRouter, args: IngestArgs) -> anyhow::Result<()> {
    let chunks = read_chunks(&expand_path(args.file.to_string_lossy()))?;
    let embedder = if args.embed {
        Some(HashEmbedder::new(dimension_of(router, &args.index).await?))
    } else {
        None
    };
    let mut params = WriteParams::new(&args.index).with_batch_size(args.batch_size);
    params.node_label = args.node_label;

    let bar = ProgressBar::new(chunks.len() as u64);
    bar.set_style(ProgressStyle::with_template("{bar:40} {pos}/{len} chunks ({eta})")?);
    for batch in chunks.chunks(args.batch_size.max(1)) {
        let embeddings = match &embedder {
            Some(embedder) => {
                let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
                let computed = embedder.embed_batch(&texts)?;
                let merged: Vec<Vec<f32>> = batch
                    .iter()
                    .zip(computed)
                    .map(|(c, v)| c.embedding.clone().unwrap_or(v))
                    .collect();
                Some(merged)
            }
            None => None,
        };
        router.index_chunks(batch, embeddings.as_deref(), &params).await?;
        bar.inc(batch.len() as u64);
    }
    bar.finish_and_clear();
    info!(index = %args.index, chunks = chunks.len(), "ingest complete");
    Ok(())
}

async fn search(router: &IndexRouter, args: SearchArgs) -> anyhow::Result<()> {
    let mut request = SearchRequest::new(&args.index).with_k(args.k);
    request.query_text = args.text;
    request.attrs = args.attrs.into_iter().collect();
    if args.or {
        request = request.with_logical(LogicalType::Or);
    }
    if let Some(mode) = args.mode {
        request = request.with_mode(mode);
    }
    if args.embed {
        let Some(text) = request.text().map(str::to_string) else { bail!("--embed needs --text") };
        let embedder = HashEmbedder::new(dimension_of(router, &args.index).await?);
        request = request.with_embedding(embedder.embed_text(&text));
    }
    match router.search(&request).await {
        ReadOutcome::Found(hits) => print_json(&hits),
        ReadOutcome::NotFound => bail!("index '{}' not found", args.index),
        ReadOutcome::Unavailable(err) => Err(err.into()),
    }
}

async fn delete(router: &IndexRouter, args: DeleteArgs) -> anyhow::Result<()> {
    let params = DeleteParams::new(&args.index);
    if !args.ids.is_empty() {
        router.delete_chunks(&args.ids, &params).await?;
    }
    let attrs: Attributes = args.attrs.into_iter().collect();
    if args.text.is_some() || !attrs.is_empty() {
        router.delete_chunks_matching(args.text.as_deref(), &attrs, &params).await?;
    } else if args.ids.is_empty() {
        bail!("nothing to delete: pass --id, --text or --attr");
    }
    Ok(())
}

async fn run(router: &IndexRouter, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Indexes => print_json(&router.get_indexes().await.unwrap_or_default()),
        Command::CreateIndex(args) => {
            let mut spec = IndexSpec::new(&args.name, args.dimension)
                .with_node_label(args.node_label)
                .with_similarity(args.similarity.parse::<SimilarityMetric>()?);
            if let Some(path) = args.schema {
                let raw = std::fs::read_to_string(expand_path(path.to_string_lossy()))?;
                spec = spec.with_schema(serde_json::from_str(&raw)?);
            }
            print_json(&router.create_index(args.provider, &spec).await?)
        }
        Command::DropIndex { name } => Ok(router.drop_index(&name).await?),
        Command::Count { name } => {
            println!("{}", router.number_chunks(&name).await.into_result(&name)?);
            Ok(())
        }
        Command::Ingest(args) => ingest(router, args).await,
        Command::Search(args) => search(router, args).await,
        Command::Delete(args) => delete(router, args).await,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let settings = Config::load()?.settings()?;
    let router = IndexRouter::connect(&settings).await?;
    let outcome = run(&router, cli.command).await;
    router.close().await?;
    outcome
}
