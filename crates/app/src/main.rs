use chrono::Utc;
use clap::{Parser, Subcommand};
use docshelf_core::{
    collect_sources, document_source, JsonMetadataResolver, MetadataResolver, NoMetadata,
    Pipeline, PipelineConfig, QueryFilters, SearchMode, SearchQuery,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "docshelf", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// TOML config file; every setting has a default.
    #[arg(long, env = "DOCSHELF_CONFIG")]
    config: Option<PathBuf>,

    /// Qdrant base URL
    #[arg(long, env = "QDRANT_URL")]
    qdrant_url: Option<String>,

    /// Qdrant API key
    #[arg(long, env = "QDRANT_API_KEY", hide_env_values = true)]
    qdrant_api_key: Option<String>,

    /// Prefix for project collection names
    #[arg(long)]
    collection_prefix: Option<String>,

    /// Append one JSON line per ingested document to this file.
    #[arg(long, env = "DOCSHELF_AUDIT_LOG")]
    audit_log: Option<PathBuf>,

    /// Reference library export (JSON array) used to resolve citations.
    #[arg(long, env = "DOCSHELF_LIBRARY")]
    library: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Convert, chunk, embed and index PDFs into a project collection.
    Ingest {
        /// Project the documents belong to.
        #[arg(long)]
        project: String,
        /// A single PDF.
        #[arg(long, conflicts_with = "folder", required_unless_present = "folder")]
        file: Option<PathBuf>,
        /// Folder that contains PDFs recursively.
        #[arg(long)]
        folder: Option<PathBuf>,
        /// Citekey for a single file.
        #[arg(long, requires = "file")]
        citekey: Option<String>,
        /// Convert in page windows regardless of document length.
        #[arg(long, default_value_t = false)]
        force_windowed: bool,
        /// Pages per conversion window.
        #[arg(long)]
        window_size: Option<u32>,
        /// Move the project to a new collection if its embedding models changed.
        #[arg(long, default_value_t = false)]
        migrate: bool,
    },
    /// Search a project and print cited passages.
    Query {
        #[arg(long)]
        project: String,
        /// Search text
        #[arg(long)]
        text: String,
        /// Number of passages to return (capped by retrieval.max_top_k).
        #[arg(long, default_value = "6")]
        top_k: usize,
        /// dense or hybrid
        #[arg(long, default_value = "dense")]
        mode: SearchMode,
        /// Return untrimmed passage text.
        #[arg(long, default_value_t = false)]
        full_text: bool,
        #[arg(long)]
        citekey: Option<String>,
        #[arg(long = "doc-id")]
        doc_ids: Vec<String>,
        #[arg(long = "tag")]
        tags: Vec<String>,
        #[arg(long)]
        year: Option<i32>,
        /// Print the response as JSON.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Show a project's collection binding and point count.
    Describe {
        #[arg(long)]
        project: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();
    let mut config = PipelineConfig::load(cli.config.as_deref())
        .map_err(|error| anyhow::anyhow!(error.to_string()))?;
    apply_overrides(&mut config, &cli);

    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        qdrant = %config.qdrant.url,
        "docshelf boot"
    );

    let metadata: Arc<dyn MetadataResolver> = match &cli.library {
        Some(path) => Arc::new(
            JsonMetadataResolver::from_path(path)
                .map_err(|error| anyhow::anyhow!(error.to_string()))?,
        ),
        None => Arc::new(NoMetadata),
    };

    match cli.command {
        Command::Ingest {
            project,
            file,
            folder,
            citekey,
            force_windowed,
            window_size,
            migrate,
        } => {
            if force_windowed {
                config.windowing.force_windowed = true;
            }
            if let Some(window_size) = window_size {
                config.windowing.window_size = window_size;
            }
            config
                .validate()
                .map_err(|error| anyhow::anyhow!(error.to_string()))?;

            let pipeline = Pipeline::from_config(&config, metadata)
                .map_err(|error| anyhow::anyhow!(error.to_string()))?
                .allow_migration(migrate);

            let (sources, mut skipped) = match (&file, &folder) {
                (Some(file), _) => (
                    vec![document_source(file, citekey.as_deref())
                        .map_err(|error| anyhow::anyhow!(error.to_string()))?],
                    Vec::new(),
                ),
                (None, Some(folder)) => {
                    collect_sources(folder).map_err(|error| anyhow::anyhow!(error.to_string()))?
                }
                (None, None) => anyhow::bail!("pass --file or --folder"),
            };

            info!(project = %project, documents = sources.len(), "ingesting documents");
            let mut batch = pipeline.ingest_batch(&project, &sources).await;
            batch.failures.append(&mut skipped);

            for report in &batch.reports {
                println!(
                    "{} chunks_written={} chunks_filtered={} correlation_id={}",
                    report.doc_id,
                    report.chunks_written,
                    report.chunks_filtered,
                    report.correlation_id
                );
                for warning in &report.warnings {
                    println!("  warning: {warning}");
                }
            }
            for failed in &batch.failures {
                warn!(path = %failed.path.display(), reason = %failed.reason, "skipped document");
                println!("failed: {} ({})", failed.path.display(), failed.reason);
            }

            println!(
                "{} chunks ingested into project {} at {}",
                batch.chunks_written(),
                project,
                Utc::now().to_rfc3339()
            );

            if batch.reports.is_empty() && !batch.failures.is_empty() {
                anyhow::bail!("no document could be ingested");
            }
        }
        Command::Query {
            project,
            text,
            top_k,
            mode,
            full_text,
            citekey,
            doc_ids,
            tags,
            year,
            json,
        } => {
            let pipeline = Pipeline::from_config(&config, metadata)
                .map_err(|error| anyhow::anyhow!(error.to_string()))?;

            let query = SearchQuery {
                project_id: project,
                text,
                top_k,
                filters: QueryFilters {
                    doc_ids,
                    citekey,
                    tags,
                    year,
                },
                mode,
                full_text,
            };

            let response = pipeline
                .query(&query)
                .await
                .map_err(|error| anyhow::anyhow!(error.to_string()))?;

            if json {
                println!("{}", serde_json::to_string_pretty(&response)?);
                return Ok(());
            }

            println!("query: {} ({} mode, {} hits)", query.text, response.mode, response.count);
            for hit in &response.items {
                let source = hit
                    .citekey
                    .clone()
                    .or_else(|| hit.title.clone())
                    .unwrap_or_else(|| hit.doc_id.clone());
                println!(
                    "[{source}] score={:.4} pages={}-{} chunk={}",
                    hit.score, hit.page_start, hit.page_end, hit.chunk_id
                );
                if !hit.section_path.is_empty() {
                    println!("  section={}", hit.section_path.join(" > "));
                }
                println!("  {}", hit.text);
            }
        }
        Command::Describe { project } => {
            let pipeline = Pipeline::from_config(&config, metadata)
                .map_err(|error| anyhow::anyhow!(error.to_string()))?;

            match pipeline
                .describe(&project)
                .await
                .map_err(|error| anyhow::anyhow!(error.to_string()))?
            {
                Some(status) => println!("{}", serde_json::to_string_pretty(&status)?),
                None => println!("project {project} has no collection yet"),
            }
        }
    }

    Ok(())
}

fn apply_overrides(config: &mut PipelineConfig, cli: &Cli) {
    if let Some(url) = &cli.qdrant_url {
        config.qdrant.url = url.clone();
    }
    if let Some(api_key) = &cli.qdrant_api_key {
        config.qdrant.api_key = Some(api_key.clone());
    }
    if let Some(prefix) = &cli.collection_prefix {
        config.collection.prefix = prefix.clone();
    }
    if let Some(path) = &cli.audit_log {
        config.audit.path = Some(path_or_relative(path));
    }
}

fn path_or_relative(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|dir| dir.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    }
}
