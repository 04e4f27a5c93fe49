use anyhow::{bail, Context};
use bookqa_core::{
    discover_pdf_files, AccountFile, ApiKeyPool, BookQa, BookRegistry, ConversationLog,
    EmbeddingProvider, GeminiClient, HashingEmbedder, InMemoryVectorStore, IngestOutcome,
    Providers, QdrantStore, Settings, VectorStore, DEFAULT_EMBEDDING_DIMENSIONS,
};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Vector width produced by the Gemini embedding model.
const GEMINI_EMBEDDING_DIMENSIONS: usize = 768;

#[derive(Parser)]
#[command(name = "bookqa", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Account name; every book, vector and conversation is kept per user.
    #[arg(long, env = "BOOKQA_USER")]
    user: String,

    #[arg(long, env = "BOOKQA_PASSWORD", hide_env_values = true)]
    password: String,

    /// Gemini API key; repeat to rotate across several keys.
    #[arg(long = "api-key")]
    api_keys: Vec<String>,

    /// Directory holding account, book, vector and history files.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[arg(long)]
    chunk_size: Option<usize>,

    #[arg(long)]
    page_batch_size: Option<usize>,

    #[arg(long)]
    max_workers: Option<usize>,

    /// Store vectors in Qdrant instead of the local JSON file.
    #[arg(long, env = "QDRANT_URL")]
    qdrant_url: Option<String>,

    #[arg(long, default_value = "book_chunks")]
    qdrant_collection: String,

    /// Embed locally with hashed character trigrams instead of Gemini.
    #[arg(long, default_value_t = false)]
    offline: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Create an account.
    Register,
    /// Ingest one PDF or every PDF below a folder.
    Ingest {
        path: PathBuf,
        /// Also extract text from embedded images with the vision model.
        #[arg(long, default_value_t = false)]
        images: bool,
    },
    /// Ask a question against the ingested books.
    Ask {
        question: String,
        /// Restrict retrieval to these books; repeatable.
        #[arg(long = "book")]
        books: Vec<String>,
    },
    /// List ingested books.
    Books,
    /// Remove a book and its chunks.
    Forget { book: String },
    /// Print the conversation so far.
    History,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();
    let settings = settings_from(&cli)?;
    tokio::fs::create_dir_all(&settings.data_dir)
        .await
        .with_context(|| format!("creating {}", settings.data_dir.display()))?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        started_at = %Utc::now().to_rfc3339(),
        data_dir = %settings.data_dir.display(),
        "bookqa boot"
    );

    let accounts = AccountFile::new(&settings.data_dir);
    if let Command::Register = cli.command {
        if accounts.register(&cli.user, &cli.password)? {
            println!("registered {}", cli.user);
        } else {
            bail!("username {} already exists", cli.user);
        }
        return Ok(());
    }
    if !accounts.login(&cli.user, &cli.password)? {
        bail!("invalid username or password");
    }

    match &cli.command {
        Command::Register => {}
        Command::Books => {
            let registry = BookRegistry::open(&settings.data_dir, &cli.user)?;
            for (hash, record) in registry.entries() {
                println!(
                    "{}  {}  {}",
                    record.name,
                    record.ingested_at.to_rfc3339(),
                    &hash[..12.min(hash.len())]
                );
            }
        }
        Command::History => {
            let log = ConversationLog::open(&settings.data_dir, &cli.user)?;
            for turn in log.turns() {
                println!("{}: {}", turn.role.label(), turn.content);
            }
        }
        Command::Ingest { path, images } => {
            let qa = book_qa(&cli, &settings).await?;
            let mut registry = BookRegistry::open(&settings.data_dir, &cli.user)?;
            let files = discover_pdf_files(path);
            if files.is_empty() {
                bail!("no PDF files found at {}", path.display());
            }

            let mut failed = 0usize;
            for file in &files {
                match qa.ingest_book(file, &mut registry, *images).await {
                    Ok(IngestOutcome::Ingested {
                        source,
                        text_chunks,
                        image_chunks,
                    }) => println!(
                        "{source}: {text_chunks} text chunk(s), {image_chunks} image chunk(s)"
                    ),
                    Ok(IngestOutcome::Duplicate { source }) => {
                        println!("{source}: already processed")
                    }
                    Ok(IngestOutcome::Empty { source }) => {
                        println!("{source}: no text could be extracted")
                    }
                    Err(error) => {
                        failed += 1;
                        warn!(path = %file.display(), %error, "failed to ingest pdf");
                    }
                }
            }

            if failed > 0 {
                bail!("{failed} of {} file(s) failed to ingest", files.len());
            }
        }
        Command::Ask { question, books } => {
            let qa = book_qa(&cli, &settings).await?;
            let mut log = ConversationLog::open(&settings.data_dir, &cli.user)?;
            let answer = qa.ask(question, books, &mut log).await?;

            println!("{}", answer.text);
            if !answer.sources.is_empty() {
                println!("\nSources:");
                for source in answer.sources {
                    println!("- {source}");
                }
            }
        }
        Command::Forget { book } => {
            let qa = book_qa(&cli, &settings).await?;
            let mut registry = BookRegistry::open(&settings.data_dir, &cli.user)?;
            match qa.forget_book(book, &mut registry).await? {
                Some(record) => println!("removed {}", record.name),
                None => bail!("no book named {book}"),
            }
        }
    }

    Ok(())
}

fn settings_from(cli: &Cli) -> anyhow::Result<Settings> {
    let mut settings = Settings::from_env()?;
    if !cli.api_keys.is_empty() {
        settings.api_keys = cli.api_keys.clone();
    }
    if let Some(dir) = &cli.data_dir {
        settings.data_dir = dir.clone();
    }
    if let Some(value) = cli.chunk_size {
        settings.chunk_size = value;
    }
    if let Some(value) = cli.page_batch_size {
        settings.page_batch_size = value;
    }
    if let Some(value) = cli.max_workers {
        settings.max_workers = value;
    }
    settings.validate()?;
    Ok(settings)
}

async fn book_qa(cli: &Cli, settings: &Settings) -> anyhow::Result<BookQa> {
    let keys = Arc::new(ApiKeyPool::new(settings.require_api_keys()?.iter().cloned())?);
    let gemini = Arc::new(GeminiClient::from_settings(settings)?);

    let (embeddings, dimensions): (Arc<dyn EmbeddingProvider>, usize) = if cli.offline {
        (
            Arc::new(HashingEmbedder::default()),
            DEFAULT_EMBEDDING_DIMENSIONS,
        )
    } else {
        (gemini.clone() as Arc<dyn EmbeddingProvider>, GEMINI_EMBEDDING_DIMENSIONS)
    };

    let store: Arc<dyn VectorStore> = match &cli.qdrant_url {
        Some(url) => {
            let collection = format!("{}_{}", cli.qdrant_collection, cli.user);
            let store = QdrantStore::new(url, collection, dimensions);
            store.ensure_collection().await?;
            Arc::new(store)
        }
        None => {
            let path = settings.data_dir.join(format!("vectors_{}.json", cli.user));
            Arc::new(InMemoryVectorStore::open(path).await?)
        }
    };

    let providers = Providers {
        embeddings,
        generation: gemini,
        keys,
    };
    Ok(BookQa::new(settings, providers, store))
}
