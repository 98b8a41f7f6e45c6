use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use log::{error, info};
use std::io::{self, Write};
use std::path::PathBuf;

use gemini_docqa::chunking::{SplitterConfig, TextSplitter};
use gemini_docqa::database::{StoreConfig, VectorStore};
use gemini_docqa::document::DocumentLoader;
use gemini_docqa::embeddings::{Embedder, EmbeddingBackend};
use gemini_docqa::gemini::GeminiClient;
use gemini_docqa::rag::{self, Answer, ChatSession, FileOutcome, IngestReport};
use gemini_docqa::RagError;

/// Ask questions about your own documents, answered by Gemini from a local vector store
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Directory holding the vector store files
    #[arg(long, global = true)]
    store_dir: Option<PathBuf>,

    /// Number of chunks retrieved per question
    #[arg(long, short = 'k', global = true)]
    top_k: Option<usize>,

    /// Maximum chunk length in characters
    #[arg(long, global = true)]
    chunk_size: Option<usize>,

    /// Characters shared by consecutive chunks
    #[arg(long, global = true)]
    chunk_overlap: Option<usize>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Index files or directories (PDF, Markdown, text)
    Ingest {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Answer a single question
    Ask { question: String },
    /// Interactive question loop
    Chat,
    /// Show what the store holds
    Stats,
    /// Remove every indexed chunk
    Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    env_logger::init();

    let args = Args::parse();

    let mut store_config = StoreConfig::from_env().context("Invalid store configuration")?;
    if let Some(dir) = args.store_dir {
        store_config.dir = dir;
    }

    let mut splitter_config = SplitterConfig::from_env().context("Invalid chunking configuration")?;
    if let Some(size) = args.chunk_size {
        splitter_config.chunk_size = size;
    }
    if let Some(overlap) = args.chunk_overlap {
        splitter_config.chunk_overlap = overlap;
    }

    let top_k = match args.top_k {
        Some(k) => k,
        None => rag::top_k_from_env().context("Invalid RAG_TOP_K")?,
    };

    let splitter = TextSplitter::from_config(splitter_config).context("Invalid chunking configuration")?;
    let loader = DocumentLoader::new(splitter);

    let embedder = EmbeddingBackend::resolve(store_config.dimension);
    info!(
        "Opening store at {} ({} embeddings)",
        store_config.dir.display(),
        embedder.kind()
    );
    let mut store = VectorStore::open(store_config, embedder).context("Failed to open vector store")?;

    match args.command {
        Command::Ingest { paths } => {
            let report = rag::ingest_paths(&mut store, &loader, &paths).await;
            print_report(&report);
            if report.succeeded() == 0 {
                anyhow::bail!("No documents were added");
            }
        }

        Command::Stats => {
            let stats = store.stats();
            println!("Store: {}", store.config().dir.display());
            println!("Backend: {} ({} dimensions)", stats.backend, stats.dimension);
            println!("Chunks: {}", stats.chunks);
            for (source, chunks) in &stats.sources {
                println!("  {}: {} chunks", source, chunks);
            }
        }

        Command::Clear => {
            store.clear_store().context("Failed to clear the store")?;
            println!("Store cleared.");
        }

        Command::Ask { question } => {
            let mut session = ChatSession::new(store, generator()?, loader, top_k);
            match session.ask(&question).await {
                Ok(answer) => print_answer(&answer),
                Err(e) => {
                    report_error(&e);
                    return Err(e).context("Failed to answer the question");
                }
            }
        }

        Command::Chat => {
            let mut session = ChatSession::new(store, generator()?, loader, top_k);
            run_query_loop(&mut session)
                .await
                .context("Error in query loop")?;
        }
    }

    Ok(())
}

fn generator() -> Result<GeminiClient> {
    GeminiClient::from_env().map_err(|e| {
        report_error(&e);
        anyhow::Error::new(e).context("Answer generation requires Gemini")
    })
}

async fn run_query_loop(session: &mut ChatSession<EmbeddingBackend, GeminiClient>) -> Result<()> {
    println!(
        "Ready to answer questions about {} indexed chunks. Type 'exit' to quit, 'reset' to clear the store.",
        session.store().len()
    );

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut buffer = String::new();

    loop {
        print!("\nYour question: ");
        stdout.flush()?;

        buffer.clear();
        if stdin.read_line(&mut buffer)? == 0 {
            break;
        }

        let question = buffer.trim();
        if question.is_empty() {
            continue;
        }

        match question.to_lowercase().as_str() {
            "exit" | "quit" => {
                println!("Goodbye!");
                break;
            }
            "reset" => {
                match session.reset() {
                    Ok(()) => println!("Store and conversation cleared."),
                    Err(e) => report_error(&e),
                }
                continue;
            }
            _ => {}
        }

        match session.ask(question).await {
            Ok(answer) => print_answer(&answer),
            Err(e) => report_error(&e),
        }
    }

    Ok(())
}

fn print_answer(answer: &Answer) {
    println!("\n{}", answer.answer);

    if !answer.sources.is_empty() {
        println!("\nSources:");
        for (rank, source) in answer.sources.iter().enumerate() {
            println!(
                "  [{}] {} (chunk {}, relevance {:.4})",
                rank + 1,
                source.source,
                source.chunk,
                source.relevance_score
            );
        }
    }
}

fn print_report(report: &IngestReport) {
    for outcome in &report.outcomes {
        match outcome {
            FileOutcome::Added { file, chunks } => println!("added  {} ({} chunks)", file, chunks),
            FileOutcome::Failed { file, error } => println!("failed {}: {}", file, error),
        }
    }
    println!(
        "{} chunks added from {} of {} file(s)",
        report.total_chunks(),
        report.succeeded(),
        report.outcomes.len()
    );

    if let Some(hint) = report.failures().find_map(|(_, error)| error.hint()) {
        println!("{}", hint);
    }
}

fn report_error(e: &RagError) {
    error!("{}", e);
    eprintln!("Error: {}", e);
    if let Some(hint) = e.hint() {
        eprintln!("{}", hint);
    }
}
