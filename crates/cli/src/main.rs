use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use knowhub_rag::{
    index_fragments, read_fragments_jsonl, AnswerResult, EmbeddingClient, EscalationPolicy,
    EscalationStatus, Principal, Query, RagConfig, RagPipeline, RagStore,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Debug)]
#[command(name = "knowhub", version = VERSION, about = "Knowledge Hub answer pipeline CLI")]
struct Cli {
    /// Overrides KNOWHUB_DB / the config file.
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the vector store tables.
    Init,
    /// Embed and store pre-chunked fragments from a JSONL file.
    Index {
        input: PathBuf,
        #[arg(long)]
        domain: String,
    },
    /// Answer a question from one domain.
    Ask {
        question: String,
        #[arg(long)]
        domain: String,
        #[arg(long)]
        top_k: Option<usize>,
        #[arg(long)]
        threshold: Option<f32>,
        /// Recorded on the escalation when the answer needs review.
        #[arg(long)]
        subject: Option<String>,
        #[arg(long, action = ArgAction::SetTrue)]
        json: bool,
    },
    /// Count indexed fragments in a domain.
    Stats {
        #[arg(long)]
        domain: String,
    },
    /// List escalations, optionally only those with one status.
    Escalations {
        #[arg(long)]
        status: Option<String>,
    },
    /// Mark an escalation resolved.
    Resolve { id: i64 },
}

#[derive(Serialize)]
struct AskOutput<'a> {
    #[serde(flatten)]
    result: &'a AnswerResult,
    escalated: bool,
    escalation_id: Option<i64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let mut config = RagConfig::from_env()?;
    if let Some(db) = cli.db {
        config.db_path = db;
    }
    match cli.command {
        Commands::Init => {
            RagStore::open(&config.db_path, config.embedding_dimensions)?;
            println!(
                "[knowhub] Initialized store at {} ({} dimensions)",
                config.db_path.display(),
                config.embedding_dimensions
            );
        }
        Commands::Index { input, domain } => {
            let file = File::open(&input)
                .with_context(|| format!("opening {}", input.display()))?;
            let fragments = read_fragments_jsonl(BufReader::new(file), Some(&domain))?;
            if fragments.is_empty() {
                return Err(anyhow!("no fragments found in {}", input.display()));
            }
            let store = RagStore::open(&config.db_path, config.embedding_dimensions)?;
            let embedder = EmbeddingClient::from_config(&config)?;
            info!(input = %input.display(), fragments = fragments.len(), domain = %domain, "indexing");
            let written = index_fragments(&store, &embedder, fragments).await?;
            println!(
                "[knowhub] Indexed {} fragments into domain '{}' (total {})",
                written,
                domain,
                store.count_fragments(&domain)?
            );
        }
        Commands::Ask {
            question,
            domain,
            top_k,
            threshold,
            subject,
            json,
        } => {
            let pipeline = RagPipeline::from_config(&config)?;
            let policy = EscalationPolicy::new(threshold.unwrap_or(config.escalation_threshold));
            let query = Query::new(question, domain, top_k.unwrap_or(config.top_k));
            info!(domain = %query.domain_id, top_k = query.top_k, "asking");
            let result = pipeline.answer(&query).await?;
            let principal = subject.map(|subject_id| Principal {
                subject_id,
                role_id: None,
            });
            let escalation_id = match policy.escalation_for(&query, &result, principal.as_ref()) {
                Some(record) => {
                    let store = RagStore::open(&config.db_path, config.embedding_dimensions)?;
                    let saved = store.record_escalation(&record)?;
                    warn!(escalation = saved.id, confidence = result.confidence, "answer escalated");
                    Some(saved.id)
                }
                None => None,
            };
            if json {
                let out = AskOutput {
                    result: &result,
                    escalated: escalation_id.is_some(),
                    escalation_id,
                };
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else {
                print_answer(&query, &result, escalation_id);
            }
        }
        Commands::Stats { domain } => {
            let store = RagStore::open(&config.db_path, config.embedding_dimensions)?;
            println!(
                "[knowhub] Domain '{}': {} fragments",
                domain,
                store.count_fragments(&domain)?
            );
        }
        Commands::Escalations { status } => {
            let status = status
                .map(|raw| {
                    EscalationStatus::from_str(&raw)
                        .ok_or_else(|| anyhow!("unknown escalation status {raw}"))
                })
                .transpose()?;
            let store = RagStore::open(&config.db_path, config.embedding_dimensions)?;
            let escalations = store.list_escalations(status)?;
            if escalations.is_empty() {
                println!("[knowhub] No escalations");
            }
            for escalation in escalations {
                println!(
                    "[knowhub] #{} {} [{}] {} ({})",
                    escalation.id,
                    escalation.status.as_str(),
                    escalation.domain_id,
                    escalation.question_text,
                    escalation.subject_id.as_deref().unwrap_or("anonymous")
                );
            }
        }
        Commands::Resolve { id } => {
            let store = RagStore::open(&config.db_path, config.embedding_dimensions)?;
            let resolved = store
                .resolve_escalation(id)?
                .ok_or_else(|| anyhow!("no escalation with id {id}"))?;
            println!("[knowhub] Escalation #{} is {}", resolved.id, resolved.status.as_str());
        }
    }
    Ok(())
}

fn print_answer(query: &Query, result: &AnswerResult, escalation_id: Option<i64>) {
    println!("[knowhub] Domain:      {}", query.domain_id);
    println!("[knowhub] Confidence:  {:.2}", result.confidence);
    if result.citations.is_empty() {
        println!("[knowhub] Citations:   none");
    } else {
        println!("[knowhub] Citations:   {}", result.citations.join(", "));
    }
    if let Some(id) = escalation_id {
        println!("[knowhub] Escalation:  #{id}, below threshold, flagged for human review");
    }
    println!();
    println!("{}", result.text.trim());
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
