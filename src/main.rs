use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use serde_json::Value;
use tokio_stream::StreamExt;

use stepflow_rs::adk::agents;
use stepflow_rs::stepflow::checkpoint::FileStore;
use stepflow_rs::stepflow::workflow::builder::Builder;
use stepflow_rs::stepflow::workflow::graph::Engine;
use stepflow_rs::stepflow::workflow::loader::WorkflowLoader;
use stepflow_rs::stepflow::workflow::registry::HandlerRegistry;
use stepflow_rs::stepflow::workflow::state::{Payload, RunId};

use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Graph definition file
    #[arg(
        short,
        long,
        global = true,
        default_value = "workflows/task_pipeline.yaml"
    )]
    workflow: String,

    /// Checkpoint directory
    #[arg(short, long, global = true, default_value = ".stepflow")]
    store: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start a run and drive it to a terminal or suspended state
    Run {
        /// Initial payload as a JSON object
        #[arg(short, long)]
        input: Option<String>,

        /// Shortcut for `{"taskText": ...}`
        #[arg(short, long)]
        text: Option<String>,

        /// Entry node (defaults to the graph's entry)
        #[arg(short, long)]
        entry: Option<String>,
    },
    /// Show the latest checkpoint of a run
    Status {
        run_id: String,

        /// Include the payload
        #[arg(short, long)]
        payload: bool,
    },
    /// Resume a suspended, failed or abandoned run
    Resume {
        run_id: String,

        /// External input merged before continuing, as a JSON object
        #[arg(short, long)]
        input: Option<String>,

        /// Acknowledge a manual review first
        #[arg(long)]
        clear_review: bool,
    },
    /// Cancel a run
    Cancel { run_id: String },
    /// List every checkpoint of a run
    History { run_id: String },
    /// Print the JSON Schema of the graph file format
    Schema,
}

fn parse_payload(raw: &str) -> anyhow::Result<Payload> {
    let value: Value = serde_json::from_str(raw).context("input is not valid JSON")?;
    Payload::from_json(value).map_err(|e| anyhow!(e))
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn engine(args: &Args) -> anyhow::Result<(Engine, String)> {
    let registry = HandlerRegistry::new();
    agents::register_defaults(&registry).await;

    let compiled = Builder::new(registry)
        .build_from_file(&args.workflow)
        .await
        .with_context(|| format!("failed to build graph from {}", args.workflow))?;
    let entry = compiled.entry.clone();
    let engine = compiled.into_engine(Arc::new(FileStore::new(&args.store)))?;
    Ok((engine, entry))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    env_logger::init();

    let args = Args::parse();

    match &args.command {
        Commands::Schema => {
            print_json(&WorkflowLoader::schema())?;
        }
        Commands::Run { input, text, entry } => {
            let mut payload = match input {
                Some(raw) => parse_payload(raw)?,
                None => Payload::new(),
            };
            if let Some(text) = text {
                payload.insert("taskText", Value::String(text.clone()));
            }

            let (engine, default_entry) = engine(&args).await?;
            let entry = entry.clone().unwrap_or(default_entry);

            let mut events = engine.subscribe();
            tokio::spawn(async move {
                while let Some(event) = events.next().await {
                    log::info!(
                        "[{}] step {} {:?} -> {}",
                        event.run_id,
                        event.step_seq,
                        event.nodes,
                        event.status
                    );
                }
            });

            let handle = engine.submit(&entry, payload).await?;
            let run_id = handle.run_id.clone();
            println!("Run ID: {}", run_id);
            handle.wait().await?;
            print_json(&engine.status(&run_id, true).await?)?;
        }
        Commands::Status { run_id, payload } => {
            let (engine, _) = engine(&args).await?;
            print_json(
                &engine
                    .status(&RunId::from(run_id.as_str()), *payload)
                    .await?,
            )?;
        }
        Commands::Resume {
            run_id,
            input,
            clear_review,
        } => {
            let run_id = RunId::from(run_id.as_str());
            let input = input.as_deref().map(parse_payload).transpose()?;
            let (engine, _) = engine(&args).await?;
            if *clear_review {
                engine.clear_review(&run_id).await?;
            }
            engine.resume(&run_id, input).await?;
            print_json(&engine.status(&run_id, true).await?)?;
        }
        Commands::Cancel { run_id } => {
            let run_id = RunId::from(run_id.as_str());
            let (engine, _) = engine(&args).await?;
            engine.cancel(&run_id).await?;
            print_json(&engine.status(&run_id, false).await?)?;
        }
        Commands::History { run_id } => {
            let (engine, _) = engine(&args).await?;
            for checkpoint in engine.checkpoints(&RunId::from(run_id.as_str())).await? {
                let state = &checkpoint.state;
                println!(
                    "{:>4}  {}  {:<10} history={:?} pending={:?}",
                    state.step_seq,
                    checkpoint.created_at.to_rfc3339(),
                    state.status.to_string(),
                    state.history,
                    state.pending
                );
            }
        }
    }

    Ok(())
}
