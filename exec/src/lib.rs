//! Headless front-end for Quarry analysis sessions.
//!
//! Renders session progress to stderr (or JSONL events to stdout with
//! `--json`); in the default mode the only thing written to stdout is the
//! final report.

#![deny(clippy::print_stdout)]

mod cli;
mod event_processor;
mod event_processor_with_human_output;
pub mod event_processor_with_jsonl_output;

use std::path::PathBuf;
use std::sync::Arc;

pub use cli::Cli;
use event_processor::EventProcessor;
use event_processor::SessionStatus;
use event_processor_with_human_output::EventProcessorWithHumanOutput;
use event_processor_with_jsonl_output::EventProcessorWithJsonOutput;
use quarry_core::AnalysisConfig;
use quarry_core::FileMemoryStore;
use quarry_core::HttpWarehouseBackend;
use quarry_core::MemoryStore;
use quarry_core::ModelClient;
use quarry_core::ReqwestChatTransport;
use quarry_core::SessionServices;
use quarry_core::Warehouse;
use quarry_core::spawn_session;
use quarry_protocol::DatasetSelectionRequestedEvent;
use quarry_protocol::EventMsg;
use quarry_protocol::Op;
use tokio::io::AsyncBufReadExt;
use tokio::io::BufReader;
use tracing::warn;
use tracing_subscriber::EnvFilter;

pub async fn run_main(cli: Cli) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = AnalysisConfig::with_overrides(cli.config_overrides());

    let warehouse_token = std::env::var("QUARRY_WAREHOUSE_TOKEN").ok();
    let backend = Arc::new(HttpWarehouseBackend::new(&cli.warehouse_url, warehouse_token));
    let warehouse = Arc::new(Warehouse::new(backend, config.deadline_warehouse));

    let api_key = std::env::var("QUARRY_LLM_API_KEY").ok();
    let transport = Arc::new(ReqwestChatTransport::new(
        &cli.llm_url,
        &cli.model,
        api_key,
        config.deadline_llm,
    ));
    let model = Arc::new(ModelClient::new(transport, &config));

    let memory_dir = cli
        .memory_dir
        .clone()
        .unwrap_or_else(default_memory_dir);
    let memory = Arc::new(FileMemoryStore::new(memory_dir));
    if let Err(err) = memory.sweep(config.memory_ttl).await {
        warn!("memory sweep failed: {err}");
    }

    let services = SessionServices {
        warehouse,
        model,
        memory,
    };
    let session = spawn_session(config, services, &cli.project);

    let mut processor: Box<dyn EventProcessor> = if cli.json {
        Box::new(EventProcessorWithJsonOutput::new())
    } else {
        Box::new(EventProcessorWithHumanOutput::new())
    };

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if result.is_ok() {
                    warn!("interrupt received, cancelling session");
                    session.cancel();
                }
            }
            maybe_event = session.next_event() => {
                let Some(event) = maybe_event else {
                    break;
                };
                match &event.msg {
                    EventMsg::DatasetSelectionRequested(request) => {
                        let index = resolve_dataset(&cli, request, &mut stdin).await?;
                        session.submit(Op::SelectDataset { index }).await?;
                    }
                    EventMsg::TaskRequested(_) => {
                        let task = match &cli.task {
                            Some(task) => task.clone(),
                            None => prompt_line("describe your analysis task: ", &mut stdin).await?,
                        };
                        session.submit(Op::SubmitTask { task }).await?;
                    }
                    _ => {}
                }
                if matches!(processor.process_event(&event), SessionStatus::Shutdown) {
                    break;
                }
            }
        }
    }

    let state = session.into_final_state().await?;
    if !cli.json
        && let Some(report) = &state.analysis_report
    {
        #[allow(clippy::print_stdout)]
        {
            println!("{report}");
        }
    }

    if state.analysis_report.is_none()
        && let Some(message) = &state.error_message
    {
        anyhow::bail!("session failed: {message}");
    }
    Ok(())
}

fn default_memory_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".quarry")
        .join("memory")
}

async fn resolve_dataset(
    cli: &Cli,
    request: &DatasetSelectionRequestedEvent,
    stdin: &mut tokio::io::Lines<BufReader<tokio::io::Stdin>>,
) -> anyhow::Result<usize> {
    if let Some(name) = &cli.dataset {
        // An unknown name submits an out-of-range index on purpose; the
        // engine re-asks a bounded number of times and then fails.
        return Ok(request
            .datasets
            .iter()
            .position(|dataset| dataset == name)
            .unwrap_or(usize::MAX));
    }
    let line = prompt_line("select dataset index: ", stdin).await?;
    Ok(line.trim().parse().unwrap_or(usize::MAX))
}

#[allow(clippy::print_stderr)]
async fn prompt_line(
    prompt: &str,
    stdin: &mut tokio::io::Lines<BufReader<tokio::io::Stdin>>,
) -> anyhow::Result<String> {
    eprint!("{prompt}");
    let line = stdin
        .next_line()
        .await?
        .ok_or_else(|| anyhow::anyhow!("stdin closed while waiting for input"))?;
    Ok(line.trim().to_string())
}
