use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Args;
use futures::StreamExt;
use tracing::info;

use insights_core::ids::{AssistantId, ThreadId};
use insights_engine::tools::create_default_registry;
use insights_engine::tools::sales_data::{SALES_DATA_TOOL, SALES_SCHEMA_PROMPT};
use insights_engine::{DriverConfig, EngineError, RunDriver, SessionState, StreamOutcome};
use insights_llm::{AzureAssistantsBackend, AzureChatPlanner, AzureConfig};

#[derive(Debug, Args)]
pub struct AskArgs {
    /// Question for the assistant.
    question: String,

    #[arg(long, help = "Continue the conversation on this thread")]
    thread_id: Option<String>,

    #[arg(long, help = "Also write the streamed answer to this file")]
    output: Option<PathBuf>,

    #[arg(long, default_value = "data/order_data.db", help = "SQLite sales database")]
    db: PathBuf,

    #[arg(long, default_value_t = 120, help = "Seconds before the run is cancelled")]
    max_wait: u64,
}

pub async fn run(args: AskArgs) -> anyhow::Result<()> {
    let config = AzureConfig::from_env()?;
    let deployment = config
        .analyst_chat_model
        .clone()
        .context("OPENAI_ANALYST_CHAT_MODEL must be set for the sales data tool")?;

    let backend = Arc::new(AzureAssistantsBackend::new(config.clone())?);
    let planner = Arc::new(AzureChatPlanner::new(
        config.clone(),
        deployment,
        SALES_SCHEMA_PROMPT,
    )?);
    let registry = create_default_registry(planner, args.db);

    let driver_config = DriverConfig::new(AssistantId::from_raw(config.assistant_id.as_str()))
        .with_max_waiting_time(Duration::from_secs(args.max_wait))
        .expecting(SALES_DATA_TOOL);
    let driver = RunDriver::new(backend, registry, driver_config)?;

    let session = args.thread_id.map(|id| SessionState {
        thread_id: ThreadId::from_raw(id),
    });
    let response = driver.start(&args.question, session).await?;
    info!(thread_id = %response.session_state.thread_id, "run started");

    let mut file = match &args.output {
        Some(path) => Some(
            std::fs::File::create(path)
                .with_context(|| format!("cannot create {}", path.display()))?,
        ),
        None => None,
    };

    let mut stream = response.chat_output;
    let mut stdout = std::io::stdout();
    while let Some(token) = stream.next().await {
        let rendered = token.render();
        stdout.write_all(rendered.as_bytes())?;
        stdout.flush()?;
        if let Some(file) = file.as_mut() {
            file.write_all(rendered.as_bytes())?;
        }
    }
    writeln!(stdout)?;

    let state = response.driver.await?;
    info!(
        phase = ?state.phase,
        total_tokens = state.usage.total_tokens,
        "run finished"
    );
    eprintln!(
        "session_state: {}",
        serde_json::to_string(&response.session_state)?
    );

    match stream.outcome() {
        Some(StreamOutcome::Completed) => Ok(()),
        Some(StreamOutcome::TimedOut { after }) => Err(EngineError::RunTimeout(*after).into()),
        Some(outcome) => bail!("run {outcome}"),
        None => bail!("run ended without an outcome"),
    }
}
