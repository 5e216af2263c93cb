use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use tracing::info;

use insights_engine::{BatchConfig, BatchError, BatchProcessor, JobId};

#[derive(Debug, Args)]
pub struct BatchDemoArgs {
    #[arg(long, default_value_t = 13, help = "Concurrent tasks")]
    tasks: usize,

    #[arg(long, default_value_t = 7, help = "Chained sub-jobs per task")]
    subtasks: usize,

    #[arg(long, default_value_t = 1000, help = "Jobs per batch")]
    batch_size: usize,

    #[arg(long, default_value_t = 200, help = "Idle milliseconds before a partial batch is cut")]
    idle_ms: u64,
}

/// Echoes every payload back, in reverse order, to show that results are
/// matched to jobs by id rather than position.
async fn reverse_executor(batch: Vec<(JobId, String)>) -> anyhow::Result<Vec<(JobId, String)>> {
    info!(jobs = batch.len(), "executing batch");
    let mut results = batch;
    results.reverse();
    Ok(results)
}

async fn chained_task(
    processor: Arc<BatchProcessor<String, String>>,
    task: usize,
    subtasks: usize,
) -> Result<Vec<String>, BatchError> {
    let mut results = Vec::with_capacity(subtasks + 1);
    results.push(processor.submit(task.to_string())?.await?);
    for sub in 0..subtasks {
        results.push(processor.submit(format!("{task}-{sub}"))?.await?);
    }
    Ok(results)
}

pub async fn run(args: BatchDemoArgs) -> anyhow::Result<()> {
    let config = BatchConfig {
        batch_size: args.batch_size,
        idle_timeout: Duration::from_millis(args.idle_ms),
    };
    let processor = Arc::new(BatchProcessor::new(config, reverse_executor));

    let handles: Vec<_> = (0..args.tasks)
        .map(|task| tokio::spawn(chained_task(Arc::clone(&processor), task, args.subtasks)))
        .collect();

    for (task, handle) in handles.into_iter().enumerate() {
        let results = handle.await??;
        println!("task {task}: {}", results.join(", "));
    }

    processor.stop().await;
    Ok(())
}
