//! `loomi run`: One orchestration from the terminal.
//!
//! Events are printed to stdout as JSON lines in emission order. Ctrl-C sets
//! the session's stop flag, so the run winds down the same way a `/stop`
//! request would.

use loomi_agent::Runtime;
use loomi_config::AppConfig;
use loomi_core::event::{EventSink, StreamEvent};
use loomi_core::request::AgentRequest;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

pub async fn run(
    user_id: String,
    session_id: String,
    instruction: String,
    selections: Vec<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    let client = loomi_providers::build_from_config(&config.model)?;
    let runtime = Arc::new(Runtime::from_config(&config, client));

    let request = AgentRequest::new(user_id, session_id, instruction).with_selections(selections);

    let (tx, mut rx) = mpsc::unbounded_channel::<StreamEvent>();
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{line}"),
                Err(e) => warn!(error = %e, "Skipping unprintable event"),
            }
        }
    });

    let stopper = {
        let runtime = runtime.clone();
        let (user_id, session_id) = (request.user_id.clone(), request.session_id.clone());
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!(user_id = %user_id, session_id = %session_id, "Interrupted, requesting stop");
                runtime.stop.request_stop(&user_id, &session_id).await;
            }
        })
    };

    let sink: Arc<dyn EventSink> = Arc::new(tx);
    let result = runtime.orchestrator.run(&request, sink).await;
    stopper.abort();
    // The orchestrator holds the last sender until it returns.
    printer.await?;

    match result {
        Ok(report) => {
            info!(
                actions = report.actions.len(),
                total_tokens = report.summary.total_tokens,
                cost = report.summary.cost,
                "Run finished"
            );
            Ok(())
        }
        Err(e) if e.is_stopped() => {
            eprintln!("stopped");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
