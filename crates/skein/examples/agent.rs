//! Create an agent from the basic conversation template and run one message
//! through it on the in-memory worker runtime.
//!
//! ```sh
//! cargo run -p skein --example agent
//! ```

use std::sync::Arc;

use serde_json::json;
use skein::dag::{GenerationMode, GenerationRequest};
use skein::worker::InMemoryWorker;
use skein::{ExecuteRequest, Orchestrator};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let orchestrator = Orchestrator::with_defaults(Arc::new(InMemoryWorker::new())).await;

    let mut request = GenerationRequest::new("basic_conversation", "demo-user");
    request.mode = GenerationMode::Minimal;
    let descriptor = orchestrator.create_agent(request).await?;
    println!(
        "created agent {} (dag {}, score {:.2})",
        descriptor.agent_id, descriptor.dag_id, descriptor.optimization_score
    );

    let response = orchestrator
        .execute(ExecuteRequest::new(
            &descriptor.agent_id,
            json!({"message": "hello there", "user_id": "demo-user"}),
            "demo-user",
        ))
        .await?;
    println!("execution path: {:?}", response.execution_path);
    println!(
        "result: {}",
        serde_json::to_string_pretty(&response.final_result)?
    );

    orchestrator.shutdown().await;
    Ok(())
}
