//! Interactive demo: submits a handful of requests against a flaky primary
//! transport and a reliable secondary, then polls status until every
//! request reaches a terminal state.

use std::sync::Arc;
use std::time::Duration;

use delivery_engine::transport::{ScriptedOutcome, ScriptedTransport, StochasticTransport, Transport};
use delivery_engine::{DeliveryEngine, EngineConfig, ExternalStatus, SubmitOutcome, SubmitRequest};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let primary: Arc<dyn Transport> = Arc::new(StochasticTransport::new("primary", 0.6, 7));
    let secondary: Arc<dyn Transport> = Arc::new(ScriptedTransport::new(
        "secondary",
        vec![ScriptedOutcome::Success { message_id: "fallback-ok".into() }],
    ));

    let engine = DeliveryEngine::new(vec![primary, secondary], EngineConfig::default());

    let requests = [
        SubmitRequest::new("alice@example.com", "welcome", "hello there", "req-1").with_priority(5),
        SubmitRequest::new("bob@example.com", "invoice", "your invoice is ready", "req-2"),
        SubmitRequest::new("carol@example.com", "reminder", "don't forget", "req-3").with_delay_ms(500),
    ];

    let mut request_ids = Vec::new();
    for request in requests {
        let request_id = request.request_id.clone();
        match engine.submit(request).await {
            SubmitOutcome::Queued { job_id, .. } => {
                println!("queued {request_id} as job {job_id}");
            }
            other => println!("unexpected submit outcome for {request_id}: {other:?}"),
        }
        request_ids.push(request_id);
    }

    loop {
        tokio::time::sleep(Duration::from_millis(250)).await;

        let mut all_terminal = true;
        for request_id in &request_ids {
            let status = engine.get_status(request_id).await;
            if !matches!(status.status, ExternalStatus::Sent | ExternalStatus::Failed) {
                all_terminal = false;
            }
            let json = serde_json::to_string(&status).unwrap_or_else(|_| "<unserializable>".into());
            println!("{request_id}: {json}");
        }

        let stats = engine.queue_stats().await;
        println!(
            "queue: queued={} processing={} retrying={} completed={} failed={}",
            stats.queued, stats.processing, stats.retrying, stats.completed, stats.failed
        );

        if all_terminal {
            break;
        }
    }

    engine.shutdown();
}
