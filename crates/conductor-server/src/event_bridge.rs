use std::sync::Arc;

use serde_json::json;
use tokio::task::JoinHandle;

use conductor_core::events::RunEvent;
use conductor_core::ids::RunId;
use conductor_engine::Subscription;

use crate::client::{ClientId, ClientRegistry};

/// Wire frame for one run event.
pub fn event_frame(event: &RunEvent) -> Option<String> {
    serde_json::to_string(&json!({ "type": "event", "event": event })).ok()
}

/// Frame sent after the last event of a run.
pub fn end_frame(run_id: &RunId) -> Option<String> {
    serde_json::to_string(&json!({ "type": "stream_end", "runId": run_id })).ok()
}

/// Forward a run's events to one client until the stream closes or the client leaves.
///
/// Delivery waits for room in the client's queue, so a subscriber sees every
/// event from its attachment point in sequence order.
pub fn forward(
    registry: Arc<ClientRegistry>,
    client_id: ClientId,
    run_id: RunId,
    mut subscription: Subscription,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut forwarded = 0usize;
        while let Some(event) = subscription.recv().await {
            let Some(frame) = event_frame(&event) else {
                tracing::warn!(run_id = %run_id, seq = event.seq, "failed to serialize event");
                continue;
            };
            if !registry.deliver(&client_id, frame).await {
                tracing::debug!(client_id = %client_id, run_id = %run_id, "client gone, stopping forwarder");
                return;
            }
            forwarded += 1;
        }
        if let Some(frame) = end_frame(&run_id) {
            let _ = registry.deliver(&client_id, frame).await;
        }
        registry.release(&client_id, &run_id);
        tracing::debug!(client_id = %client_id, run_id = %run_id, forwarded, "run stream ended");
    })
}

/// Start forwarding and register the forwarder with the client so it is
/// stopped on unsubscribe or disconnect.
pub fn attach(registry: &Arc<ClientRegistry>, client_id: &ClientId, run_id: RunId, subscription: Subscription) -> bool {
    let task = forward(Arc::clone(registry), client_id.clone(), run_id.clone(), subscription);
    registry.attach(client_id, run_id, task.abort_handle())
}
