use tokio::task::JoinHandle;

use conductor_engine::Subscription;
use conductor_store::RunEventRepo;

/// Persist every event of a run as it is published. Resolves to the number of
/// events stored once the stream closes.
pub fn spawn_recorder(repo: RunEventRepo, mut subscription: Subscription) -> JoinHandle<usize> {
    tokio::spawn(async move {
        let mut stored = 0;
        while let Some(event) = subscription.recv().await {
            match repo.append(&event) {
                Ok(true) => stored += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(run_id = %event.run_id, seq = event.seq, error = %e, "failed to record event");
                }
            }
        }
        stored
    })
}
