//! Periodic timestamp records injected into the shared log.

use crate::shutdown::Shutdown;
use crate::store::RecordLog;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Format one heartbeat record for the given wall-clock time.
fn format_record(now: chrono::DateTime<chrono::Local>) -> String {
    format!("timestamp:{}\n", now.format("%a, %d %b %Y %H:%M:%S %z"))
}

/// Run the heartbeat loop until shutdown is triggered.
///
/// Each cycle sleeps for `interval`, then appends a `timestamp:...` record
/// under the log's exclusive lock. A failed append is logged and the cycle
/// skipped; the loop only ends on the shutdown flag.
pub async fn run(log: Arc<RecordLog>, interval: Duration, shutdown: Shutdown) {
    info!(interval_secs = interval.as_secs_f64(), "Heartbeat started");
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.wait() => break,
        }
        if shutdown.is_triggered() {
            break;
        }

        let record = format_record(chrono::Local::now());
        let guard = log.lock().await;
        match guard.append(record.as_bytes()).await {
            Ok(()) => debug!("Heartbeat record appended"),
            Err(e) => warn!(error = %e, "Heartbeat append failed, skipping cycle"),
        }
    }
    info!("Heartbeat stopped");
}
