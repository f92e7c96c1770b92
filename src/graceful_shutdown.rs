use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

pub fn channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

pub fn request(tx: &watch::Sender<bool>) {
    let _ = tx.send(true);
}

/// Flips the shutdown flag on the first Ctrl-C.
pub fn spawn_ctrl_c(tx: Arc<watch::Sender<bool>>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("ctrl-c received; stopping after the current cycle");
                request(&tx);
            }
            Err(e) => warn!(error = %e, "ctrl-c handler unavailable"),
        }
    })
}

/// Sleeps for `dur` unless shutdown is requested first. Returns `true` on shutdown.
pub async fn sleep_or_shutdown(dur: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    let deadline = tokio::time::Instant::now() + dur;
    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => return *shutdown.borrow(),
            changed = shutdown.changed() => {
                // Sender gone: nobody can request shutdown any more, finish the sleep.
                if changed.is_err() {
                    tokio::time::sleep_until(deadline).await;
                    return *shutdown.borrow();
                }
                if *shutdown.borrow() {
                    return true;
                }
            }
        }
    }
}
