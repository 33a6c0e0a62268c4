//! Heartbeat watchdog.
//!
//! A stalled heartbeat counter means the outbound pipeline is wedged in a
//! way reconnects have not fixed; the recovery mechanism is a process
//! restart by the pod's supervisor.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, trace};

const WATCHDOG_INTERVAL: Duration = Duration::from_secs(30);

/// Spawns the process-scoped watchdog. `on_stall` runs at most once, when the
/// heartbeat sequence number has not moved for a full interval.
pub(crate) fn spawn(
    seq: Arc<AtomicI64>,
    mut quit: watch::Receiver<bool>,
    on_stall: Box<dyn FnOnce() + Send>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut on_stall = Some(on_stall);
        loop {
            let last_seq = seq.load(Ordering::SeqCst);
            tokio::select! {
                _ = quit.changed() => {
                    if *quit.borrow() {
                        trace!("quitting watchdog");
                        return;
                    }
                }
                _ = tokio::time::sleep(WATCHDOG_INTERVAL) => {
                    if seq.load(Ordering::SeqCst) == last_seq {
                        error!("heartbeats stalled, assuming the stream is dead; restarting");
                        if let Some(hook) = on_stall.take() {
                            hook();
                        }
                        return;
                    }
                }
            }
        }
    })
}

/// Default stall action: exit so the process manager restarts a known-good
/// instance.
pub(crate) fn exit_process() {
    std::process::exit(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[tokio::test(start_paused = true)]
    async fn fires_when_sequence_freezes() {
        let seq = Arc::new(AtomicI64::new(0));
        let stalled = Arc::new(AtomicBool::new(false));
        let (_quit_tx, quit_rx) = watch::channel(false);

        let flag = stalled.clone();
        let handle = spawn(
            seq,
            quit_rx,
            Box::new(move || flag.store(true, Ordering::SeqCst)),
        );

        tokio::time::sleep(Duration::from_secs(31)).await;
        handle.await.unwrap();
        assert!(stalled.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn stays_quiet_while_sequence_moves() {
        let seq = Arc::new(AtomicI64::new(0));
        let stalled = Arc::new(AtomicBool::new(false));
        let (quit_tx, quit_rx) = watch::channel(false);

        let flag = stalled.clone();
        let ticker = seq.clone();
        let handle = spawn(
            seq,
            quit_rx,
            Box::new(move || flag.store(true, Ordering::SeqCst)),
        );

        for _ in 0..4 {
            tokio::time::sleep(Duration::from_secs(25)).await;
            ticker.fetch_add(1, Ordering::SeqCst);
        }
        quit_tx.send(true).unwrap();
        handle.await.unwrap();
        assert!(!stalled.load(Ordering::SeqCst));
    }
}
