//! Per-connection stream writer.
//!
//! One frame in flight at a time; a frame whose send fails is parked in the
//! supervisor-owned pending slot and retried before anything else, including
//! by the next writer after a reconnect. Passthrough traffic is favored over
//! the default queue. The writer returns the queue receivers on exit so the
//! supervisor can hand them to its successor.

use std::sync::Arc;

use bridge_proto::V2cBridgeMessage;
use tokio::sync::{mpsc, watch};
use tracing::trace;

use crate::transport::{BridgeConn, TransportError};

pub(crate) type PendingSlot = Arc<parking_lot::Mutex<Option<V2cBridgeMessage>>>;

type Queues = (
    mpsc::Receiver<V2cBridgeMessage>,
    mpsc::Receiver<V2cBridgeMessage>,
);

enum SendOutcome {
    Sent,
    Failed,
}

pub(crate) async fn run(
    conn: Arc<dyn BridgeConn>,
    mut pt_rx: mpsc::Receiver<V2cBridgeMessage>,
    mut out_rx: mpsc::Receiver<V2cBridgeMessage>,
    pending: PendingSlot,
    mut done: watch::Receiver<bool>,
    mut quit: watch::Receiver<bool>,
    err_tx: mpsc::Sender<TransportError>,
) -> Queues {
    trace!("starting stream writer");
    let mut stream_done = conn.done();
    loop {
        // A parked frame blocks everything behind it.
        let parked = pending.lock().clone();
        if let Some(frame) = parked {
            match conn.send(frame).await {
                Ok(()) => *pending.lock() = None,
                Err(err) => {
                    report_error(err, &err_tx, &mut done, &mut quit).await;
                    return (pt_rx, out_rx);
                }
            }
        }

        if *quit.borrow() || *stream_done.borrow() {
            trace!("closing stream writer");
            return (pt_rx, out_rx);
        }
        if *done.borrow() {
            conn.close_send().await;
            return (pt_rx, out_rx);
        }

        // Passthrough first: a non-blocking check ahead of the shared wait.
        if let Ok(frame) = pt_rx.try_recv() {
            match send_frame(conn.as_ref(), &pending, frame, &err_tx, &mut done, &mut quit).await
            {
                SendOutcome::Sent => continue,
                SendOutcome::Failed => return (pt_rx, out_rx),
            }
        }

        let frame = tokio::select! {
            _ = quit.changed() => continue,
            _ = stream_done.changed() => continue,
            _ = done.changed() => continue,
            frame = pt_rx.recv() => frame,
            frame = out_rx.recv() => frame,
        };
        // The supervisor holds the send halves, so the queues never close
        // while a writer is alive.
        let Some(frame) = frame else { continue };
        match send_frame(conn.as_ref(), &pending, frame, &err_tx, &mut done, &mut quit).await {
            SendOutcome::Sent => {}
            SendOutcome::Failed => return (pt_rx, out_rx),
        }
    }
}

async fn send_frame(
    conn: &dyn BridgeConn,
    pending: &PendingSlot,
    frame: V2cBridgeMessage,
    err_tx: &mpsc::Sender<TransportError>,
    done: &mut watch::Receiver<bool>,
    quit: &mut watch::Receiver<bool>,
) -> SendOutcome {
    *pending.lock() = Some(frame.clone());
    match conn.send(frame).await {
        Ok(()) => {
            *pending.lock() = None;
            SendOutcome::Sent
        }
        Err(err) => {
            report_error(err, err_tx, done, quit).await;
            SendOutcome::Failed
        }
    }
}

/// The stream may be torn down concurrently, so guard the error report
/// against an already-departed routing loop.
async fn report_error(
    err: TransportError,
    err_tx: &mpsc::Sender<TransportError>,
    done: &mut watch::Receiver<bool>,
    quit: &mut watch::Receiver<bool>,
) {
    if *done.borrow() || *quit.borrow() {
        return;
    }
    tokio::select! {
        _ = err_tx.send(err) => {}
        _ = done.changed() => {}
        _ = quit.changed() => {}
    }
}
