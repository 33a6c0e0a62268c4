//! Per-connection stream reader: pumps inbound frames into the shared
//! inbound channel. The supervisor owns channel lifetimes, so the reader
//! exits without closing anything.

use std::sync::Arc;

use bridge_proto::C2vBridgeMessage;
use tokio::sync::{mpsc, watch};
use tracing::{error, trace};

use crate::transport::BridgeConn;

pub(crate) async fn run(
    conn: Arc<dyn BridgeConn>,
    in_tx: mpsc::Sender<C2vBridgeMessage>,
    mut done: watch::Receiver<bool>,
    mut quit: watch::Receiver<bool>,
) {
    trace!("starting stream reader");
    let mut stream_done = conn.done();
    loop {
        if *quit.borrow() || *stream_done.borrow() || *done.borrow() {
            trace!("closing stream reader");
            return;
        }
        tokio::select! {
            biased;
            _ = quit.changed() => {}
            _ = stream_done.changed() => {}
            _ = done.changed() => {}
            result = conn.recv() => match result {
                Ok(Some(frame)) => {
                    if in_tx.send(frame).await.is_err() {
                        return;
                    }
                }
                Ok(None) => {
                    trace!("stream closed (read)");
                    return;
                }
                Err(err) => {
                    error!(error = %err, "stream read error");
                    return;
                }
            }
        }
    }
}
