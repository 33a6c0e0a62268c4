//! Heartbeat generator: builds a liveness frame every interval and hands it
//! to the routing loop, bumping the process-wide sequence counter on each
//! successful handoff.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bridge_proto::{VizierHeartbeat, VizierStatus};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};
use uuid::Uuid;

use super::update::UpdateState;
use crate::vizier::{VizierHealthChecker, VizierInfo};

pub(crate) const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const HEALTH_STALE_AFTER: Duration = Duration::from_secs(10);

/// Immutable inputs the generator needs; handed over at spawn time.
pub(crate) struct HeartbeatContext {
    pub vizier_id: Uuid,
    pub bootstrap_mode: bool,
    pub bootstrap_version: String,
    pub vz_info: Arc<dyn VizierInfo>,
    pub checker: Arc<dyn VizierHealthChecker>,
    pub update_state: Arc<UpdateState>,
    pub seq: Arc<AtomicI64>,
}

/// Spawns the per-connection generator. The first heartbeat fires
/// immediately, then one per interval.
pub(crate) fn spawn(
    ctx: HeartbeatContext,
    mut done: watch::Receiver<bool>,
    mut quit: watch::Receiver<bool>,
) -> (mpsc::Receiver<VizierHeartbeat>, JoinHandle<()>) {
    let (hb_tx, hb_rx) = mpsc::channel(1);
    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        loop {
            tokio::select! {
                _ = quit.changed() => {
                    if *quit.borrow() {
                        info!("stopping heartbeat task");
                        return;
                    }
                }
                _ = done.changed() => {
                    if *done.borrow() {
                        return;
                    }
                }
                _ = ticker.tick() => {
                    let heartbeat = build_heartbeat(&ctx).await;
                    tokio::select! {
                        _ = quit.changed() => return,
                        _ = done.changed() => return,
                        sent = hb_tx.send(heartbeat) => {
                            if sent.is_err() {
                                return;
                            }
                            ctx.seq.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                }
            }
        }
    });
    (hb_rx, handle)
}

async fn build_heartbeat(ctx: &HeartbeatContext) -> VizierHeartbeat {
    let (address, port) = match ctx.vz_info.address().await {
        Ok(addr) => addr,
        Err(err) => {
            error!(error = %err, "failed to get vizier address");
            (String::new(), 0)
        }
    };
    let workloads = ctx.vz_info.workload_state().await;
    VizierHeartbeat {
        vizier_id: ctx.vizier_id,
        time_ns: unix_nanos(SystemTime::now()),
        sequence_number: ctx.seq.load(Ordering::SeqCst),
        address,
        port,
        num_nodes: workloads.num_nodes,
        pod_statuses: workloads.pod_statuses,
        pod_statuses_last_updated_ns: workloads.last_updated.map(unix_nanos).unwrap_or(0),
        status: current_status(&ctx.update_state, ctx.checker.as_ref()),
        bootstrap_mode: ctx.bootstrap_mode,
        bootstrap_version: ctx.bootstrap_version.clone(),
    }
}

fn unix_nanos(at: SystemTime) -> i64 {
    at.duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// Aggregate status rule: a live update wins, a failed update is sticky, and
/// otherwise the data-plane probe decides, with stale observations mapping
/// to UNKNOWN.
pub(crate) fn current_status(
    update: &UpdateState,
    checker: &dyn VizierHealthChecker,
) -> VizierStatus {
    if update.running() && !update.failed() {
        return VizierStatus::Updating;
    }
    if update.failed() {
        return VizierStatus::UpdateFailed;
    }

    let observation = checker.status();
    match observation.observed_at {
        Some(at) if at.elapsed() <= HEALTH_STALE_AFTER => {
            if observation.error.is_some() {
                VizierStatus::Unhealthy
            } else {
                VizierStatus::Healthy
            }
        }
        _ => VizierStatus::Unknown,
    }
}
