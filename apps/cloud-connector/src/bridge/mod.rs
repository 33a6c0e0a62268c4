//! The bridge supervisor.
//!
//! Owns every channel and subtask: the bus subscription, the per-connection
//! reader/writer pair, the registration machine, the heartbeat generator,
//! the update controller and the process-scoped watchdog. Subtasks only ever
//! see the immutable handles they were given at spawn time.
//!
//! If the stream to the control plane drops, the per-connection tasks are
//! torn down but every channel stays in place, so locally produced frames
//! ride out the disconnect and are resent once the stream comes back. Loss
//! is only possible on a process crash, which the rest of the system
//! tolerates by replay.

use std::sync::atomic::AtomicI64;
use std::sync::Arc;
use std::time::Duration;

use bridge_proto::{topics, C2vBridgeMessage, C2vMessage, Envelope, V2cBridgeMessage, V2cMessage};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::bus::{BusError, BusMessage, MessageBus};
use crate::config::Config;
use crate::error::BridgeError;
use crate::transport::{TransportError, VzConnClient};
use crate::vizier::{VizierHealthChecker, VizierInfo};

mod backoff;
mod heartbeat;
mod reader;
mod registration;
mod update;
mod watchdog;
mod writer;

use backoff::Backoff;
use heartbeat::HeartbeatContext;
use update::{UpdateController, UpdateState};

const CHANNEL_CAPACITY: usize = 5000;
const CONNECT_BACKOFF_INITIAL: Duration = Duration::from_secs(30);
const CONNECT_BACKOFF_MULTIPLIER: f64 = 2.0;
const CONNECT_BACKOFF_MAX_ELAPSED: Duration = Duration::from_secs(30 * 60);

/// How a registered session ended.
enum SessionEnd {
    Shutdown,
    Reconnect,
}

struct Receivers {
    pt_rx: mpsc::Receiver<V2cBridgeMessage>,
    out_rx: mpsc::Receiver<V2cBridgeMessage>,
    in_rx: mpsc::Receiver<C2vBridgeMessage>,
}

/// The local-bus ⇄ control-plane bridge.
pub struct Bridge {
    config: Config,
    client: Arc<dyn VzConnClient>,
    vz_info: Arc<dyn VizierInfo>,
    checker: Arc<dyn VizierHealthChecker>,
    bus: Arc<dyn MessageBus>,

    vizier_id: parking_lot::Mutex<Option<Uuid>>,
    hb_seq: Arc<AtomicI64>,
    update_state: Arc<UpdateState>,
    pending_out: writer::PendingSlot,

    pt_tx: mpsc::Sender<V2cBridgeMessage>,
    out_tx: mpsc::Sender<V2cBridgeMessage>,
    in_tx: mpsc::Sender<C2vBridgeMessage>,
    receivers: parking_lot::Mutex<Option<Receivers>>,

    quit_tx: watch::Sender<bool>,
    on_stall: parking_lot::Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Bridge {
    pub fn new(
        config: Config,
        client: Arc<dyn VzConnClient>,
        vz_info: Arc<dyn VizierInfo>,
        bus: Arc<dyn MessageBus>,
        checker: Arc<dyn VizierHealthChecker>,
    ) -> Self {
        let (pt_tx, pt_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (out_tx, out_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (quit_tx, _) = watch::channel(false);
        let vizier_id = config.vizier_id;

        Self {
            config,
            client,
            vz_info,
            checker,
            bus,
            vizier_id: parking_lot::Mutex::new(vizier_id),
            hb_seq: Arc::new(AtomicI64::new(0)),
            update_state: Arc::new(UpdateState::default()),
            pending_out: Arc::new(parking_lot::Mutex::new(None)),
            pt_tx,
            out_tx,
            in_tx,
            receivers: parking_lot::Mutex::new(Some(Receivers {
                pt_rx,
                out_rx,
                in_rx,
            })),
            quit_tx,
            on_stall: parking_lot::Mutex::new(None),
        }
    }

    /// Replaces the watchdog's stall action. The default exits the process
    /// so the pod supervisor restarts a known-good instance.
    pub fn with_stall_action(self, action: Box<dyn FnOnce() + Send>) -> Self {
        *self.on_stall.lock() = Some(action);
        self
    }

    /// Signals shutdown. Safe to call any number of times; `run` returns
    /// once every task has exited.
    pub fn stop(&self) {
        let _ = self.quit_tx.send(true);
    }

    /// Runs the bridge until `stop` is called or a fatal error occurs. Not
    /// restartable; create a new bridge instead.
    pub async fn run(&self) -> Result<(), BridgeError> {
        let Receivers {
            mut pt_rx,
            mut out_rx,
            mut in_rx,
        } = self
            .receivers
            .lock()
            .take()
            .ok_or(BridgeError::AlreadyStarted)?;
        let mut quit = self.quit_tx.subscribe();

        let wildcard = topics::v2c_wildcard();
        trace!(subject = %wildcard, "subscribing to the local bus");
        let mut bus_rx = self.bus.subscribe(&wildcard).await?;

        let controller = UpdateController::new(
            self.vz_info.clone(),
            self.bus.clone(),
            self.update_state.clone(),
        );
        // A half-finished update from a previous run must keep reporting
        // UPDATING until the job terminates.
        controller.resume_existing().await?;

        let vizier_id = {
            let current = *self.vizier_id.lock();
            match current {
                Some(id) => id,
                None => {
                    let id = registration::enroll(
                        self.client.as_ref(),
                        self.vz_info.as_ref(),
                        &self.config.deploy_key,
                    )
                    .await?;
                    *self.vizier_id.lock() = Some(id);
                    id
                }
            }
        };

        let stall = self
            .on_stall
            .lock()
            .take()
            .unwrap_or_else(|| Box::new(watchdog::exit_process));
        let watchdog_handle = watchdog::spawn(self.hb_seq.clone(), self.quit_tx.subscribe(), stall);

        let mut backoff = Backoff::new(
            CONNECT_BACKOFF_INITIAL,
            CONNECT_BACKOFF_MULTIPLIER,
            CONNECT_BACKOFF_MAX_ELAPSED,
        );

        let result = loop {
            if *quit.borrow() {
                break Ok(());
            }

            let conn = match self.client.connect().await {
                Ok(conn) => {
                    backoff.reset();
                    conn
                }
                Err(err) => match backoff.next_delay() {
                    Some(delay) => {
                        warn!(error = %err, ?delay, "failed to connect to the control plane, backing off");
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = quit.changed() => {}
                        }
                        continue;
                    }
                    None => {
                        error!(error = %err, "could not connect to the control plane, giving up");
                        break Err(BridgeError::ConnectFailed(err));
                    }
                },
            };
            info!("connected to the control plane");

            let (done_tx, done_rx) = watch::channel(false);
            let (err_tx, mut err_rx) = mpsc::channel(1);

            let reader_handle = tokio::spawn(reader::run(
                conn.clone(),
                self.in_tx.clone(),
                done_rx.clone(),
                self.quit_tx.subscribe(),
            ));
            let writer_handle = tokio::spawn(writer::run(
                conn.clone(),
                pt_rx,
                out_rx,
                self.pending_out.clone(),
                done_rx.clone(),
                self.quit_tx.subscribe(),
                err_tx,
            ));

            let mut hb_handle = None;
            let session = match registration::handshake(
                conn.as_ref(),
                &mut in_rx,
                vizier_id,
                &self.config.jwt_signing_key,
                self.config.session_id,
                self.vz_info.as_ref(),
            )
            .await
            {
                Ok(()) => {
                    trace!("registration complete");
                    let (mut hb_rx, handle) = heartbeat::spawn(
                        HeartbeatContext {
                            vizier_id,
                            bootstrap_mode: self.config.bootstrap_mode,
                            bootstrap_version: self.config.bootstrap_version.clone(),
                            vz_info: self.vz_info.clone(),
                            checker: self.checker.clone(),
                            update_state: self.update_state.clone(),
                            seq: self.hb_seq.clone(),
                        },
                        done_rx.clone(),
                        self.quit_tx.subscribe(),
                    );
                    hb_handle = Some(handle);
                    self.route(
                        vizier_id,
                        &controller,
                        &mut in_rx,
                        &mut bus_rx,
                        &mut hb_rx,
                        &mut err_rx,
                        conn.clone(),
                        &mut quit,
                    )
                    .await
                }
                Err(err) => Err(err),
            };

            // Tear down the per-connection tasks and recover the queues.
            let _ = done_tx.send(true);
            let _ = reader_handle.await;
            if let Some(handle) = hb_handle {
                let _ = handle.await;
            }
            match writer_handle.await {
                Ok((pt, out)) => {
                    pt_rx = pt;
                    out_rx = out;
                }
                Err(err) => {
                    error!(error = %err, "stream writer task failed");
                    break Err(BridgeError::StreamWrite(TransportError::Closed));
                }
            }

            match session {
                Ok(SessionEnd::Shutdown) => break Ok(()),
                Ok(SessionEnd::Reconnect) => trace!("stream ended, restarting stream"),
                Err(err) => error!(error = %err, "stream errored, restarting stream"),
            }
        };

        // Fatal errors shut the remaining tasks down the same way a stop
        // request does.
        self.stop();
        let _ = watchdog_handle.await;
        result
    }

    /// The routing loop of a registered session.
    #[allow(clippy::too_many_arguments)]
    async fn route(
        &self,
        vizier_id: Uuid,
        controller: &UpdateController,
        in_rx: &mut mpsc::Receiver<C2vBridgeMessage>,
        bus_rx: &mut mpsc::Receiver<BusMessage>,
        hb_rx: &mut mpsc::Receiver<bridge_proto::VizierHeartbeat>,
        err_rx: &mut mpsc::Receiver<TransportError>,
        conn: Arc<dyn crate::transport::BridgeConn>,
        quit: &mut watch::Receiver<bool>,
    ) -> Result<SessionEnd, BridgeError> {
        info!("starting bus bridge");
        let mut stream_done = conn.done();
        loop {
            if *quit.borrow() {
                return Ok(SessionEnd::Shutdown);
            }
            if *stream_done.borrow() {
                info!("stream closed, shutting down stream handlers");
                return Ok(SessionEnd::Reconnect);
            }
            tokio::select! {
                _ = quit.changed() => {}
                _ = stream_done.changed() => {}
                Some(err) = err_rx.recv() => {
                    return Err(BridgeError::StreamWrite(err));
                }
                msg = bus_rx.recv() => {
                    let Some(msg) = msg else {
                        return Err(BridgeError::Bus(BusError::Closed));
                    };
                    self.handle_bus_message(msg).await?;
                }
                frame = in_rx.recv() => {
                    let Some(frame) = frame else {
                        return Ok(SessionEnd::Reconnect);
                    };
                    self.handle_bridge_message(vizier_id, controller, frame).await?;
                }
                Some(heartbeat) = hb_rx.recv() => {
                    trace!(seq = heartbeat.sequence_number, "sending heartbeat");
                    let msg = Envelope::pack(&heartbeat)?;
                    self.publish_bridge(topics::HEARTBEAT, msg);
                }
            }
        }
    }

    /// Outbound side: decode the bus wrapper and enqueue for the writer,
    /// prioritizing passthrough replies.
    async fn handle_bus_message(&self, msg: BusMessage) -> Result<(), BridgeError> {
        let Some(topic) = topics::strip_v2c(&msg.subject) else {
            return Err(BridgeError::MalformedFrame {
                subject: msg.subject.clone(),
                reason: "missing outbound prefix".to_string(),
            });
        };
        let wrapper =
            V2cMessage::from_bytes(&msg.payload).map_err(|err| BridgeError::MalformedFrame {
                subject: msg.subject.clone(),
                reason: err.to_string(),
            })?;

        if topics::is_passthrough_reply(&msg.subject) {
            self.publish_passthrough(topic, wrapper.msg).await;
        } else {
            self.publish_bridge(topic, wrapper.msg);
        }
        Ok(())
    }

    /// Inbound side: update commands are consumed here, everything else is
    /// republished on the local bus under the inbound prefix.
    async fn handle_bridge_message(
        &self,
        vizier_id: Uuid,
        controller: &UpdateController,
        frame: C2vBridgeMessage,
    ) -> Result<(), BridgeError> {
        debug!(topic = %frame.topic, "got message on the bridge stream");

        if frame.topic == topics::VIZIER_UPDATE {
            if let Err(err) = controller.handle_update_request(&frame.msg).await {
                error!(error = %err, "failed to launch vizier update job");
            }
            return Ok(());
        }

        let subject = topics::c2v_subject(&frame.topic);
        let wrapper = C2vMessage {
            vizier_id: vizier_id.to_string(),
            msg: frame.msg,
        };
        let payload = wrapper.to_bytes()?;
        trace!(subject = %subject, "publishing to the local bus");
        self.bus.publish(&subject, payload).await?;
        Ok(())
    }

    /// Default outbound queue: never stalls the routing loop; a full queue
    /// drops the frame with a warning.
    fn publish_bridge(&self, topic: &str, msg: Envelope) {
        let frame = V2cBridgeMessage {
            topic: topic.to_string(),
            session_id: self.config.session_id,
            msg,
        };
        match self.out_tx.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(frame)) => {
                warn!(topic = %frame.topic, "dropping message because the outbound queue is full");
            }
            Err(TrySendError::Closed(frame)) => {
                warn!(topic = %frame.topic, "outbound queue closed, dropping message");
            }
        }
    }

    /// Passthrough queue: replies carry in-flight user queries, so the
    /// producer blocks rather than drop.
    async fn publish_passthrough(&self, topic: &str, msg: Envelope) {
        let frame = V2cBridgeMessage {
            topic: topic.to_string(),
            session_id: self.config.session_id,
            msg,
        };
        if self.pt_tx.send(frame).await.is_err() {
            warn!(topic, "passthrough queue closed, dropping reply");
        }
    }
}
