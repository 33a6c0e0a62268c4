//! End-to-end bridge scenarios over the in-memory stream pair and bus.

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use bridge_proto::{topics, RegistrationStatus, VizierHeartbeat, VizierStatus};
use bytes::Bytes;
use cloud_connector::bus::MessageBus;
use cloud_connector::error::BridgeError;
use common::{
    ack_registration, next_frame_on, opaque_envelope, publish_v2c, start_bridge, test_config,
};
use uuid::Uuid;

#[tokio::test(start_paused = true)]
async fn cold_start_enrolls_registers_and_heartbeats() {
    let vizier_id = Uuid::new_v4();
    let mut t = start_bridge(test_config(None));
    // The bridge task has not polled yet, so this lands before enrollment.
    t.client.set_enroll_response(vizier_id);

    let mut cloud = t.accepted.recv().await.expect("bridge connects");
    let before_register = ack_registration(&mut cloud, RegistrationStatus::Ok).await;
    assert!(
        before_register.is_empty(),
        "no frame may precede register, got {:?}",
        before_register.iter().map(|f| &f.topic).collect::<Vec<_>>()
    );

    assert_eq!(t.client.enroll_calls(), 1);
    assert_eq!(t.vz_info.persisted_id(), Some(vizier_id));

    let frame = next_frame_on(&mut cloud, topics::HEARTBEAT).await;
    assert_eq!(frame.session_id, 42);
    let heartbeat: VizierHeartbeat = frame.msg.unpack().expect("decode heartbeat");
    assert_eq!(heartbeat.sequence_number, 0);
    assert_eq!(heartbeat.vizier_id, vizier_id);
    assert_eq!(heartbeat.status, VizierStatus::Healthy);
    assert_eq!(heartbeat.address, "10.1.2.3");
    assert_eq!(heartbeat.num_nodes, 3);

    let next: VizierHeartbeat = next_frame_on(&mut cloud, topics::HEARTBEAT)
        .await
        .msg
        .unpack()
        .expect("decode heartbeat");
    assert_eq!(next.sequence_number, 1, "sequence numbers are monotonic");

    t.shutdown().await.expect("clean shutdown");
}

#[tokio::test(start_paused = true)]
async fn enrollment_runs_once_across_reconnects() {
    let vizier_id = Uuid::new_v4();
    let mut t = start_bridge(test_config(None));
    t.client.set_enroll_response(vizier_id);

    let mut cloud1 = t.accepted.recv().await.expect("first connect");
    ack_registration(&mut cloud1, RegistrationStatus::Ok).await;
    next_frame_on(&mut cloud1, topics::HEARTBEAT).await;

    cloud1.close();

    let mut cloud2 = t.accepted.recv().await.expect("reconnect");
    ack_registration(&mut cloud2, RegistrationStatus::Ok).await;
    next_frame_on(&mut cloud2, topics::HEARTBEAT).await;

    assert_eq!(t.client.enroll_calls(), 1, "enrollment is one-shot");
    assert!(t.client.connect_calls() >= 2);

    t.shutdown().await.expect("clean shutdown");
}

#[tokio::test(start_paused = true)]
async fn registration_timeout_triggers_reconnect_and_watchdog() {
    let vizier_id = Uuid::new_v4();
    let mut t = start_bridge(test_config(Some(vizier_id)));

    let mut cloud1 = t.accepted.recv().await.expect("first connect");
    let register = cloud1.recv().await.expect("register frame");
    assert_eq!(register.topic, topics::REGISTER);
    // Stay silent: the registration deadline passes and the supervisor
    // retries on a fresh stream.
    let mut cloud2 = t.accepted.recv().await.expect("retry connect");
    ack_registration(&mut cloud2, RegistrationStatus::Ok).await;

    let heartbeat: VizierHeartbeat = next_frame_on(&mut cloud2, topics::HEARTBEAT)
        .await
        .msg
        .unpack()
        .expect("decode heartbeat");
    assert_eq!(heartbeat.sequence_number, 0);

    // No heartbeat moved during the silent window, so the watchdog fired.
    // In production that exits the process; the harness only records it.
    assert!(t.stalled.load(Ordering::SeqCst));

    t.shutdown().await.expect("clean shutdown");
}

#[tokio::test(start_paused = true)]
async fn mid_send_disconnect_preserves_frame_order() {
    let vizier_id = Uuid::new_v4();
    let mut t = start_bridge(test_config(Some(vizier_id)));

    let mut cloud1 = t.accepted.recv().await.expect("first connect");
    ack_registration(&mut cloud1, RegistrationStatus::Ok).await;
    next_frame_on(&mut cloud1, topics::HEARTBEAT).await;

    // The next send fails without delivering its frame.
    cloud1.fail_link();
    publish_v2c(&t.bus, "topicA", opaque_envelope("A")).await;
    publish_v2c(&t.bus, "topicB", opaque_envelope("B")).await;
    publish_v2c(&t.bus, "topicC", opaque_envelope("C")).await;

    let mut cloud2 = t.accepted.recv().await.expect("reconnect");
    let mut data_topics = Vec::new();
    while data_topics.len() < 3 {
        let frame = cloud2.recv().await.expect("frame on new stream");
        match frame.topic.as_str() {
            topics::REGISTER => {
                let ack = bridge_proto::Envelope::pack(&bridge_proto::RegisterVizierAck {
                    status: RegistrationStatus::Ok,
                })
                .expect("encode ack");
                assert!(cloud2.send(topics::REGISTER_ACK, ack).await);
            }
            topics::HEARTBEAT => {}
            _ => data_topics.push(frame.topic.clone()),
        }
    }
    assert_eq!(
        data_topics,
        vec!["topicA", "topicB", "topicC"],
        "the failed frame is resent first and order is preserved"
    );

    t.shutdown().await.expect("clean shutdown");
}

#[tokio::test(start_paused = true)]
async fn passthrough_replies_jump_the_default_queue() {
    let vizier_id = Uuid::new_v4();
    let mut t = start_bridge(test_config(Some(vizier_id)));

    let mut cloud = t.accepted.recv().await.expect("connect");
    ack_registration(&mut cloud, RegistrationStatus::Ok).await;
    next_frame_on(&mut cloud, topics::HEARTBEAT).await;

    // Park the writer mid-send so both queues can fill behind it.
    cloud.hold_sends();
    publish_v2c(&t.bus, "topicX", opaque_envelope("X")).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    publish_v2c(&t.bus, "topicD", opaque_envelope("D")).await;
    publish_v2c(&t.bus, "reply-1234", opaque_envelope("P")).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    cloud.release_sends();

    let mut observed = Vec::new();
    while observed.len() < 3 {
        let frame = cloud.recv().await.expect("frame");
        match frame.topic.as_str() {
            "topicX" | "topicD" | "reply-1234" => observed.push(frame.topic.clone()),
            _ => {}
        }
    }
    assert_eq!(
        observed,
        vec!["topicX", "reply-1234", "topicD"],
        "the passthrough reply overtakes the queued default frame"
    );

    t.shutdown().await.expect("clean shutdown");
}

#[tokio::test(start_paused = true)]
async fn malformed_bus_payload_tears_down_the_connection() {
    let vizier_id = Uuid::new_v4();
    let mut t = start_bridge(test_config(Some(vizier_id)));

    let mut cloud1 = t.accepted.recv().await.expect("connect");
    ack_registration(&mut cloud1, RegistrationStatus::Ok).await;
    next_frame_on(&mut cloud1, topics::HEARTBEAT).await;

    t.bus
        .publish(
            &topics::v2c_subject("broken"),
            Bytes::from_static(b"not a wrapper"),
        )
        .await
        .expect("bus publish");

    // The bus contract violation closes the stream; the bridge recovers on a
    // fresh one.
    let mut cloud2 = t.accepted.recv().await.expect("reconnect");
    ack_registration(&mut cloud2, RegistrationStatus::Ok).await;
    next_frame_on(&mut cloud2, topics::HEARTBEAT).await;

    t.shutdown().await.expect("clean shutdown");
}

#[tokio::test(start_paused = true)]
async fn stop_is_idempotent_and_run_is_one_shot() {
    let vizier_id = Uuid::new_v4();
    let mut t = start_bridge(test_config(Some(vizier_id)));

    let mut cloud = t.accepted.recv().await.expect("connect");
    ack_registration(&mut cloud, RegistrationStatus::Ok).await;
    next_frame_on(&mut cloud, topics::HEARTBEAT).await;

    t.bridge.stop();
    t.bridge.stop();
    let bridge = t.bridge.clone();
    t.shutdown().await.expect("clean shutdown");

    let err = bridge.run().await.expect_err("second run must fail");
    assert!(matches!(err, BridgeError::AlreadyStarted));
}
