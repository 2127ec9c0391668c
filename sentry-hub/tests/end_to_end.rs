mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use sentry_hub::escalation::EscalationError;
use sentry_types::{Channel, Severity, TriggerType};

#[tokio::test]
async fn resting_then_impact_escalates_exactly_once() {
    let service = Arc::new(ScriptedService::default());
    let (radio, pipeline) = start(service.clone()).await;
    let mut readings = pipeline.subscribe_readings();
    let mut gps_fixes = pipeline.subscribe_gps();
    let mut triggers = pipeline.subscribe_triggers();
    let mut verdicts = pipeline.subscribe_verdicts();

    assert_eq!(pipeline.connect(DEVICE).await, Ok(true));

    radio.send_message(DEVICE, Channel::Gps, &gps(47.3769, 8.5417, 11.0));
    gps_fixes.recv().await.unwrap();

    for seq in 0..10 {
        radio.send_message(DEVICE, Channel::Motion, &motion(seq, 9.81));
    }
    for _ in 0..10 {
        let r = readings.recv().await.unwrap();
        assert!((r.g_force(sentry_types::STANDARD_GRAVITY) - 1.0).abs() < 0.01);
    }
    assert!(triggers.try_recv().is_err());

    radio.send_message(DEVICE, Channel::Motion, &motion(10, 120.0));
    radio.send_message(DEVICE, Channel::Motion, &motion(11, 120.0));

    let trigger = triggers.recv().await.unwrap();
    assert!(trigger.is_triggered);
    assert_eq!(trigger.trigger_type, Some(TriggerType::Impact));
    assert_eq!(trigger.severity, Severity::High);

    let verdict = verdicts.recv().await.unwrap();
    assert!(verdict.is_crash);
    assert!(triggers.try_recv().is_err());

    let submitted = service.submitted();
    assert_eq!(submitted.len(), 1);
    let envelope = &submitted[0];
    assert_eq!(envelope.device_id, DEVICE);
    assert_eq!(envelope.sensor_reading.sequence, Some(11));
    let fix = envelope.gps_fix.as_ref().expect("GPS joined into the envelope");
    assert_eq!(fix.latitude, Some(47.3769));
    assert_eq!(fix.satellites, Some(8));

    let status = pipeline.escalation_status();
    assert!(!status.processing);
    assert_eq!(status.last_verdict, Some(verdict));
}

#[tokio::test(start_paused = true)]
async fn escalation_failure_does_not_block_next_detection() {
    let service = Arc::new(ScriptedService::failing_once(EscalationError::Status(502)));
    let (radio, pipeline) = start(service.clone()).await;
    let mut verdicts = pipeline.subscribe_verdicts();
    let mut triggers = pipeline.subscribe_triggers();
    pipeline.connect(DEVICE).await.unwrap();

    radio.send_message(DEVICE, Channel::Motion, &motion(1, 120.0));
    radio.send_message(DEVICE, Channel::Motion, &motion(2, 120.0));
    triggers.recv().await.unwrap();
    wait_until_idle(&pipeline).await;
    assert_eq!(service.submitted().len(), 1);
    assert!(pipeline.escalation_status().last_verdict.is_none());

    // past the cooldown, the very next qualifying pair escalates again
    tokio::time::sleep(Duration::from_secs(16)).await;
    radio.send_message(DEVICE, Channel::Motion, &motion(3, 120.0));
    radio.send_message(DEVICE, Channel::Motion, &motion(4, 120.0));

    assert!(verdicts.recv().await.unwrap().is_crash);
    assert_eq!(service.submitted().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn triggers_inside_cooldown_are_rate_limited() {
    let service = Arc::new(ScriptedService::default());
    let (radio, pipeline) = start(service.clone()).await;
    let mut verdicts = pipeline.subscribe_verdicts();
    pipeline.connect(DEVICE).await.unwrap();

    radio.send_message(DEVICE, Channel::Motion, &motion(1, 120.0));
    radio.send_message(DEVICE, Channel::Motion, &motion(2, 120.0));
    verdicts.recv().await.unwrap();

    tokio::time::sleep(Duration::from_secs(10)).await;
    radio.send_message(DEVICE, Channel::Motion, &motion(3, 120.0));
    radio.send_message(DEVICE, Channel::Motion, &motion(4, 120.0));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(service.submitted().len(), 1);

    tokio::time::sleep(Duration::from_secs(6)).await;
    radio.send_message(DEVICE, Channel::Motion, &motion(5, 120.0));
    verdicts.recv().await.unwrap();
    assert_eq!(service.submitted().len(), 2);
}

#[tokio::test]
async fn small_mtu_and_corrupt_fragments_do_not_stop_the_stream() {
    let service = Arc::new(ScriptedService::default());
    let (radio, pipeline) = start(service).await;
    radio.set_mtu_limit(Some(23));
    let mut readings = pipeline.subscribe_readings();
    pipeline.connect(DEVICE).await.unwrap();

    assert!(radio.send_message(DEVICE, Channel::Motion, &motion(1, 9.7)) > 1);
    radio.push_fragment(DEVICE, Channel::Motion, b"}}\"broken");
    radio.send_message(DEVICE, Channel::Motion, &motion(2, 9.9));

    assert_eq!(readings.recv().await.unwrap().sequence, Some(1));
    assert_eq!(readings.recv().await.unwrap().sequence, Some(2));
}

#[tokio::test]
async fn flat_documents_are_accepted() {
    let service = Arc::new(ScriptedService::default());
    let (radio, pipeline) = start(service).await;
    let mut readings = pipeline.subscribe_readings();
    pipeline.connect(DEVICE).await.unwrap();

    radio.send_message(DEVICE, Channel::Motion, r#"{"ax":0.3,"az":9.6}"#);
    let r = readings.recv().await.unwrap();
    assert_eq!(r.ax, 0.3);
    assert_eq!(r.ay, 0.0);
    assert!(!r.tilt_detected);
}
