//! Actuator behaviour against the in-memory controller.
//!
//! All tests run on paused time so second-scale timers complete instantly.

use std::time::Duration;

use gate_actuator::fakes::FakeGateHardware;
use gate_actuator::{
    ActuatorConfig, CommandKind, CommandProtocol, GateActuator, GateError, GateState,
};

fn actuator(hw: &FakeGateHardware) -> GateActuator {
    GateActuator::new(ActuatorConfig::default(), hw.connector())
}

#[tokio::test(start_paused = true)]
async fn test_open_is_acknowledged_and_arms_auto_close() {
    let hw = FakeGateHardware::new();
    let gate = actuator(&hw);

    assert_eq!(gate.request_open().await.unwrap(), GateState::Open);
    assert_eq!(gate.state(), GateState::Open);
    assert_eq!(hw.writes(), vec!["OPEN"]);
    assert_eq!(hw.transcript(), vec!["tx:OPEN", "rx:OPENED"]);
    assert!(gate.auto_close_deadline().is_some());
}

#[tokio::test(start_paused = true)]
async fn test_repeated_open_writes_once() {
    let hw = FakeGateHardware::new();
    let gate = actuator(&hw);

    gate.request_open().await.unwrap();
    gate.request_open().await.unwrap();

    assert_eq!(hw.writes(), vec!["OPEN"]);
    assert_eq!(gate.state(), GateState::Open);
}

#[tokio::test(start_paused = true)]
async fn test_close_when_closed_is_a_noop() {
    let hw = FakeGateHardware::new();
    let gate = actuator(&hw);

    assert_eq!(gate.request_close().await.unwrap(), GateState::Closed);
    assert!(hw.writes().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_offline_controller_exhausts_attempts_and_keeps_state() {
    let hw = FakeGateHardware::new();
    hw.set_online(false);
    let gate = actuator(&hw);

    let err = gate.request_open().await.unwrap_err();
    match err {
        GateError::Exhausted {
            command, attempts, ..
        } => {
            assert_eq!(command, CommandKind::Open);
            assert_eq!(attempts, 3);
        }
        other => panic!("expected Exhausted, got {other:?}"),
    }
    assert_eq!(gate.state(), GateState::Closed);
    assert_eq!(hw.connect_attempts(), 3);
    assert!(hw.writes().is_empty());
    assert!(gate.auto_close_deadline().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_unresponsive_controller_retries_with_fresh_connections() {
    let hw = FakeGateHardware::new();
    hw.set_responsive(false);
    let gate = actuator(&hw);

    let started = tokio::time::Instant::now();
    assert!(gate.request_open().await.is_err());

    assert_eq!(hw.writes(), vec!["OPEN", "OPEN", "OPEN"]);
    assert_eq!(hw.connect_count(), 3);
    assert_eq!(gate.state(), GateState::Closed);
    // settle + ack wait per attempt
    assert!(started.elapsed() >= Duration::from_millis(3 * 1200));
}

#[tokio::test(start_paused = true)]
async fn test_slow_ack_within_window_succeeds() {
    let hw = FakeGateHardware::new();
    hw.set_ack_delay(Duration::from_millis(900));
    let gate = actuator(&hw);

    assert_eq!(gate.request_open().await.unwrap(), GateState::Open);
    assert_eq!(hw.writes(), vec!["OPEN"]);
}

#[tokio::test(start_paused = true)]
async fn test_recovers_after_controller_restart() {
    let hw = FakeGateHardware::new();
    let gate = actuator(&hw);
    gate.request_open().await.unwrap();

    // Controller drops off the bus and comes back.
    hw.set_online(false);
    hw.set_online(true);

    assert_eq!(gate.request_close().await.unwrap(), GateState::Closed);
    assert_eq!(hw.connect_count(), 2);
    assert_eq!(hw.writes(), vec!["OPEN", "CLOSE"]);
}

#[tokio::test(start_paused = true)]
async fn test_auto_close_fires_after_open_period() {
    let hw = FakeGateHardware::new();
    let gate = actuator(&hw);
    gate.request_open().await.unwrap();

    tokio::time::sleep(Duration::from_millis(4_700)).await;
    assert_eq!(gate.state(), GateState::Open);
    assert_eq!(hw.writes(), vec!["OPEN"]);

    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(gate.state(), GateState::Closed);
    assert_eq!(hw.writes(), vec!["OPEN", "CLOSE"]);
    assert!(gate.auto_close_deadline().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_second_open_rearms_auto_close() {
    let hw = FakeGateHardware::new();
    let gate = actuator(&hw);
    gate.request_open().await.unwrap();

    tokio::time::sleep(Duration::from_millis(3_000)).await;
    gate.request_open().await.unwrap();

    // Past the first deadline but inside the re-armed one.
    tokio::time::sleep(Duration::from_millis(3_000)).await;
    assert_eq!(gate.state(), GateState::Open);
    assert_eq!(hw.writes(), vec!["OPEN"]);

    tokio::time::sleep(Duration::from_millis(2_500)).await;
    assert_eq!(gate.state(), GateState::Closed);
    assert_eq!(hw.writes(), vec!["OPEN", "CLOSE"]);
}

#[tokio::test(start_paused = true)]
async fn test_check_auto_close_before_expiry_does_nothing() {
    let hw = FakeGateHardware::new();
    let gate = actuator(&hw);
    gate.request_open().await.unwrap();

    assert!(!gate.check_auto_close().await.unwrap());
    assert_eq!(hw.writes(), vec!["OPEN"]);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_commands_never_interleave() {
    let hw = FakeGateHardware::new();
    hw.set_ack_delay(Duration::from_millis(50));
    let gate = actuator(&hw);

    let mut handles = Vec::new();
    for i in 0..6 {
        let gate = gate.clone();
        handles.push(tokio::spawn(async move {
            if i % 2 == 0 {
                gate.request_open().await
            } else {
                gate.request_close().await
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let transcript = hw.transcript();
    assert!(!transcript.is_empty());
    assert_eq!(transcript.len() % 2, 0);
    for pair in transcript.chunks(2) {
        match pair[0].as_str() {
            "tx:OPEN" => assert_eq!(pair[1], "rx:OPENED"),
            "tx:CLOSE" => assert_eq!(pair[1], "rx:CLOSED"),
            other => panic!("unexpected entry {other}"),
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_unsolicited_lines_reach_subscribers_during_exchange() {
    let hw = FakeGateHardware::new();
    let gate = actuator(&hw);
    let mut rx = gate.subscribe();

    // Establish the channel, then let the controller chatter before the next command.
    gate.request_open().await.unwrap();
    hw.push_unsolicited("Vehicle passed");
    gate.request_close().await.unwrap();

    let msg = rx.recv().await.unwrap();
    assert_eq!(msg.line, "Vehicle passed");
}

#[tokio::test(start_paused = true)]
async fn test_listener_forwards_unsolicited_lines() {
    let hw = FakeGateHardware::new();
    let gate = actuator(&hw);
    gate.request_open().await.unwrap();

    let mut rx = gate.subscribe();
    let listener = gate.spawn_listener();
    hw.push_unsolicited("DETECT");

    let msg = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("listener should forward the line")
        .unwrap();
    assert_eq!(msg.line, "DETECT");
    listener.abort();
}

#[tokio::test(start_paused = true)]
async fn test_single_byte_protocol_accepts_verbose_acks() {
    let hw = FakeGateHardware::new();
    let config = ActuatorConfig {
        protocol: CommandProtocol::SingleByte,
        ..Default::default()
    };
    let gate = GateActuator::new(config, hw.connector());

    gate.request_open().await.unwrap();
    gate.request_close().await.unwrap();

    assert_eq!(hw.writes(), vec!["ENABLE", "1", "0"]);
    assert_eq!(gate.state(), GateState::Closed);
}

fn single_byte(hw: &FakeGateHardware) -> GateActuator {
    let config = ActuatorConfig {
        protocol: CommandProtocol::SingleByte,
        ..Default::default()
    };
    GateActuator::new(config, hw.connector())
}

#[tokio::test(start_paused = true)]
async fn test_single_byte_reconnect_enables_again() {
    let hw = FakeGateHardware::new();
    let gate = single_byte(&hw);
    gate.request_open().await.unwrap();

    // Kills the channel; the controller comes back disabled.
    hw.set_online(false);
    hw.set_online(true);
    gate.request_close().await.unwrap();

    assert_eq!(hw.writes(), vec!["ENABLE", "1", "ENABLE", "0"]);
    assert_eq!(gate.state(), GateState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_single_byte_controller_that_never_enables() {
    let hw = FakeGateHardware::new();
    hw.set_responsive(false);
    let gate = single_byte(&hw);

    match gate.request_open().await.unwrap_err() {
        GateError::Exhausted { last_error, .. } => assert!(last_error.contains("ENABLED")),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(gate.state(), GateState::Closed);
    assert!(!hw.writes().contains(&"1".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_single_byte_shutdown_disables_controller() {
    let hw = FakeGateHardware::new();
    let gate = single_byte(&hw);
    gate.request_open().await.unwrap();
    assert!(hw.enabled());

    gate.shutdown().await.unwrap();

    assert_eq!(hw.writes(), vec!["ENABLE", "1", "0", "DISABLE"]);
    assert!(!hw.enabled());
}

#[tokio::test(start_paused = true)]
async fn test_firmware_auto_close_settles_state_without_a_write() {
    let hw = FakeGateHardware::new();
    let gate = single_byte(&hw);
    gate.request_open().await.unwrap();
    hw.push_unsolicited("Gate auto-closed after timeout");

    let mut states = gate.watch_state();
    tokio::time::timeout(
        Duration::from_secs(10),
        states.wait_for(|s| *s == GateState::Closed),
    )
    .await
    .expect("auto-close should settle")
    .unwrap();

    assert_eq!(hw.writes(), vec!["ENABLE", "1"]);
    assert!(gate.auto_close_deadline().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_state_watch_reports_transitions() {
    let hw = FakeGateHardware::new();
    let gate = actuator(&hw);
    let mut states = gate.watch_state();

    gate.request_open().await.unwrap();
    states.changed().await.unwrap();
    assert_eq!(*states.borrow_and_update(), GateState::Open);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_closes_gate_and_rejects_commands() {
    let hw = FakeGateHardware::new();
    let gate = actuator(&hw);
    gate.request_open().await.unwrap();

    gate.shutdown().await.unwrap();

    assert_eq!(hw.writes(), vec!["OPEN", "CLOSE"]);
    assert_eq!(gate.state(), GateState::Closed);
    assert!(matches!(gate.request_open().await, Err(GateError::Shutdown)));
}

#[tokio::test(start_paused = true)]
async fn test_connect_eagerly_tolerates_missing_controller() {
    let hw = FakeGateHardware::new();
    hw.set_online(false);
    let gate = GateActuator::connect(ActuatorConfig::default(), hw.connector()).await;
    assert_eq!(gate.state(), GateState::Closed);

    hw.set_online(true);
    assert_eq!(gate.request_open().await.unwrap(), GateState::Open);
}
