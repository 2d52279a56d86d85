mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use color_eyre::Result;
use common::*;
use pretty_assertions::assert_eq;
use promptline::command::Params;
use promptline::config::DeviceConfig;
use promptline::device::{ChangeReason, StateChange, NOT_CONNECTED};
use promptline::error::Error;
use promptline::mock::MockWireFactory;
use serde_json::json;

fn recording_subscriber(
    device: &promptline::device::Device,
) -> Arc<Mutex<Vec<StateChange>>> {
    let changes = Arc::new(Mutex::new(Vec::new()));
    let changes_clone = Arc::clone(&changes);
    device.add_state_change_subscriber(move |change| {
        changes_clone.lock().unwrap().push(change.clone());
    });
    changes
}

#[tokio::test]
async fn goto_remote_state_and_run_a_command_there() -> Result<()> {
    let wires = MockWireFactory::new(shell_script());
    let factory = mock_factory(lab_config(), wires.clone())?;

    let device = factory.get_device("lab").await?;
    assert_eq!(device.current_state(), NOT_CONNECTED);

    let changes = recording_subscriber(&device);

    device
        .goto_state("UNIX_REMOTE", Duration::from_secs(5))
        .await?;
    assert_eq!(device.current_state(), "UNIX_REMOTE");

    // Hops: NOT_CONNECTED -> UNIX_LOCAL (open) -> UNIX_REMOTE (ssh).
    let seen: Vec<(String, String)> = changes
        .lock()
        .unwrap()
        .iter()
        .map(|change| (change.from.clone(), change.to.clone()))
        .collect();
    assert_eq!(
        seen,
        vec![
            (NOT_CONNECTED.to_string(), "UNIX_LOCAL".to_string()),
            ("UNIX_LOCAL".to_string(), "UNIX_REMOTE".to_string()),
        ]
    );

    // The ssh hop authenticated through the scripted password prompt.
    let written = wires.remotes()[0].written();
    assert!(written.contains(&"ssh tester@remote".to_string()));
    assert!(written.contains(&"secret".to_string()));

    // Commands constructed now run on the same connection, in the remote
    // state.
    let ls = device.get_cmd("ls", Params::new())?;
    let result = ls.run(Duration::from_secs(2)).await?;
    assert_eq!(result["files"], json!(["app.log", "report.txt"]));

    Ok(())
}

#[tokio::test]
async fn goto_state_is_idempotent_when_already_there() -> Result<()> {
    let wires = MockWireFactory::new(shell_script());
    let factory = mock_factory(lab_config(), wires)?;

    let device = factory.get_device("lab").await?;
    device
        .goto_state("UNIX_LOCAL", Duration::from_secs(5))
        .await?;
    device
        .goto_state("UNIX_LOCAL", Duration::from_secs(5))
        .await?;
    assert_eq!(device.current_state(), "UNIX_LOCAL");
    Ok(())
}

#[tokio::test]
async fn command_not_registered_for_state_is_not_allowed() -> Result<()> {
    let wires = MockWireFactory::new(shell_script());
    let factory = mock_factory(lab_config(), wires)?;

    let device = factory.get_device("lab").await?;

    // `exit` only exists in UNIX_REMOTE; the device is NOT_CONNECTED.
    match device.get_cmd("exit", Params::new()) {
        Err(Error::NotAllowed { name, state }) => {
            assert_eq!(name, "exit");
            assert_eq!(state, NOT_CONNECTED);
        }
        other => panic!("expected NotAllowed, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn failed_hop_keeps_last_reached_state() -> Result<()> {
    // The remote answers ssh with a permission error instead of a
    // password prompt.
    let wires = MockWireFactory::new(
        silent_script()
            .reply(r"^ssh", "Permission denied (publickey,password).\nmoler_bash# "),
    );
    let factory = mock_factory(lab_config(), wires)?;

    let device = factory.get_device("lab").await?;
    let changes = recording_subscriber(&device);

    let failure = device
        .goto_state("UNIX_REMOTE", Duration::from_secs(2))
        .await
        .unwrap_err();

    match failure {
        Error::HopFailure { from, to, source, .. } => {
            assert_eq!(from, "UNIX_LOCAL");
            assert_eq!(to, "UNIX_REMOTE");
            assert!(matches!(*source, Error::CommandFailure { .. }));
        }
        other => panic!("expected HopFailure, got {other}"),
    }

    // Left in the last successfully reached state.
    assert_eq!(device.current_state(), "UNIX_LOCAL");

    // The failed hop still produced a notification.
    let reasons: Vec<ChangeReason> = changes
        .lock()
        .unwrap()
        .iter()
        .map(|change| change.reason)
        .collect();
    assert_eq!(reasons, vec![ChangeReason::Hop, ChangeReason::Failure]);
    Ok(())
}

#[tokio::test]
async fn background_transition_resolves() -> Result<()> {
    let wires = MockWireFactory::new(shell_script());
    let factory = mock_factory(lab_config(), wires)?;

    let device = factory.get_device("lab").await?;
    let transition = device.goto_state_bg("UNIX_REMOTE");
    transition.await_done().await?;
    assert_eq!(device.current_state(), "UNIX_REMOTE");
    Ok(())
}

#[tokio::test]
async fn connection_lost_moves_device_to_not_connected() -> Result<()> {
    let wires = MockWireFactory::new(silent_script());
    let factory = mock_factory(lab_config(), wires.clone())?;

    let device = factory.get_device("lab").await?;
    device
        .goto_state("UNIX_LOCAL", Duration::from_secs(5))
        .await?;

    let changes = recording_subscriber(&device);

    // A command is mid-flight when the transport dies.
    let ping = device.get_cmd("ping", {
        let mut params = Params::new();
        params.insert("destination".into(), json!("10.0.0.255"));
        params
    })?;
    // No script matches this write... the wire stays silent.
    ping.start(Duration::from_secs(30))?;

    wires.remotes()[0].close();

    assert!(matches!(
        ping.await_done(Duration::from_secs(2)).await.unwrap_err(),
        Error::ConnectionLost(_)
    ));

    settle().await;
    assert_eq!(device.current_state(), NOT_CONNECTED);

    let changes = changes.lock().unwrap().clone();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].from, "UNIX_LOCAL");
    assert_eq!(changes[0].to, NOT_CONNECTED);
    assert_eq!(changes[0].reason, ChangeReason::ConnectionLost);
    Ok(())
}

#[tokio::test]
async fn auto_reconnect_restores_former_state() -> Result<()> {
    let mut config = lab_config();
    let lab = config.devices.get_mut("lab").unwrap();
    lab.additional_params
        .insert("auto_reconnect".into(), json!(true));
    lab.additional_params
        .insert("reconnect_initial_ms".into(), json!(50));

    let wires = MockWireFactory::new(shell_script());
    let factory = mock_factory(config, wires.clone())?;

    let device = factory.get_device("lab").await?;
    device
        .goto_state("UNIX_LOCAL", Duration::from_secs(5))
        .await?;

    wires.remotes()[0].close();
    settle().await;
    assert_eq!(device.current_state(), NOT_CONNECTED);

    // Backoff starts at 50 ms; well within a second the device is back.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(device.current_state(), "UNIX_LOCAL");
    assert_eq!(wires.remotes().len(), 2);
    Ok(())
}

#[tokio::test]
async fn close_retreats_to_local_and_drops_the_transport() -> Result<()> {
    let wires = MockWireFactory::new(shell_script());
    let factory = mock_factory(lab_config(), wires.clone())?;

    let device = factory.get_device("lab").await?;
    device
        .goto_state("UNIX_REMOTE", Duration::from_secs(5))
        .await?;

    device.close().await;
    assert_eq!(device.current_state(), NOT_CONNECTED);

    // The reverse hop ran before the transport went down.
    let written = wires.remotes()[0].written();
    assert!(written.contains(&"exit".to_string()));

    // Closing again is a no-op.
    device.close().await;
    Ok(())
}

#[tokio::test]
async fn factory_returns_the_same_device_and_rejects_duplicates() -> Result<()> {
    let wires = MockWireFactory::new(shell_script());
    let factory = mock_factory(lab_config(), wires)?;

    let first = factory.get_device("lab").await?;
    let second = factory.get_device("lab").await?;
    assert!(Arc::ptr_eq(&first, &second));

    assert_eq!(
        factory
            .add_device("lab", DeviceConfig::default())
            .unwrap_err(),
        Error::NameInUse("lab".into())
    );

    // A fresh name is fine.
    factory.add_device(
        "lab-2",
        DeviceConfig {
            device_class: "unix_local".into(),
            ..Default::default()
        },
    )?;
    let added = factory.get_device("lab-2").await?;
    assert_eq!(added.current_state(), NOT_CONNECTED);

    factory.remove_device("lab-2").await?;
    assert!(factory.get_device("lab-2").await.is_err());
    Ok(())
}

#[tokio::test]
async fn device_events_are_state_indexed() -> Result<()> {
    let wires = MockWireFactory::new(shell_script());
    let factory = mock_factory(lab_config(), wires.clone())?;
    let device = factory.get_device("lab").await?;

    // Nothing is registered for NOT_CONNECTED.
    assert!(matches!(
        device.get_event("line", Params::new()),
        Err(Error::NotAllowed { .. })
    ));

    device
        .goto_state("UNIX_LOCAL", Duration::from_secs(5))
        .await?;

    let mut params = Params::new();
    params.insert("pattern".into(), json!(r"ALARM (?P<code>\d+)"));
    params.insert("stop_after".into(), json!(1));
    let alarm = device.get_event("line", params)?;
    alarm.start(Duration::from_secs(5))?;

    wires.remotes()[0].inject("ALARM 42\n");

    let result = alarm.await_done(Duration::from_secs(2)).await?;
    assert_eq!(result[0]["groups"]["code"], json!("42"));
    Ok(())
}

#[tokio::test]
async fn initial_state_is_entered_on_first_get() -> Result<()> {
    let mut config = lab_config();
    config.devices.get_mut("lab").unwrap().initial_state = Some("UNIX_LOCAL".into());

    let wires = MockWireFactory::new(shell_script());
    let factory = mock_factory(config, wires)?;

    let device = factory.get_device("lab").await?;
    assert_eq!(device.current_state(), "UNIX_LOCAL");
    Ok(())
}
