//! Reload, Debounce and Rollback Integration Tests

use anyhow::{bail, Result};
use layerconf::{ChangeType, ConfigError, ConfigEvent, ConfigurationBuilder, MemorySource, ReloadTrigger};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::sleep;

async fn next_event(events: &mut broadcast::Receiver<ConfigEvent>) -> Result<ConfigEvent> {
    tokio::select! {
        event = events.recv() => Ok(event?),
        _ = sleep(Duration::from_secs(5)) => bail!("no configuration event within timeout"),
    }
}

async fn assert_quiet(events: &mut broadcast::Receiver<ConfigEvent>, window: Duration) {
    if let Ok(Ok(event)) = tokio::time::timeout(window, events.recv()).await {
        panic!("unexpected event: {:?}", event);
    }
}

#[tokio::test]
async fn test_rapid_notifications_collapse_into_one_event() -> Result<()> {
    let source = MemorySource::with_data("live", [("Counter", "0")]);
    let config = ConfigurationBuilder::new()
        .debounce(Duration::from_millis(50))
        .add_source(0, source.clone())
        .build()
        .await?;
    let mut events = config.subscribe_receiver();

    for i in 1..=5 {
        source.set_external("Counter", Some(i.to_string()));
    }

    let event = next_event(&mut events).await?;
    let change = event.as_change().expect("change event");
    assert_eq!(change.trigger, ReloadTrigger::Watch);
    assert_eq!(change.len(), 1);
    assert_eq!(change.change("Counter").unwrap().new_value.as_deref(), Some("5"));
    assert_quiet(&mut events, Duration::from_millis(300)).await;

    assert_eq!(config.get("Counter")?.as_deref(), Some("5"));
    config.dispose().await;
    Ok(())
}

#[tokio::test]
async fn test_changes_across_sources_collapse() -> Result<()> {
    let a = MemorySource::with_data("a", [("A", "1")]);
    let b = MemorySource::with_data("b", [("B", "1")]);
    let config = ConfigurationBuilder::new()
        .debounce(Duration::from_millis(50))
        .add_source(0, a.clone())
        .add_source(1, b.clone())
        .build()
        .await?;
    let mut events = config.subscribe_receiver();

    a.set_external("A", Some("2".into()));
    b.set_external("B", Some("2".into()));

    let event = next_event(&mut events).await?;
    let change = event.as_change().expect("change event");
    assert_eq!(change.len(), 2);
    assert_eq!(change.sources.len(), 2);
    assert_quiet(&mut events, Duration::from_millis(300)).await;

    config.dispose().await;
    Ok(())
}

#[tokio::test]
async fn test_failed_reload_keeps_previous_view() -> Result<()> {
    let stable = MemorySource::with_data("stable", [("Base", "1")]);
    let flaky = MemorySource::with_data("flaky", [("X", "1")]);
    let config = ConfigurationBuilder::new()
        .debounce(Duration::from_millis(20))
        .add_source(0, stable)
        .add_source(5, flaky.clone())
        .build()
        .await?;
    let mut events = config.subscribe_receiver();
    let before = config.snapshot();

    flaky.fail_next_loads(1);
    flaky.set_external("X", Some("2".into()));

    let event = next_event(&mut events).await?;
    let failure = event.as_error().expect("reload error event");
    assert_eq!(failure.affected_levels.iter().copied().collect::<Vec<_>>(), vec![5]);
    assert_eq!(failure.errors.len(), 1);
    assert!(matches!(failure.errors[0].as_ref(), ConfigError::SourceUnavailable { .. }));
    assert!(failure.rolled_back);
    assert_quiet(&mut events, Duration::from_millis(200)).await;

    assert_eq!(*config.snapshot(), *before);
    assert_eq!(config.get("X")?.as_deref(), Some("1"));

    // The source recovers on the next reload
    let outcome = config.reload().await?;
    assert!(outcome.is_success());
    assert_eq!(config.get("X")?.as_deref(), Some("2"));

    config.dispose().await;
    Ok(())
}

#[tokio::test]
async fn test_external_removal_is_reported() -> Result<()> {
    // A long debounce keeps the watch path out of the way
    let file = MemorySource::with_data("file", [("X:Y", "a")]).read_only();
    let config = ConfigurationBuilder::new()
        .debounce(Duration::from_secs(5))
        .add_source(5, file.clone())
        .build()
        .await?;
    let mut events = config.subscribe_receiver();

    file.remove_external("X:Y");
    let outcome = config.reload().await?;

    assert_eq!(config.get("X:Y")?, None);
    let change = outcome.changes.expect("change event");
    assert_eq!(change.trigger, ReloadTrigger::Manual);
    let removed = change.change("X:Y").unwrap();
    assert_eq!(removed.old_value.as_deref(), Some("a"));
    assert_eq!(removed.new_value, None);
    assert_eq!(removed.change_type, ChangeType::Removed);

    let published = next_event(&mut events).await?;
    assert_eq!(published.as_change().unwrap().len(), 1);

    config.dispose().await;
    Ok(())
}

#[tokio::test]
async fn test_reload_without_changes_publishes_nothing() -> Result<()> {
    let config = ConfigurationBuilder::new()
        .add_source(0, MemorySource::with_data("static", [("A", "1")]))
        .build()
        .await?;
    let mut events = config.subscribe_receiver();

    let outcome = config.reload().await?;
    assert!(outcome.changes.is_none());
    assert!(outcome.is_success());
    assert_quiet(&mut events, Duration::from_millis(100)).await;

    config.dispose().await;
    Ok(())
}

#[tokio::test]
async fn test_change_listener_until_guard_dropped() -> Result<()> {
    let source = MemorySource::new("mem");
    let config = ConfigurationBuilder::new()
        .add_primary(0, source.clone())
        .build()
        .await?;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let guard = config.on_change(move |event| {
        sink.lock().extend(event.changes.keys().cloned());
    });

    config.set("A", "1").await?;
    for _ in 0..50 {
        if !seen.lock().is_empty() {
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(*seen.lock(), vec!["A".to_string()]);

    drop(guard);
    sleep(Duration::from_millis(50)).await;
    config.set("B", "2").await?;
    sleep(Duration::from_millis(100)).await;
    assert_eq!(seen.lock().len(), 1);

    config.dispose().await;
    Ok(())
}

#[tokio::test]
async fn test_dispose_stops_everything() -> Result<()> {
    let source = MemorySource::with_data("mem", [("A", "1")]);
    let config = ConfigurationBuilder::new()
        .add_primary(0, source.clone())
        .build()
        .await?;
    let _guard = config.on_change(|_| {});

    config.dispose().await;
    assert!(config.is_disposed());
    assert!(matches!(config.set("A", "2").await, Err(ConfigError::Disposed)));
    assert!(matches!(config.reload().await, Err(ConfigError::Disposed)));
    assert_eq!(source.value("A").as_deref(), Some("1"));

    // Reads keep serving the last view
    assert_eq!(config.get("A")?.as_deref(), Some("1"));

    // Second dispose is a no-op
    config.dispose().await;
    Ok(())
}
