//! File Hot-Reload Integration Tests

use anyhow::{bail, Result};
use layerconf::{ConfigEvent, ConfigurationBuilder, FileSource, MemorySource};
use std::fs;
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::sleep;
use tokio_stream::StreamExt;

#[tokio::test]
async fn test_file_edit_is_picked_up() -> Result<()> {
    // Create temporary directory and config file
    let temp_dir = TempDir::new()?;
    let config_path = temp_dir.path().join("settings.yaml");
    fs::write(&config_path, "server:\n  port: 1080\n  host: localhost\n")?;

    let config = ConfigurationBuilder::new()
        .debounce(Duration::from_millis(50))
        .add_source(0, MemorySource::with_data("defaults", [("Server:Workers", "4")]))
        .add_source(10, FileSource::new(&config_path)?)
        .build()
        .await?;
    let mut changes = config.subscribe();

    assert_eq!(config.get("Server:Port")?.as_deref(), Some("1080"));

    // Modify configuration file
    fs::write(&config_path, "server:\n  port: 1081\n  host: localhost\n")?;

    // Wait for configuration change event
    tokio::select! {
        event = changes.next() => {
            let event = match event {
                Some(Ok(ConfigEvent::Changed(event))) => event,
                other => bail!("unexpected stream item: {:?}", other),
            };
            let change = event.change("server:port").expect("port change");
            assert_eq!(change.old_value.as_deref(), Some("1080"));
            assert_eq!(change.new_value.as_deref(), Some("1081"));
        }
        _ = sleep(Duration::from_secs(5)) => {
            panic!("Configuration change event not received within timeout");
        }
    }

    assert_eq!(config.get("Server:Port")?.as_deref(), Some("1081"));
    assert_eq!(config.get("Server:Workers")?.as_deref(), Some("4"));

    config.dispose().await;
    Ok(())
}

#[tokio::test]
async fn test_invalid_edit_keeps_last_good_values() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let config_path = temp_dir.path().join("app.json");
    fs::write(&config_path, r#"{"Limits": {"MaxConnections": 1000}}"#)?;

    let config = ConfigurationBuilder::new()
        .debounce(Duration::from_millis(50))
        .add_source(0, FileSource::new(&config_path)?)
        .build()
        .await?;
    let mut changes = config.subscribe();

    // Write invalid configuration
    fs::write(&config_path, "{ not json")?;

    tokio::select! {
        event = changes.next() => {
            let failure = match event {
                Some(Ok(ConfigEvent::ReloadFailed(failure))) => failure,
                other => bail!("unexpected stream item: {:?}", other),
            };
            assert!(failure.affected_levels.contains(&0));
        }
        _ = sleep(Duration::from_secs(5)) => {
            panic!("Reload error event not received within timeout");
        }
    }

    // Configuration should remain unchanged
    assert_eq!(config.get("Limits:MaxConnections")?.as_deref(), Some("1000"));

    config.dispose().await;
    Ok(())
}
