//! End-to-end runs of an authority and device processes over loopback TCP

use std::time::Duration;

use serde_json::json;

use simulacrum::authority::{AuthorityEndpoints, AuthoritySettings, Lattice, LatticeEngine, ModelService};
use simulacrum::config::SimulacrumConfig;
use simulacrum::launch::{launch, Process};
use simulacrum_runtime::{ChannelValue, CommandClient, PvClient, ServiceManager};

const TIMEOUT: Duration = Duration::from_secs(5);

async fn start_authority(manager: &ServiceManager) -> (SimulacrumConfig, AuthorityEndpoints) {
    let mut config = SimulacrumConfig::default();
    config.model.command_addr = "127.0.0.1:0".to_string();
    config.model.broadcast_addr = "127.0.0.1:0".to_string();

    let mut settings = AuthoritySettings::from_config(&config);
    settings.push_period = Duration::from_millis(20);
    settings.broadcast_period = Duration::from_millis(20);

    let mut authority = ModelService::new(LatticeEngine::new(Lattice::demo().unwrap()), settings);
    let ready = authority.ready_signal();
    manager.spawn(authority).await.unwrap();
    let endpoints = tokio::time::timeout(TIMEOUT, ready).await.unwrap().unwrap();

    // Devices connect to the ports that were actually bound
    config.model.command_addr = endpoints.command.to_string();
    config.model.broadcast_addr = endpoints.broadcast.to_string();
    (config, endpoints)
}

/// Whitespace-separated field `index` of the single `show ele` row for `element`
async fn element_field(client: &mut CommandClient, element: &str, index: usize) -> String {
    let rows = client.evaluate(&format!("show ele {}", element)).await.unwrap();
    assert_eq!(rows.len(), 1, "{:?}", rows);
    rows[0].split_whitespace().nth(index).unwrap().to_string()
}

async fn strength(client: &mut CommandClient, element: &str) -> f64 {
    element_field(client, element, 5).await.parse().unwrap()
}

async fn read_float(pv: &PvClient, name: &str) -> f64 {
    pv.read(name).await.unwrap().as_f64().unwrap()
}

#[tokio::test]
async fn test_failed_batch_is_rolled_back() {
    let manager = ServiceManager::new();
    let (_, endpoints) = start_authority(&manager).await;
    let mut client = CommandClient::connect(endpoints.command).await.unwrap();

    assert_eq!(client.echo(json!({"hello": 1})).await.unwrap(), json!({"hello": 1}));
    let before = strength(&mut client, "QF1").await;

    let batch = vec![
        "set ele QF1 k1 = 3.0".to_string(),
        "set ele MISSING k1 = 1.0".to_string(),
    ];
    let err = client.evaluate_batch(&batch).await.unwrap_err();
    assert!(err.to_string().contains("instruction 2"), "{}", err);
    assert_eq!(strength(&mut client, "QF1").await, before);

    let applied = client
        .evaluate_batch(&["set ele QF1 k1 = 3.0".to_string(), "show ele QF1".to_string()])
        .await
        .unwrap();
    assert_eq!(applied.len(), 2);
    assert_eq!(strength(&mut client, "QF1").await, 3.0);

    assert!(client.evaluate("exit").await.is_err());
    assert_eq!(client.echo(json!("still here")).await.unwrap(), json!("still here"));

    manager.shutdown_all().await.unwrap();
}

#[tokio::test]
async fn test_bpm_process_follows_the_orbit() {
    let manager = ServiceManager::new();
    let (config, endpoints) = start_authority(&manager).await;
    let mut client = CommandClient::connect(endpoints.command).await.unwrap();

    let bpm = launch(&manager, &Process::Bpm, &config).await.unwrap();

    let s: f64 = element_field(&mut client, "BPM1", 2).await.parse().unwrap();
    assert!((read_float(&bpm, "BPMS:IN20:221:Z").await - s).abs() < 1e-12);
    assert_eq!(read_float(&bpm, "BPMS:IN20:221:X").await, 0.0);

    // Writes to read-only positions are refused
    assert!(bpm.write("BPMS:IN20:221:Z", ChannelValue::Float(1.0)).await.is_err());

    client.evaluate("set ele XC1 hkick = 0.001").await.unwrap();
    let x = tokio::time::timeout(TIMEOUT, async {
        loop {
            let x = read_float(&bpm, "BPMS:IN20:221:X").await;
            if x != 0.0 {
                break x;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert!(x > 0.0);

    manager.shutdown_all().await.unwrap();
}

#[tokio::test]
async fn test_magnet_process_drives_the_model() {
    let manager = ServiceManager::new();
    let (config, endpoints) = start_authority(&manager).await;
    let mut client = CommandClient::connect(endpoints.command).await.unwrap();

    let magnet = launch(&manager, &Process::Magnet, &config).await.unwrap();
    let design = strength(&mut client, "QF1").await;
    assert_eq!(read_float(&magnet, "QUAD:IN20:361:BDES").await, design);
    assert_eq!(read_float(&magnet, "QUAD:IN20:361:BACT").await, design);

    // BDES alone does not touch the model
    magnet.write("QUAD:IN20:361:BDES", ChannelValue::Float(0.7)).await.unwrap();
    assert_eq!(strength(&mut client, "QF1").await, design);

    magnet.write("QUAD:IN20:361:CTRL", "PERTURB".into()).await.unwrap();
    assert_eq!(strength(&mut client, "QF1").await, 0.7);
    assert_eq!(read_float(&magnet, "QUAD:IN20:361:BACT").await, 0.7);

    magnet.write("QUAD:IN20:361:BCTRL", ChannelValue::Float(0.5)).await.unwrap();
    assert_eq!(strength(&mut client, "QF1").await, 0.5);
    assert_eq!(read_float(&magnet, "QUAD:IN20:361:BDES").await, 0.5);

    // Undo restores the setpoint; the next perturb actuates it
    magnet.write("QUAD:IN20:361:CTRL", "UNDO_BDES".into()).await.unwrap();
    assert_eq!(read_float(&magnet, "QUAD:IN20:361:BDES").await, 0.7);
    assert_eq!(strength(&mut client, "QF1").await, 0.5);
    magnet.write("QUAD:IN20:361:CTRL", "PERTURB".into()).await.unwrap();
    assert_eq!(strength(&mut client, "QF1").await, 0.7);

    assert_eq!(magnet.read("QUAD:IN20:361:CTRL").await.unwrap(), ChannelValue::from("Ready"));
    assert!(magnet.write("QUAD:IN20:361:BACT", ChannelValue::Float(1.0)).await.is_err());

    manager.shutdown_all().await.unwrap();
}
