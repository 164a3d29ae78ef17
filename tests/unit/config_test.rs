//! Tests for configuration validation

use std::collections::HashMap;

use reactorlab::config::{ConfigError, DeviceConfig, DeviceKind, HubConfig, NodeConfig};

fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = vars
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect();
    move |key: &str| map.get(key).cloned()
}

#[test]
fn test_hub_defaults_are_valid() {
    let cfg = HubConfig::default();
    assert!(cfg.validate().is_ok());
    assert_eq!(cfg.policy().max_active_per_owner, 5);
    assert_eq!(cfg.dispatch_config().max_retries, 3);
}

#[test]
fn test_hub_invalid_quota() {
    let cfg = HubConfig {
        max_active_per_owner: 0,
        ..HubConfig::default()
    };
    assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
}

#[test]
fn test_hub_invalid_cpu_share() {
    let mut cfg = HubConfig::default();
    cfg.limits.cpu_share = 0.0;
    assert!(cfg.validate().is_err());
}

#[test]
fn test_hub_from_json_fills_defaults() {
    let cfg = HubConfig::from_json_str(r#"{ "data_dir": "/tmp/q", "tick_ms": 250 }"#).unwrap();
    assert_eq!(cfg.data_dir.to_str(), Some("/tmp/q"));
    assert_eq!(cfg.tick_ms, 250);
    assert_eq!(cfg.max_active_per_owner, 5);
}

#[test]
fn test_hub_from_json_rejects_garbage() {
    assert!(matches!(
        HubConfig::from_json_str("{ not json"),
        Err(ConfigError::Parse(_))
    ));
}

#[test]
fn test_hub_env_overrides() {
    let cfg = HubConfig::from_lookup(lookup(&[
        ("REACTORLAB_MAX_ACTIVE_PER_OWNER", "2"),
        ("REACTORLAB_CLEANUP_INTERVAL_SECS", "600"),
        ("REACTORLAB_DEADLINE_SECS", "90"),
    ]))
    .unwrap();
    assert_eq!(cfg.max_active_per_owner, 2);
    assert_eq!(cfg.cleanup_interval_secs, Some(600));
    assert_eq!(cfg.limits.deadline_secs, 90);
}

#[test]
fn test_hub_env_parse_error_names_variable() {
    let err = HubConfig::from_lookup(lookup(&[("REACTORLAB_TICK_MS", "soon")])).unwrap_err();
    match err {
        ConfigError::Env { var, .. } => assert_eq!(var, "REACTORLAB_TICK_MS"),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn test_node_defaults_list_standard_devices() {
    let cfg = NodeConfig::default();
    assert!(cfg.validate().is_ok());
    let names: Vec<&str> = cfg.devices.iter().map(|d| d.name.as_str()).collect();
    assert_eq!(
        names,
        vec![
            "led",
            "stirrer",
            "peltier",
            "ring_light",
            "pump",
            "temperature",
            "optical_density",
            "co2"
        ]
    );
}

#[test]
fn test_node_rejects_duplicate_devices() {
    let cfg = NodeConfig {
        devices: vec![
            DeviceConfig::new("led", DeviceKind::Led),
            DeviceConfig::new("led", DeviceKind::Stirrer),
        ],
        ..NodeConfig::default()
    };
    assert!(cfg.validate().is_err());
}

#[test]
fn test_node_rejects_empty_interpreter() {
    let cfg = NodeConfig {
        interpreter: Vec::new(),
        ..NodeConfig::default()
    };
    assert!(cfg.validate().is_err());
}

#[test]
fn test_node_device_json() {
    let cfg = NodeConfig::from_json_str(
        r#"{
            "devices": [
                { "name": "ring", "kind": "ring_light", "pixel_count": 8 },
                { "name": "od", "kind": "optical_density", "enabled": false },
                { "name": "pumps", "kind": "pump", "pumps": ["in", "out"], "max_velocity": 2.0 }
            ]
        }"#,
    )
    .unwrap();
    assert_eq!(cfg.devices.len(), 3);
    assert_eq!(cfg.devices[0].kind, DeviceKind::RingLight { pixel_count: 8 });
    assert!(!cfg.devices[1].enabled);
    assert_eq!(cfg.devices[1].kind, DeviceKind::OpticalDensity { channels: 4 });
    assert!(matches!(cfg.devices[2].kind, DeviceKind::Pump { ref pumps, .. } if pumps.len() == 2));
}

#[test]
fn test_node_env_interpreter_split() {
    let cfg = NodeConfig::from_lookup(lookup(&[
        ("REACTORLAB_INTERPRETER", "/usr/bin/python3 -u -B"),
        ("REACTORLAB_WORK_ROOT", "/srv/runs"),
    ]))
    .unwrap();
    assert_eq!(cfg.interpreter, vec!["/usr/bin/python3", "-u", "-B"]);
    assert_eq!(cfg.sandbox_settings().work_root.to_str(), Some("/srv/runs"));
}
