use anyhow::{Context, Result};

use crate::config::*;

#[test]
fn config_deserializes_from_full_env() -> Result<()> {
    let config: Config = envy::from_iter(vec![
        ("RUST_LOG".into(), "error".into()),
        ("CLUSTER_NAME".into(), "shards".into()),
        ("CONTROLLER_NAME".into(), "controller-0".into()),
        ("STORAGE_DATA_PATH".into(), "/var/lib/corral".into()),
        ("METRICS_PORT".into(), "7002".into()),
        ("REBALANCE_INTERVAL_MS".into(), "1000".into()),
        ("VERIFY_INTERVAL_MS".into(), "2000".into()),
        ("REPORT_INTERVAL_MS".into(), "3000".into()),
        ("LEASE_DURATION_SECONDS".into(), "60".into()),
        ("LEASE_RENEW_SECONDS".into(), "20".into()),
        ("LOCAL_NODES".into(), "node-0,node-1".into()),
    ])?;
    config.validate()?;

    assert!(config.rust_log == "error", "unexpected value parsed for RUST_LOG, got {}, expected {}", config.rust_log, "error");
    assert!(config.cluster_name == "shards", "unexpected value parsed for CLUSTER_NAME, got {}, expected {}", config.cluster_name, "shards");
    assert!(
        config.controller_name == "controller-0",
        "unexpected value parsed for CONTROLLER_NAME, got {}, expected {}",
        config.controller_name,
        "controller-0"
    );
    assert!(
        config.storage_data_path == "/var/lib/corral",
        "unexpected value parsed for STORAGE_DATA_PATH, got {}, expected {}",
        config.storage_data_path,
        "/var/lib/corral"
    );
    assert!(config.metrics_port == 7002, "unexpected value parsed for METRICS_PORT, got {}, expected {}", config.metrics_port, 7002);
    assert!(
        config.rebalance_interval_ms == 1000,
        "unexpected value parsed for REBALANCE_INTERVAL_MS, got {}, expected {}",
        config.rebalance_interval_ms,
        1000
    );
    assert!(
        config.verify_interval_ms == 2000,
        "unexpected value parsed for VERIFY_INTERVAL_MS, got {}, expected {}",
        config.verify_interval_ms,
        2000
    );
    assert!(
        config.report_interval_ms == 3000,
        "unexpected value parsed for REPORT_INTERVAL_MS, got {}, expected {}",
        config.report_interval_ms,
        3000
    );
    assert!(
        config.lease_duration_seconds == 60,
        "unexpected value parsed for LEASE_DURATION_SECONDS, got {}, expected {}",
        config.lease_duration_seconds,
        60
    );
    assert!(
        config.lease_renew_seconds == 20,
        "unexpected value parsed for LEASE_RENEW_SECONDS, got {}, expected {}",
        config.lease_renew_seconds,
        20
    );
    assert!(
        config.local_nodes == vec!["node-0".to_string(), "node-1".to_string()],
        "unexpected value parsed for LOCAL_NODES, got {:?}, expected {:?}",
        config.local_nodes,
        vec!["node-0", "node-1"]
    );

    Ok(())
}

#[test]
fn config_deserializes_from_sparse_env() -> Result<()> {
    let config: Config = envy::from_iter(vec![
        ("RUST_LOG".into(), "error".into()),
        ("CLUSTER_NAME".into(), "shards".into()),
        ("CONTROLLER_NAME".into(), "controller-0".into()),
    ])?;
    config.validate()?;

    assert!(
        config.storage_data_path == "/usr/local/corral/data",
        "unexpected default for STORAGE_DATA_PATH, got {}, expected {}",
        config.storage_data_path,
        "/usr/local/corral/data"
    );
    assert!(config.metrics_port == 9090, "unexpected default for METRICS_PORT, got {}, expected {}", config.metrics_port, 9090);
    assert!(
        config.rebalance_interval_ms == 5000,
        "unexpected default for REBALANCE_INTERVAL_MS, got {}, expected {}",
        config.rebalance_interval_ms,
        5000
    );
    assert!(
        config.verify_interval_ms == 30000,
        "unexpected default for VERIFY_INTERVAL_MS, got {}, expected {}",
        config.verify_interval_ms,
        30000
    );
    assert!(
        config.report_interval_ms == 60000,
        "unexpected default for REPORT_INTERVAL_MS, got {}, expected {}",
        config.report_interval_ms,
        60000
    );
    assert!(
        config.lease_duration_seconds == 30,
        "unexpected default for LEASE_DURATION_SECONDS, got {}, expected {}",
        config.lease_duration_seconds,
        30
    );
    assert!(
        config.lease_renew_seconds == 10,
        "unexpected default for LEASE_RENEW_SECONDS, got {}, expected {}",
        config.lease_renew_seconds,
        10
    );
    assert!(config.local_nodes.is_empty(), "expected no local nodes by default, got {:?}", config.local_nodes);

    Ok(())
}

#[test]
fn config_rejects_invalid_leases() -> Result<()> {
    let base = vec![
        ("RUST_LOG".to_string(), "error".to_string()),
        ("CLUSTER_NAME".to_string(), "shards".to_string()),
        ("CONTROLLER_NAME".to_string(), "controller-0".to_string()),
    ];
    let cases = [("10", "10"), ("10", "20"), ("1", "0")];
    for (duration, renew) in cases {
        let mut env = base.clone();
        env.push(("LEASE_DURATION_SECONDS".into(), duration.into()));
        env.push(("LEASE_RENEW_SECONDS".into(), renew.into()));
        let config: Config = envy::from_iter(env)?;
        let res = config.validate();
        assert!(res.is_err(), "expected lease duration {} with renew {} to be rejected", duration, renew);
    }

    let config: Config = envy::from_iter(base)?;
    config.validate().context("expected the default leases to be valid")?;
    Ok(())
}

#[test]
fn config_requires_cluster_name() {
    let res = envy::from_iter::<_, Config>(vec![("RUST_LOG".to_string(), "error".to_string()), ("CONTROLLER_NAME".to_string(), "c".to_string())]);
    assert!(res.is_err(), "expected a missing CLUSTER_NAME to be rejected");
}
