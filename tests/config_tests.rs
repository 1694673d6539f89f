use bluekey::config::app_config::{
    load_file_config, save_file_config, Config, ConfigError, FileConfig,
};
use bluekey::vault::store::PersistMode;
use serial_test::serial;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::tempdir;

const VARS: &[&str] = &[
    "BLUEKEY_VAULT_PATH",
    "BLUEKEY_REMOTE_PATH",
    "BLUEKEY_CLIP_TTL",
    "BLUEKEY_USERNAME_IS_SECRET",
    "BLUEKEY_BACKUPS",
    "BLUEKEY_SAVE_BATCH",
    "BLUEKEY_MAX_ENTRIES",
    "BLUEKEY_SYNC_INTERVAL",
    "BLUEKEY_SYNC_RETRIES",
    "BLUEKEY_SYNC_BACKOFF_MS",
    "BLUEKEY_NETWORK_TIMEOUT",
    "BLUEKEY_KDF_M_COST",
    "BLUEKEY_KDF_T_COST",
    "BLUEKEY_KDF_LANES",
];

/// Point the config dir at `dir` and clear every override.
fn isolate(dir: &Path) -> PathBuf {
    for var in VARS {
        env::remove_var(var);
    }
    let cfg_dir = dir.join("cfg");
    env::set_var("BLUEKEY_CONFIG_DIR", &cfg_dir);
    env::set_var("BLUEKEY_DATA_DIR", dir.join("data"));
    cfg_dir.join("config.toml")
}

fn write_config(path: &Path, content: &str) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).expect("write config file");
}

#[test]
#[serial]
fn defaults_apply_without_file_or_env() {
    let td = tempdir().unwrap();
    isolate(td.path());

    let cfg = Config::create(None).unwrap();
    assert_eq!(
        cfg.vault_path,
        td.path().join("data").join("bluekey").join("vault.blk")
    );
    assert_eq!(cfg.clipboard_ttl(), Duration::from_secs(30));
    assert!(!cfg.username_is_secret);
    assert_eq!(cfg.backups, 2);
    assert!(cfg.remote_path.is_none());
    assert_eq!(cfg.network_timeout(), Duration::from_secs(10));
    assert_eq!(cfg.store_options().persist, PersistMode::Immediate);

    let worker = cfg.worker_config();
    assert_eq!(worker.interval, Some(Duration::from_secs(300)));
    assert_eq!(worker.retries, 3);
    assert_eq!(worker.backoff, Duration::from_millis(500));
}

#[test]
#[serial]
fn vault_path_precedence_cli_over_env_and_file() {
    let td = tempdir().unwrap();
    let cfg_file = isolate(td.path());
    write_config(&cfg_file, "vault_path = \"/tmp/cfg_vault.blk\"\n");

    assert_eq!(
        Config::create(None).unwrap().vault_path,
        PathBuf::from("/tmp/cfg_vault.blk")
    );

    env::set_var("BLUEKEY_VAULT_PATH", "/tmp/env_vault.blk");
    assert_eq!(
        Config::create(None).unwrap().vault_path,
        PathBuf::from("/tmp/env_vault.blk")
    );

    let cli_path = PathBuf::from("/tmp/cli_vault.blk");
    assert_eq!(Config::create(Some(cli_path.clone())).unwrap().vault_path, cli_path);
    env::remove_var("BLUEKEY_VAULT_PATH");
}

#[test]
#[serial]
fn env_overrides_file_values() {
    let td = tempdir().unwrap();
    let cfg_file = isolate(td.path());
    write_config(
        &cfg_file,
        "clipboard_ttl = 12\nsync_retries = 7\nremote_path = \"/srv/remote.blk\"\nsave_batch = 4\n",
    );

    let from_file = Config::create(None).unwrap();
    assert_eq!(from_file.clipboard_ttl, 12);
    assert_eq!(from_file.sync_retries, 7);
    assert_eq!(from_file.remote_path, Some(PathBuf::from("/srv/remote.blk")));
    assert_eq!(from_file.store_options().persist, PersistMode::Batched(4));

    env::set_var("BLUEKEY_CLIP_TTL", "5");
    env::set_var("BLUEKEY_SYNC_RETRIES", "not-a-number");
    env::set_var("BLUEKEY_REMOTE_PATH", "");
    let cfg = Config::create(None).unwrap();
    assert_eq!(cfg.clipboard_ttl, 5);
    // Unparseable env values fall back to the file.
    assert_eq!(cfg.sync_retries, 7);
    // An empty remote path disables sync.
    assert!(cfg.remote_path.is_none());

    for var in VARS {
        env::remove_var(var);
    }
}

#[test]
#[serial]
fn zero_interval_disables_periodic_sync() {
    let td = tempdir().unwrap();
    let cfg_file = isolate(td.path());
    write_config(&cfg_file, "sync_interval_secs = 0\n");
    assert_eq!(Config::create(None).unwrap().worker_config().interval, None);
}

#[test]
#[serial]
fn malformed_file_is_reported() {
    let td = tempdir().unwrap();
    let cfg_file = isolate(td.path());
    write_config(&cfg_file, "clipboard_ttl = \"soon\"\n");

    match Config::create(None) {
        Err(ConfigError::Malformed { path, .. }) => assert_eq!(path, cfg_file),
        other => panic!("expected malformed config, got {other:?}"),
    }
}

#[test]
#[serial]
fn invalid_values_are_rejected() {
    let td = tempdir().unwrap();
    isolate(td.path());

    env::set_var("BLUEKEY_KDF_T_COST", "0");
    assert!(matches!(
        Config::create(None),
        Err(ConfigError::InvalidValue { key: "kdf", .. })
    ));
    env::remove_var("BLUEKEY_KDF_T_COST");

    env::set_var("BLUEKEY_NETWORK_TIMEOUT", "0");
    assert!(matches!(
        Config::create(None),
        Err(ConfigError::InvalidValue {
            key: "network_timeout_secs",
            ..
        })
    ));
    env::remove_var("BLUEKEY_NETWORK_TIMEOUT");
}

#[test]
fn file_config_round_trips_and_missing_file_is_empty() {
    let td = tempdir().unwrap();
    let path = td.path().join("nested").join("config.toml");
    assert_eq!(load_file_config(&path).unwrap(), FileConfig::default());

    let cfg = FileConfig {
        vault_path: Some("/tmp/v.blk".into()),
        clipboard_ttl: Some(9),
        username_is_secret: Some(true),
        kdf_m_cost_kib: Some(1024),
        ..FileConfig::default()
    };
    save_file_config(&path, &cfg).unwrap();
    assert_eq!(load_file_config(&path).unwrap(), cfg);
}
