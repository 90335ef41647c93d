//! End-to-end runs of the bundled migrations against a temporary EasyEngine
//! root, with docker replaced by a recording fake.

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use ee_migrate::migrations::{self, nginx_security_conf, php_config_volume};
use ee_migrate::{
    ContainerRuntime, JsonHistoryStore, JsonSiteStore, MigrationError, MigrationHistory,
    MigrationOutcome, MigrationRunner, RollbackOutcome, Site, SiteType, fsops,
};
use tempfile::TempDir;

const OLD_COMPOSE: &str = "version: '3.5'\nservices: {}\n";
const OLD_CONF: &str = "server {\n    listen 80;\n}\n";

#[derive(Default)]
struct RecordingRuntime {
    calls: Mutex<Vec<String>>,
    volumes: Mutex<HashSet<String>>,
    fail: Option<String>,
}

impl RecordingRuntime {
    fn failing_on(call: &str) -> Self {
        Self {
            fail: Some(call.to_string()),
            ..Default::default()
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn volumes(&self) -> HashSet<String> {
        self.volumes.lock().unwrap().clone()
    }

    /// Log `call` with what it saw on disk; `fail` matches the bare call
    fn record(&self, call: String, seen: Option<String>) -> Result<()> {
        let entry = match seen {
            Some(seen) => format!("{} {}", call, seen),
            None => call.clone(),
        };
        self.calls.lock().unwrap().push(entry);
        anyhow::ensure!(self.fail.as_deref() != Some(call.as_str()), "{} failed", call);
        Ok(())
    }
}

fn read_or_empty(path: &Path) -> String {
    fs::read_to_string(path).unwrap_or_default()
}

impl ContainerRuntime for RecordingRuntime {
    fn volume_exists(&self, name: &str) -> Result<bool> {
        Ok(self.volumes.lock().unwrap().contains(name))
    }

    fn create_volume(&self, name: &str) -> Result<()> {
        self.record(format!("create {}", name), None)?;
        self.volumes.lock().unwrap().insert(name.to_string());
        Ok(())
    }

    fn remove_volume(&self, name: &str) -> Result<()> {
        self.record(format!("remove {}", name), None)?;
        self.volumes.lock().unwrap().remove(name);
        Ok(())
    }

    fn restart_site(&self, site: &Site) -> Result<()> {
        let compose = read_or_empty(&site.compose_file());
        let mounts = compose.contains(php_config_volume::PHP_CONF_VOLUME);
        self.record(format!("restart {}", site.url), Some(format!("mounts_volume={}", mounts)))
    }

    fn reload_nginx(&self, site: &Site) -> Result<()> {
        let conf = read_or_empty(&nginx_security_conf::conf_path(site));
        let headers = conf.contains("add_header X-Frame-Options");
        self.record(format!("reload {}", site.url), Some(format!("headers={}", headers)))
    }
}

/// Temporary EasyEngine root with an upgraded-install history
struct Host {
    root: TempDir,
    sites: Vec<Site>,
}

impl Host {
    /// A WordPress site and a static site
    fn new() -> Self {
        Self::with_sites(&[("blog.test", SiteType::Wp), ("static.test", SiteType::Html)])
    }

    fn with_sites(sites: &[(&str, SiteType)]) -> Self {
        let root = TempDir::new().unwrap();
        let sites: Vec<Site> = sites
            .iter()
            .copied()
            .map(|(url, site_type)| Site {
                url: url.to_string(),
                site_type,
                fs_path: root.path().join("sites").join(url),
                enabled: true,
                php_version: None,
                ssl: false,
            })
            .collect();

        for site in &sites {
            fsops::write_file(&site.compose_file(), OLD_COMPOSE).unwrap();
            fsops::write_file(&nginx_security_conf::conf_path(site), OLD_CONF).unwrap();
        }
        fsops::write_file(
            &root.path().join("db").join("sites.json"),
            &serde_json::to_string_pretty(&sites).unwrap(),
        )
        .unwrap();

        let host = Self { root, sites };
        let mut history = host.history();
        history
            .record_migration_applied("20180101000000", "initial_setup")
            .unwrap();
        host
    }

    fn history(&self) -> JsonHistoryStore {
        JsonHistoryStore::open(self.root.path().join("db").join("migrations.json")).unwrap()
    }

    fn runner(
        &self,
        runtime: Arc<RecordingRuntime>,
    ) -> MigrationRunner<JsonHistoryStore, JsonSiteStore> {
        MigrationRunner::new(
            self.history(),
            JsonSiteStore::new(self.root.path().join("db").join("sites.json")),
            self.root.path(),
        )
        .with_migrations(migrations::builtin(runtime))
        .unwrap()
    }

    fn site(&self, url: &str) -> &Site {
        self.sites.iter().find(|s| s.url == url).unwrap()
    }
}

fn read(path: &Path) -> String {
    fs::read_to_string(path).unwrap()
}

#[test]
fn test_fresh_install_records_everything_as_skipped() {
    let root = TempDir::new().unwrap();
    let runtime = Arc::new(RecordingRuntime::default());
    let mut runner = MigrationRunner::new(
        JsonHistoryStore::open(root.path().join("db").join("migrations.json")).unwrap(),
        JsonSiteStore::new(root.path().join("db").join("sites.json")),
        root.path(),
    )
    .with_migrations(migrations::builtin(runtime.clone()))
    .unwrap();

    let summary = runner.run_pending().unwrap();
    assert!(summary.applied.is_empty());
    assert_eq!(summary.skipped.len(), 2);
    assert!(runtime.calls().is_empty());

    // History survives a reopen
    let history = JsonHistoryStore::open(root.path().join("db").join("migrations.json")).unwrap();
    assert!(history.is_applied(php_config_volume::VERSION).unwrap());
    assert!(history.is_applied(nginx_security_conf::VERSION).unwrap());
}

#[test]
fn test_upgrade_applies_both_migrations() {
    let host = Host::new();
    let runtime = Arc::new(RecordingRuntime::default());
    let mut runner = host.runner(runtime.clone());

    let summary = runner.run_pending().unwrap();
    assert_eq!(summary.applied.len(), 2);

    let blog = host.site("blog.test");
    let compose = read(&blog.compose_file());
    assert!(compose.contains("- blogtest_config_php:/usr/local/etc"));
    assert_eq!(read(&fsops::backup_path(&blog.compose_file())), OLD_COMPOSE);
    assert_eq!(read(&host.site("static.test").compose_file()), OLD_COMPOSE);

    for site in &host.sites {
        let conf = read(&nginx_security_conf::conf_path(site));
        assert!(conf.contains("add_header X-Frame-Options"));
    }

    assert_eq!(
        runtime.calls(),
        vec![
            "create blogtest_config_php",
            "restart blog.test mounts_volume=true",
            "reload blog.test headers=true",
            "reload static.test headers=true",
        ]
    );

    let history = host.history();
    let versions: Vec<String> =
        history.applied().unwrap().into_iter().map(|r| r.version).collect();
    assert_eq!(
        versions,
        vec!["20180101000000", php_config_volume::VERSION, nginx_security_conf::VERSION]
    );
}

#[test]
fn test_failed_restart_rolls_back_and_halts() {
    let host = Host::new();
    let runtime = Arc::new(RecordingRuntime::failing_on("restart blog.test"));
    let mut runner = host.runner(runtime.clone());

    let err = runner.run_pending().unwrap_err();
    match &err {
        MigrationError::RolledBack { id, rollback, .. } => {
            assert_eq!(id.version, php_config_volume::VERSION);
            let rollback = rollback.as_ref().unwrap();
            assert_eq!(
                rollback.undone(),
                vec![
                    "write-compose-blog.test",
                    "create-php-conf-volume-blog.test",
                    "backup-compose-blog.test",
                ]
            );
            assert_eq!(
                rollback.outcome_of("restart-blog.test"),
                Some(&RollbackOutcome::NeverRan)
            );
        }
        other => panic!("unexpected error: {}", other),
    }

    assert_eq!(read(&host.site("blog.test").compose_file()), OLD_COMPOSE);
    assert!(runtime.volumes().is_empty());
    assert_eq!(
        runtime.calls(),
        vec![
            "create blogtest_config_php",
            "restart blog.test mounts_volume=true",
            "remove blogtest_config_php",
        ]
    );

    // Nothing after the failing migration ran or was recorded
    for site in &host.sites {
        assert_eq!(read(&nginx_security_conf::conf_path(site)), OLD_CONF);
    }
    let pending: Vec<String> =
        runner.pending().unwrap().into_iter().map(|id| id.version).collect();
    assert_eq!(
        pending,
        vec![php_config_volume::VERSION, nginx_security_conf::VERSION]
    );
}

#[test]
fn test_rollback_restarts_earlier_sites_on_restored_compose() {
    let host = Host::with_sites(&[("a.test", SiteType::Wp), ("b.test", SiteType::Php)]);
    let runtime = Arc::new(RecordingRuntime::failing_on("restart b.test"));
    let mut runner = host.runner(runtime.clone());

    let err = runner.run_pending().unwrap_err();
    let rollback = match err {
        MigrationError::RolledBack { rollback: Some(rollback), .. } => rollback,
        other => panic!("unexpected error: {}", other),
    };
    assert_eq!(
        rollback.undone(),
        vec![
            "write-compose-b.test",
            "create-php-conf-volume-b.test",
            "backup-compose-b.test",
            "restart-a.test",
            "write-compose-a.test",
            "create-php-conf-volume-a.test",
            "backup-compose-a.test",
        ]
    );

    // a.test comes back up on its old compose file before its volume goes away
    assert_eq!(
        runtime.calls(),
        vec![
            "create atest_config_php",
            "restart a.test mounts_volume=true",
            "create btest_config_php",
            "restart b.test mounts_volume=true",
            "remove btest_config_php",
            "restart a.test mounts_volume=false",
            "remove atest_config_php",
        ]
    );
    for site in &host.sites {
        assert_eq!(read(&site.compose_file()), OLD_COMPOSE);
    }
    assert!(runtime.volumes().is_empty());
}

#[test]
fn test_rollback_reloads_earlier_sites_on_restored_conf() {
    let host = Host::new();
    let runtime = Arc::new(RecordingRuntime::failing_on("reload static.test"));
    let mut runner = host.runner(runtime.clone());

    match runner.run_pending().unwrap_err() {
        MigrationError::RolledBack { id, .. } => {
            assert_eq!(id.version, nginx_security_conf::VERSION)
        }
        other => panic!("unexpected error: {}", other),
    }

    assert_eq!(
        runtime.calls(),
        vec![
            "create blogtest_config_php",
            "restart blog.test mounts_volume=true",
            "reload blog.test headers=true",
            "reload static.test headers=true",
            "reload blog.test headers=false",
        ]
    );
    for site in &host.sites {
        assert_eq!(read(&nginx_security_conf::conf_path(site)), OLD_CONF);
    }

    // The PHP migration before it stays applied
    let history = host.history();
    assert!(history.is_applied(php_config_volume::VERSION).unwrap());
    assert!(!history.is_applied(nginx_security_conf::VERSION).unwrap());
}

#[test]
fn test_revert_nginx_conf_and_reject_irreversible() {
    let host = Host::new();
    let runtime = Arc::new(RecordingRuntime::default());
    let mut runner = host.runner(runtime.clone());
    runner.run_pending().unwrap();

    let plan = runner.plan_revert(nginx_security_conf::VERSION).unwrap();
    assert_eq!(plan.steps.len(), 4);

    assert_eq!(
        runner.revert(nginx_security_conf::VERSION).unwrap(),
        MigrationOutcome::Reverted { steps: 4 }
    );
    for site in &host.sites {
        assert_eq!(read(&nginx_security_conf::conf_path(site)), OLD_CONF);
    }
    assert!(!host.history().is_applied(nginx_security_conf::VERSION).unwrap());

    assert!(matches!(
        runner.revert(php_config_volume::VERSION),
        Err(MigrationError::DownUnsupported { .. })
    ));
    assert!(host.history().is_applied(php_config_volume::VERSION).unwrap());
}

#[test]
fn test_plan_lists_steps_without_running_them() {
    let host = Host::new();
    let runtime = Arc::new(RecordingRuntime::default());
    let runner = host.runner(runtime.clone());

    let plans = runner.plan(None).unwrap();
    assert_eq!(plans.len(), 2);

    let php: Vec<&str> = plans[0].steps.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(
        php,
        vec![
            "backup-compose-blog.test",
            "create-php-conf-volume-blog.test",
            "write-compose-blog.test",
            "restart-blog.test",
        ]
    );
    let nginx: Vec<&str> = plans[1].steps.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(nginx.len(), 6);
    assert_eq!(nginx[2], "reload-nginx-blog.test");
    assert!(plans.iter().flat_map(|p| &p.steps).all(|s| s.reversible));

    assert!(runtime.calls().is_empty());
    assert_eq!(read(&host.site("blog.test").compose_file()), OLD_COMPOSE);
    assert_eq!(runner.pending().unwrap().len(), 2);
}
