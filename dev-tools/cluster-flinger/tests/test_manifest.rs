// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Loading deployment manifests from disk

use camino::Utf8PathBuf;
use cluster_flinger::config::{Config, ConfigError};
use cluster_flinger::host::Role;
use cluster_flinger::role::Operation;
use std::time::Duration;

fn example_manifest() -> Utf8PathBuf {
    Utf8PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("deploy-example.toml")
}

#[test]
fn example_manifest_is_valid() {
    let config = Config::from_file(&example_manifest()).unwrap();

    let cluster = config.cluster().unwrap();
    assert_eq!(cluster.bootstrap().name, "n1");
    assert_eq!(cluster.bootstrap().role, Role::Bootstrap);
    assert_eq!(cluster.bootstrap().addr, "10.0.3.11");
    let names: Vec<_> = cluster.hosts().map(|h| h.name.as_str()).collect();
    assert_eq!(names, ["n1", "n2", "n3", "n4", "n5"]);
    let n2 = cluster.get("n2").unwrap();
    assert_eq!(n2.username.as_deref(), Some("ubuntu"));
    assert_eq!(cluster.get("n3").unwrap().addr, "n3");

    assert_eq!(config.service.port, 9090);
    assert_eq!(
        config.service.data_dir_path(),
        "/opt/Rachis/TailFeather/bin/Debug/db"
    );
    assert_eq!(config.admin.join_path, "/tailfeather/admin/fly-with-us");
    assert_eq!(config.pacing.join_delay(), Duration::from_secs(3));

    // Every provisioning task has work to do with this manifest.
    for task in Operation::Provision.tasks() {
        assert!(
            task.steps(&config).is_some_and(|steps| !steps.is_empty()),
            "no steps for {task}"
        );
    }
}

#[test]
fn unreadable_manifest() {
    let dir = camino_tempfile::tempdir().unwrap();
    let path = dir.path().join("missing.toml");
    let err = Config::from_file(&path).unwrap_err();
    assert!(
        matches!(err, ConfigError::Io { path: ref p, .. } if *p == path),
        "{err}"
    );
}

#[test]
fn invalid_manifest_on_disk() {
    let dir = camino_tempfile::tempdir().unwrap();
    let path = dir.path().join("deploy.toml");
    let contents = std::fs::read_to_string(example_manifest())
        .unwrap()
        .replace(
            r#"followers = ["n2", "n3", "n4", "n5"]"#,
            r#"followers = ["n2", "n2"]"#,
        );
    std::fs::write(&path, contents).unwrap();

    let err = Config::from_file(&path).unwrap_err();
    assert!(
        matches!(err, ConfigError::DuplicateFollower(ref name) if name == "n2"),
        "{err}"
    );
}
