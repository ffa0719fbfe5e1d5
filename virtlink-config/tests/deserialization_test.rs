// Copyright 2024 The Virtlink Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use pretty_assertions::assert_eq;
use virtlink_config::agent::{DriverKind, InstanceConfig};
use virtlink_config::resources::{BackingConfig, PoolConfig, PoolSpec, PoolType, ResourceType};
use virtlink_config::serde_utils::parse_data_size;

#[test]
fn directory_pool_config_test() {
    let config: PoolConfig = serde_json::from_str(
        r#"{"meta": {"uuid": "p1"}, "spec": {"path": "/data/pool1"}}"#,
    )
    .unwrap();
    assert_eq!(config.meta.uuid, "p1");
    assert_eq!(config.spec.pool_type(), PoolType::Filesystem);
    let PoolSpec::Directory(spec) = config.spec else {
        panic!("expected directory spec");
    };
    assert_eq!(spec.path, "/data/pool1");
}

#[test]
fn nfs_pool_config_test() {
    let config: PoolConfig = serde_json::from_str(
        r#"{
            "meta": {"uuid": "p2"},
            "spec": {
                "server": "nfs.example.com",
                "export": "/exports/vms",
                "mount_point": "/mnt/vms",
                "options": ["rw", "soft"]
            }
        }"#,
    )
    .unwrap();
    assert_eq!(config.spec.pool_type(), PoolType::Nfs);
    let PoolSpec::Nfs(spec) = config.spec else {
        panic!("expected nfs spec");
    };
    assert_eq!(spec.mount_source(), "nfs.example.com:/exports/vms");
    assert_eq!(spec.options, vec!["rw".to_string(), "soft".to_string()]);
}

#[test]
fn backing_config_with_suffixed_size_test() {
    let config: BackingConfig = serde_json::from_str(
        r#"{
            "meta": {"pool": "p1", "uuid": "r1"},
            "spec": {"filename": "vol1.img", "size": "10M"}
        }"#,
    )
    .unwrap();
    assert_eq!(config.meta.pool, "p1");
    assert_eq!(config.meta.uuid, "r1");
    assert!(!config.meta.allocated);
    assert_eq!(config.meta.resource_type, ResourceType::Volume);
    assert_eq!(config.spec.size, 10 * 1024 * 1024);
}

#[test]
fn backing_config_with_numeric_size_test() {
    let config: BackingConfig = serde_json::from_str(
        r#"{
            "meta": {"pool": "p1", "uuid": "r2", "allocated": true, "type": "volume"},
            "spec": {"filename": "vol2.img", "size": 4096}
        }"#,
    )
    .unwrap();
    assert!(config.meta.allocated);
    assert_eq!(config.spec.size, 4096);
}

#[test]
fn parse_data_size_suffixes_test() {
    assert_eq!(parse_data_size("512").unwrap(), 512);
    assert_eq!(parse_data_size("4k").unwrap(), 4096);
    assert_eq!(parse_data_size("10M").unwrap(), 10 * 1024 * 1024);
    assert_eq!(parse_data_size("1G").unwrap(), 1024 * 1024 * 1024);
    assert!(parse_data_size("").is_err());
    assert!(parse_data_size("tenM").is_err());
}

#[test]
fn unknown_pool_spec_shape_is_rejected_test() {
    let result: Result<PoolConfig, _> = serde_json::from_str(
        r#"{"meta": {"uuid": "p1"}, "spec": {"bucket": "s3://nope"}}"#,
    );
    assert!(result.is_err());
}

#[test]
fn instance_config_test() {
    let config: InstanceConfig = serde_json::from_str(
        r#"{"driver": "qemu", "spec": {"cmdline": "qemu-system-x86_64 -m 512"}}"#,
    )
    .unwrap();
    assert_eq!(config.driver, DriverKind::Qemu);
    assert_eq!(config.spec["cmdline"], "qemu-system-x86_64 -m 512");
}

#[test]
fn instance_config_defaults_spec_test() {
    let config: InstanceConfig = serde_json::from_str(r#"{"driver": "libvirt"}"#).unwrap();
    assert_eq!(config.driver, DriverKind::Libvirt);
    assert!(config.spec.is_null());
}
