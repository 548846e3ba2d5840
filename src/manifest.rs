//! Editing of the etcd static-pod manifest.
//!
//! The manifest is handled as an opaque YAML document with one addressable
//! point: the launch argument list of the container named `etcd`. Everything
//! else round-trips untouched.

use serde_yaml::Value;

use crate::errors::{RecoveryError, Result};

const ETCD_CONTAINER_NAME: &str = "etcd";
const FORCE_NEW_CLUSTER_FLAG: &str = "--force-new-cluster";
const INITIAL_CLUSTER_PREFIX: &str = "--initial-cluster";

pub fn parse(manifest: &str) -> Result<Value> {
    serde_yaml::from_str(manifest)
        .map_err(|error| RecoveryError::Protocol(format!("failed to parse manifest: {error}")))
}

pub fn serialize(doc: &Value) -> Result<String> {
    serde_yaml::to_string(doc)
        .map_err(|error| RecoveryError::Protocol(format!("failed to serialize manifest: {error}")))
}

/// Removes every `--force-new-cluster` argument from the etcd container and,
/// when `add` is set, appends a single one. Returns whether the argument
/// multiset changed (order-insensitive comparison).
pub fn toggle_force_new_cluster(doc: &mut Value, add: bool) -> Result<bool> {
    let args = etcd_command_args(doc)?;

    let mut new_args: Vec<Value> = args
        .iter()
        .filter(|arg| {
            !arg.as_str()
                .is_some_and(|value| value.starts_with(FORCE_NEW_CLUSTER_FLAG))
        })
        .cloned()
        .collect();
    if add {
        new_args.push(Value::String(FORCE_NEW_CLUSTER_FLAG.to_string()));
    }

    let changed = !multiset_equal(args, &new_args);
    *args = new_args;

    Ok(changed)
}

/// Removes every `--initial-cluster*` argument from the etcd container and
/// appends `--initial-cluster=<value>` / `--initial-cluster-state=<value>`
/// for the non-empty inputs.
pub fn rewrite_initial_cluster(
    doc: &mut Value,
    initial_cluster: &str,
    initial_cluster_state: &str,
) -> Result<()> {
    let args = etcd_command_args(doc)?;

    args.retain(|arg| {
        !arg.as_str()
            .is_some_and(|value| value.starts_with(INITIAL_CLUSTER_PREFIX))
    });
    if !initial_cluster.is_empty() {
        args.push(Value::String(format!("--initial-cluster={initial_cluster}")));
    }
    if !initial_cluster_state.is_empty() {
        args.push(Value::String(format!(
            "--initial-cluster-state={initial_cluster_state}"
        )));
    }

    Ok(())
}

fn etcd_command_args(doc: &mut Value) -> Result<&mut Vec<Value>> {
    let containers = doc
        .get_mut("spec")
        .and_then(|spec| spec.get_mut("containers"))
        .and_then(Value::as_sequence_mut)
        .ok_or_else(|| {
            RecoveryError::Protocol("manifest has no spec.containers list".to_string())
        })?;

    for container in containers {
        let name = container
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim();
        if name != ETCD_CONTAINER_NAME {
            continue;
        }
        return container
            .get_mut("command")
            .and_then(Value::as_sequence_mut)
            .ok_or_else(|| {
                RecoveryError::Protocol("etcd container has no command list".to_string())
            });
    }

    Err(RecoveryError::Protocol(format!(
        "failed to find container name: {ETCD_CONTAINER_NAME}"
    )))
}

fn multiset_equal(a: &[Value], b: &[Value]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let sort_key = |value: &Value| serde_yaml::to_string(value).unwrap_or_default();
    let mut keys_a: Vec<String> = a.iter().map(sort_key).collect();
    let mut keys_b: Vec<String> = b.iter().map(sort_key).collect();
    keys_a.sort();
    keys_b.sort();
    keys_a == keys_b
}
