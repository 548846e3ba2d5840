//! Shared remote-command templates and path helpers.

/// Static-pod manifest path watched by the kubelet on every control-plane
/// host. Writing this file is how etcd gets (re)started.
pub const MANIFEST_PATH: &str = "/etc/kubernetes/manifests/etcd.yaml";

/// Returns the short ID of the running etcd container, or nothing.
pub const CRICTL_PS_ETCD_COMMAND: &str =
    "sudo crictl ps --label io.kubernetes.container.name=etcd -q | head -n 1";

/// Root of the etcd data on disk; the commit-index prober reads it.
pub const ETCD_DATA_ROOT: &str = "/var/lib/etcd";

/// The etcd member directory that must be wiped before a node can rejoin an
/// existing cluster as a learner.
pub const ETCD_DATA_DIR: &str = "/var/lib/etcd/member";

pub const ETCD_ENDPOINT: &str = "https://127.0.0.1:2379";
pub const ETCD_CLIENT_CERT: &str = "/etc/kubernetes/pki/etcd/healthcheck-client.crt";
pub const ETCD_CLIENT_KEY: &str = "/etc/kubernetes/pki/etcd/healthcheck-client.key";
pub const ETCD_CA_CERT: &str = "/etc/kubernetes/pki/etcd/ca.crt";

/// Local sidecar binary uploaded on demand by the `select` command.
pub const DIAGNOSIS_LOCAL_PATH: &str = "./etcd-diagnosis";

/// Builds an etcdctl invocation that runs inside the etcd container via
/// crictl, authenticated with the node-local healthcheck client certificates.
pub fn etcdctl_command(container_id: &str, args: &[&str]) -> String {
    format!(
        "sudo crictl exec {} etcdctl --endpoints={} --cert {} --key {} --cacert {} {}",
        container_id.trim(),
        ETCD_ENDPOINT,
        ETCD_CLIENT_CERT,
        ETCD_CLIENT_KEY,
        ETCD_CA_CERT,
        args.join(" ")
    )
}

/// Remote path of the etcd-diagnosis binary for the given connection user.
pub fn diagnosis_binary_path(username: &str) -> String {
    if username == "root" {
        "/root/etcd-diagnosis".to_string()
    } else {
        format!("/home/{username}/etcd-diagnosis")
    }
}
