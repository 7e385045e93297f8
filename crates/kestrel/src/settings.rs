//! k3s settings fragments.
//!
//! A fragment is the content of `/etc/rancher/k3s/config.yaml` for one role.
//! Fragments come from two places: the cluster-wide `cluster.server` /
//! `cluster.agent` sections and the per-node `server` / `agent` overrides.
//! The effective configuration of a node is `cluster.merge(&node)`.
//!
//! Merging is field by field. Sequence fields are concatenated (base first,
//! no dedup). Scalar fields take the overlay value unless it is the zero
//! value, so an absent override never erases a configured base value.
//!
//! The field list of each fragment is written exactly once, inside
//! `settings_fragment!`, which derives both the serde mapping and the
//! merge routine from it.

use serde::{Deserialize, Serialize};

/// Combination of two fragments of the same shape.
pub trait Merge {
    /// Overlay `overlay` onto `self`, returning the effective fragment.
    #[must_use]
    fn merge(&self, overlay: &Self) -> Self;
}

/// Per-field merge behaviour.
pub trait MergeField {
    /// Combine `other` into `self`.
    fn merge_field(&mut self, other: &Self);

    /// Whether the value is the zero value (omitted when serializing).
    fn is_zero(&self) -> bool;
}

impl MergeField for String {
    fn merge_field(&mut self, other: &Self) {
        if !other.is_empty() {
            self.clone_from(other);
        }
    }

    fn is_zero(&self) -> bool {
        self.is_empty()
    }
}

impl MergeField for bool {
    fn merge_field(&mut self, other: &Self) {
        if *other {
            *self = true;
        }
    }

    fn is_zero(&self) -> bool {
        !*self
    }
}

macro_rules! impl_merge_field_int {
    ($($ty:ty),*) => {
        $(
            impl MergeField for $ty {
                fn merge_field(&mut self, other: &Self) {
                    if *other != 0 {
                        *self = *other;
                    }
                }

                fn is_zero(&self) -> bool {
                    *self == 0
                }
            }
        )*
    };
}

impl_merge_field_int!(u16, u32);

impl<T: Clone> MergeField for Vec<T> {
    fn merge_field(&mut self, other: &Self) {
        self.extend(other.iter().cloned());
    }

    fn is_zero(&self) -> bool {
        self.is_empty()
    }
}

fn is_zero<T: MergeField>(value: &T) -> bool {
    value.is_zero()
}

/// Declare a settings fragment: a serde struct with kebab-case keys whose
/// zero-valued fields are omitted, plus its [`Merge`] implementation.
macro_rules! settings_fragment {
    (
        $(#[$meta:meta])*
        pub struct $name:ident {
            $(
                $(#[$field_meta:meta])*
                $field:ident: $ty:ty,
            )*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
        #[serde(rename_all = "kebab-case")]
        #[allow(clippy::struct_excessive_bools)]
        pub struct $name {
            $(
                $(#[$field_meta])*
                #[serde(default, skip_serializing_if = "is_zero")]
                pub $field: $ty,
            )*
        }

        impl Merge for $name {
            fn merge(&self, overlay: &Self) -> Self {
                let mut merged = self.clone();
                $( merged.$field.merge_field(&overlay.$field); )*
                merged
            }
        }
    };
}

settings_fragment! {
    /// Configuration of a k3s server (control-plane node).
    ///
    /// Cluster formation flags such as `--cluster-init` and all token
    /// options are absent: the engine manages them.
    /// See <https://docs.k3s.io/cli/server>.
    pub struct ServerSettings {
        v: u32,
        vmodule: String,
        log: String,
        also_log_to_stderr: bool,
        bind_address: String,
        https_listen_port: u16,
        advertise_address: String,
        advertise_port: u16,
        tls_san: Vec<String>,
        data_dir: String,
        cluster_cidr: Vec<String>,
        service_cidr: Vec<String>,
        service_node_port_range: String,
        cluster_dns: Vec<String>,
        cluster_domain: String,
        flannel_backend: String,
        write_kubeconfig: String,
        write_kubeconfig_mode: String,
        etcd_arg: Vec<String>,
        kube_apiserver_arg: Vec<String>,
        kube_scheduler_arg: Vec<String>,
        kube_controller_manager_arg: Vec<String>,
        kube_cloud_controller_manager_arg: Vec<String>,
        datastore_endpoint: String,
        datastore_cafile: String,
        datastore_certfile: String,
        datastore_keyfile: String,
        etcd_expose_metrics: bool,
        etcd_disable_snapshots: bool,
        etcd_snapshot_name: String,
        etcd_snapshot_schedule_cron: String,
        etcd_snapshot_retention: u32,
        etcd_snapshot_dir: String,
        etcd_s3: bool,
        etcd_s3_endpoint: String,
        etcd_s3_endpoint_ca: String,
        etcd_s3_skip_ssl_verify: bool,
        etcd_s3_access_key: String,
        etcd_s3_secret_key: String,
        etcd_s3_bucket: String,
        etcd_s3_region: String,
        etcd_s3_folder: String,
        default_local_storage_path: String,
        disable: Vec<String>,
        disable_scheduler: bool,
        disable_cloud_controller: bool,
        disable_kube_proxy: bool,
        disable_network_policy: bool,
        node_name: String,
        with_node_id: bool,
        node_label: Vec<String>,
        node_taint: Vec<String>,
        image_credential_provider_bin_dir: String,
        image_credential_provider_config: String,
        docker: bool,
        container_runtime_endpoint: String,
        pause_image: String,
        snapshotter: String,
        private_registry: String,
        node_ip: Vec<String>,
        node_external_ip: Vec<String>,
        resolv_conf: String,
        kubelet_arg: Vec<String>,
        kube_proxy_arg: Vec<String>,
        protect_kernel_defaults: bool,
        rootless: bool,
        cluster_reset_restore_path: String,
        secrets_encryption: bool,
        system_default_registry: String,
        selinux: bool,
        lb_server_port: u16,
    }
}

settings_fragment! {
    /// Configuration of a k3s agent (worker node).
    ///
    /// The server URL and token are supplied by the engine at install time.
    /// See <https://docs.k3s.io/cli/agent>.
    pub struct AgentSettings {
        debug: bool,
        v: u32,
        vmodule: String,
        log: String,
        also_log_to_stderr: bool,
        data_dir: String,
        node_name: String,
        with_node_id: bool,
        node_label: Vec<String>,
        node_taint: Vec<String>,
        image_credential_provider_bin_dir: String,
        image_credential_provider_config: String,
        docker: bool,
        container_runtime_endpoint: String,
        pause_image: String,
        snapshotter: String,
        private_registry: String,
        node_ip: Vec<String>,
        node_external_ip: Vec<String>,
        resolv_conf: String,
        flannel_iface: String,
        flannel_conf: String,
        kubelet_arg: Vec<String>,
        kube_proxy_arg: Vec<String>,
        protect_kernel_defaults: bool,
        rootless: bool,
        selinux: bool,
        lb_server_port: u16,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(values: &[&str]) -> Vec<String> {
        values.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_merge_with_empty_override_keeps_base() {
        let base = ServerSettings {
            advertise_address: "10.0.0.1".into(),
            https_listen_port: 7443,
            write_kubeconfig_mode: "0644".into(),
            disable: labels(&["traefik"]),
            secrets_encryption: true,
            ..Default::default()
        };

        assert_eq!(base.merge(&ServerSettings::default()), base);
    }

    #[test]
    fn test_merge_scalars_take_non_zero_override() {
        let base = ServerSettings {
            advertise_address: "10.0.0.1".into(),
            https_listen_port: 7443,
            cluster_domain: "cluster.local".into(),
            ..Default::default()
        };
        let overlay = ServerSettings {
            advertise_address: "192.168.1.10".into(),
            https_listen_port: 8443,
            selinux: true,
            ..Default::default()
        };

        let merged = base.merge(&overlay);
        assert_eq!(merged.advertise_address, "192.168.1.10");
        assert_eq!(merged.https_listen_port, 8443);
        assert!(merged.selinux);
        assert_eq!(merged.cluster_domain, "cluster.local");
    }

    #[test]
    fn test_merge_full_override_wins_on_scalars() {
        let base = AgentSettings {
            node_name: "a".into(),
            v: 1,
            lb_server_port: 1000,
            ..Default::default()
        };
        let overlay = AgentSettings {
            node_name: "b".into(),
            v: 4,
            lb_server_port: 6444,
            debug: true,
            ..Default::default()
        };

        let merged = base.merge(&overlay);
        assert_eq!(merged.node_name, overlay.node_name);
        assert_eq!(merged.v, overlay.v);
        assert_eq!(merged.lb_server_port, overlay.lb_server_port);
        assert_eq!(merged.debug, overlay.debug);
    }

    #[test]
    fn test_merge_concatenates_sequences_without_dedup() {
        let base = AgentSettings {
            node_label: labels(&["a", "b"]),
            ..Default::default()
        };
        let overlay = AgentSettings {
            node_label: labels(&["c", "a"]),
            ..Default::default()
        };

        assert_eq!(base.merge(&overlay).node_label, labels(&["a", "b", "c", "a"]));
    }

    #[test]
    fn test_serialization_uses_k3s_keys_and_omits_zero_values() {
        let settings = ServerSettings {
            tls_san: labels(&["k8s.example.com"]),
            kube_apiserver_arg: labels(&["audit-log-maxage=30"]),
            etcd_s3_endpoint_ca: "/etc/ca.pem".into(),
            write_kubeconfig_mode: "0644".into(),
            ..Default::default()
        };

        let yaml = serde_yaml::to_string(&settings).unwrap();
        assert!(yaml.contains("tls-san:"));
        assert!(yaml.contains("kube-apiserver-arg:"));
        assert!(yaml.contains("etcd-s3-endpoint-ca: /etc/ca.pem"));
        assert!(!yaml.contains("disable"));
        assert!(!yaml.contains("https-listen-port"));

        let parsed: serde_yaml::Mapping = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(
            parsed.get("write-kubeconfig-mode").and_then(|v| v.as_str()),
            Some("0644")
        );
    }

    #[test]
    fn test_empty_fragment_serializes_to_empty_mapping() {
        let yaml = serde_yaml::to_string(&AgentSettings::default()).unwrap();
        assert_eq!(yaml.trim(), "{}");
    }

    #[test]
    fn test_deserialize_partial_fragment() {
        let settings: AgentSettings =
            serde_yaml::from_str("node-label:\n  - zone=a\nflannel-iface: eth1\n").unwrap();

        assert_eq!(settings.node_label, labels(&["zone=a"]));
        assert_eq!(settings.flannel_iface, "eth1");
        assert!(!settings.rootless);
    }
}
