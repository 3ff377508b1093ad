//! Builders for the objects a project's pipeline infrastructure consists of.

use std::collections::BTreeMap;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use conveyor_common::cluster::{
    ClusterRoleBinding, Container, Namespace, NetworkPolicy, NetworkPolicySpec, PodSpec, RoleBinding,
    RoleRef, Secret, SecretType, Service, ServicePort, ServiceSpec, Subject, Workload, WorkloadKind,
    WorkloadSpec,
};
use conveyor_common::{ObjectMeta, ProjectRef};
use serde_json::json;

/// Shared namespace holding the registry proxy and its port mapping.
pub const COMMON_NAMESPACE: &str = "conveyor-pipeline";
pub const NAMESPACE_SUFFIX: &str = "-pipeline";

pub const PROJECT_ID_LABEL: &str = "field.conveyor.dev/projectId";
pub const PIPELINE_NAMESPACE_LABEL: &str = "pipeline.conveyor.dev/namespace";
pub const LABEL_APP: &str = "app";
pub const LABEL_EXECUTION: &str = "execution";
pub const LABEL_RUNNER_ROLE: &str = "runner";

pub const RUNNER_NAME: &str = "runner";
pub const REGISTRY_NAME: &str = "docker-registry";
pub const OBJECT_STORE_NAME: &str = "object-store";
pub const PROXY_NAME: &str = "registry-proxy";
pub const NETWORK_POLICY_NAME: &str = "pipeline-np";

pub const PIPELINE_SECRET: &str = "pipeline-secret";
pub const API_KEY_SECRET: &str = "pipeline-api-key";
pub const REGISTRY_CA_SECRET: &str = "registry-ca";
pub const REGISTRY_CRT_SECRET: &str = "registry-crt";
pub const DOCKER_CREDENTIAL: &str = "pipeline-docker-registry";

pub const SECRET_TOKEN_KEY: &str = "pipeline-secret-token";
pub const SECRET_USER_KEY: &str = "pipeline-secret-user";
pub const SECRET_REGISTRY_TOKEN_KEY: &str = "pipeline-secret-registry-token";
pub const SECRET_API_TOKEN_KEY: &str = "pipeline-api-token";
pub const DEFAULT_USER: &str = "admin";
pub const DEFAULT_TOKEN: &str = "pipeline";

pub const RUNNER_PORT: u16 = 8080;
pub const RUNNER_AGENT_PORT: u16 = 50000;
pub const REGISTRY_PORT: u16 = 443;
pub const OBJECT_STORE_PORT: u16 = 9000;

const RUNNER_IMAGE: &str = "conveyor/pipeline-runner:v0.1";
const REGISTRY_IMAGE: &str = "registry:2";
const OBJECT_STORE_IMAGE: &str = "minio/minio:RELEASE.2024-01-01T00-00-00Z";
const PROXY_IMAGE: &str = "conveyor/registry-proxy:v0.1";

pub const ROLE_ADMIN: &str = "admin";
pub const ROLE_CREATE_NS: &str = "create-ns";
pub const ROLE_EDIT_NS_SUFFIX: &str = "-namespaces-edit";

/// `"<project>-pipeline"`: the dedicated namespace for a project's pipeline workloads.
pub fn pipeline_namespace_name(project_id: &str) -> String {
    format!("{}{}", project_id, NAMESPACE_SUFFIX)
}

fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

pub fn pipeline_namespace(project: &ProjectRef) -> Namespace {
    Namespace {
        metadata: ObjectMeta::cluster_scoped(pipeline_namespace_name(&project.project_id))
            .with_label(PROJECT_ID_LABEL, project.project_id.as_str())
            .with_label(PIPELINE_NAMESPACE_LABEL, "true")
            .with_annotation(PROJECT_ID_LABEL, project.to_string()),
        status: Default::default(),
    }
}

pub fn common_namespace() -> Namespace {
    Namespace {
        metadata: ObjectMeta::cluster_scoped(COMMON_NAMESPACE),
        status: Default::default(),
    }
}

/// Runner credentials plus the htpasswd line (`user:bcrypt(token)`) the
/// registry authenticates against.
pub fn pipeline_secret(ns: &str, token: &str, registry_token: &str) -> Secret {
    Secret::new(ns, PIPELINE_SECRET, SecretType::Opaque)
        .with_data(SECRET_TOKEN_KEY, token)
        .with_data(SECRET_USER_KEY, DEFAULT_USER)
        .with_data(SECRET_REGISTRY_TOKEN_KEY, registry_token)
}

pub fn api_key_secret(ns: &str, key: &str) -> Secret {
    Secret::new(ns, API_KEY_SECRET, SecretType::Opaque).with_data(SECRET_API_TOKEN_KEY, key)
}

pub fn service_account(ns: &str) -> conveyor_common::cluster::ServiceAccount {
    conveyor_common::cluster::ServiceAccount {
        metadata: ObjectMeta::new(ns, RUNNER_NAME),
    }
}

/// Admit all ingress, but only to the runner and object store pods.
pub fn network_policy(ns: &str) -> NetworkPolicy {
    NetworkPolicy {
        metadata: ObjectMeta::new(ns, NETWORK_POLICY_NAME),
        spec: NetworkPolicySpec {
            pod_selector_key: LABEL_APP.to_string(),
            pod_selector_values: vec![RUNNER_NAME.to_string(), OBJECT_STORE_NAME.to_string()],
            allow_all_ingress: true,
        },
    }
}

fn service(ns: &str, name: &str, selector: BTreeMap<String, String>, ports: &[(&str, u16)]) -> Service {
    Service {
        metadata: ObjectMeta::new(ns, name),
        spec: ServiceSpec {
            selector,
            ports: ports
                .iter()
                .map(|(port_name, port)| ServicePort {
                    name: port_name.to_string(),
                    port: *port,
                    target_port: *port,
                })
                .collect(),
        },
    }
}

fn deployment(ns: &str, name: &str, template: PodSpec, extra_labels: &[(&str, &str)]) -> Workload {
    let mut selector = labels(&[(LABEL_APP, name)]);
    selector.extend(labels(extra_labels));
    Workload {
        metadata: ObjectMeta::new(ns, name),
        spec: WorkloadSpec {
            kind: WorkloadKind::Deployment,
            replicas: 1,
            selector,
            template,
        },
    }
}

pub fn runner_service(ns: &str) -> Service {
    service(
        ns,
        RUNNER_NAME,
        labels(&[(LABEL_APP, RUNNER_NAME), (LABEL_RUNNER_ROLE, "master")]),
        &[("http", RUNNER_PORT), ("agent", RUNNER_AGENT_PORT)],
    )
}

pub fn runner_deployment(ns: &str) -> Workload {
    let container = Container {
        name: RUNNER_NAME.to_string(),
        image: RUNNER_IMAGE.to_string(),
        env: labels(&[("NAMESPACE", ns)]),
        ports: vec![RUNNER_PORT, RUNNER_AGENT_PORT],
        secret_mounts: vec![PIPELINE_SECRET.to_string()],
        ..Default::default()
    };
    deployment(
        ns,
        RUNNER_NAME,
        PodSpec {
            containers: vec![container],
            host_network: false,
            service_account: RUNNER_NAME.to_string(),
        },
        &[(LABEL_RUNNER_ROLE, "master")],
    )
}

pub fn registry_service(ns: &str) -> Service {
    service(
        ns,
        REGISTRY_NAME,
        labels(&[(LABEL_APP, REGISTRY_NAME)]),
        &[(REGISTRY_NAME, REGISTRY_PORT)],
    )
}

pub fn registry_deployment(ns: &str) -> Workload {
    let container = Container {
        name: REGISTRY_NAME.to_string(),
        image: REGISTRY_IMAGE.to_string(),
        env: labels(&[
            ("REGISTRY_HTTP_ADDR", "0.0.0.0:443"),
            ("REGISTRY_HTTP_TLS_CERTIFICATE", "/certs/tls.crt"),
            ("REGISTRY_HTTP_TLS_KEY", "/certs/tls.key"),
            ("REGISTRY_AUTH", "htpasswd"),
            ("REGISTRY_AUTH_HTPASSWD_REALM", "Registry Realm"),
            ("REGISTRY_AUTH_HTPASSWD_PATH", "/auth/pipeline-secret-registry-token"),
        ]),
        ports: vec![REGISTRY_PORT],
        secret_mounts: vec![REGISTRY_CRT_SECRET.to_string(), PIPELINE_SECRET.to_string()],
        ..Default::default()
    };
    deployment(
        ns,
        REGISTRY_NAME,
        PodSpec {
            containers: vec![container],
            ..Default::default()
        },
        &[],
    )
}

pub fn object_store_service(ns: &str) -> Service {
    service(
        ns,
        OBJECT_STORE_NAME,
        labels(&[(LABEL_APP, OBJECT_STORE_NAME)]),
        &[(OBJECT_STORE_NAME, OBJECT_STORE_PORT)],
    )
}

pub fn object_store_deployment(ns: &str) -> Workload {
    let container = Container {
        name: OBJECT_STORE_NAME.to_string(),
        image: OBJECT_STORE_IMAGE.to_string(),
        args: vec!["server".to_string(), "/data".to_string()],
        ports: vec![OBJECT_STORE_PORT],
        secret_mounts: vec![PIPELINE_SECRET.to_string()],
        ..Default::default()
    };
    deployment(
        ns,
        OBJECT_STORE_NAME,
        PodSpec {
            containers: vec![container],
            ..Default::default()
        },
        &[],
    )
}

/// Host-networked proxy multiplexing every project's registry behind its
/// allocated port.
pub fn proxy_daemonset() -> Workload {
    let container = Container {
        name: PROXY_NAME.to_string(),
        image: PROXY_IMAGE.to_string(),
        args: vec!["nginx-proxy".to_string()],
        secret_mounts: vec![REGISTRY_CA_SECRET.to_string()],
        ..Default::default()
    };
    Workload {
        metadata: ObjectMeta::new(COMMON_NAMESPACE, PROXY_NAME),
        spec: WorkloadSpec {
            kind: WorkloadKind::DaemonSet,
            replicas: 1,
            selector: labels(&[(LABEL_APP, PROXY_NAME)]),
            template: PodSpec {
                containers: vec![container],
                host_network: true,
                service_account: String::new(),
            },
        },
    }
}

/// Pull credential for the project-local registry, stored in the project's
/// own namespace.
pub fn registry_credential(project: &ProjectRef, token: &str, host: &str) -> Secret {
    let auth = STANDARD.encode(format!("{}:{}", DEFAULT_USER, token));
    let config = json!({
        "auths": {
            host: {
                "username": DEFAULT_USER,
                "password": token,
                "email": "",
                "auth": auth,
            }
        }
    });
    let mut secret = Secret::new(&project.project_id, DOCKER_CREDENTIAL, SecretType::DockerConfigJson)
        .with_data(".dockerconfigjson", config.to_string());
    secret
        .metadata
        .annotations
        .insert(PROJECT_ID_LABEL.to_string(), project.to_string());
    secret
}

pub fn role_binding(ns: &str, common_name: &str) -> RoleBinding {
    RoleBinding {
        metadata: ObjectMeta::new(ns, common_name),
        role_ref: RoleRef {
            kind: "ClusterRole".to_string(),
            name: ROLE_ADMIN.to_string(),
        },
        subjects: vec![Subject::service_account(common_name, RUNNER_NAME)],
    }
}

pub fn cluster_role_binding(common_name: &str, role: &str) -> ClusterRoleBinding {
    ClusterRoleBinding {
        metadata: ObjectMeta::cluster_scoped(format!("{}-{}", common_name, role)),
        role_ref: RoleRef {
            kind: "ClusterRole".to_string(),
            name: role.to_string(),
        },
        subjects: vec![Subject::service_account(common_name, RUNNER_NAME)],
    }
}
