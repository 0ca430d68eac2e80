use std::fs;
use std::path::PathBuf;

use async_trait::async_trait;
use common::FailureKind;
use log::{debug, info};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use serde_json::{Value, json};
use thiserror::Error;

use crate::config::ClusterConfig;

const MERGE_PATCH: &str = "application/merge-patch+json";

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("failed to build cluster client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("failed to read {path}: {source}")]
    Credentials {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("request {method} {url} failed: {source}")]
    Request {
        method: Method,
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{method} {url} returned {status}: {body}")]
    Status {
        method: Method,
        url: String,
        status: StatusCode,
        body: String,
    },
    #[error("unexpected response from {url}: {reason}")]
    Unexpected { url: String, reason: String },
}

impl ClusterError {
    pub fn kind(&self) -> FailureKind {
        match self {
            ClusterError::Request { .. } => FailureKind::Retryable,
            ClusterError::Status { status, .. }
                if status.is_server_error()
                    || *status == StatusCode::CONFLICT
                    || *status == StatusCode::TOO_MANY_REQUESTS =>
            {
                FailureKind::Retryable
            }
            _ => FailureKind::Fatal,
        }
    }
}

/// The narrow slice of the cluster orchestrator a migration needs.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn count_pods(&self) -> Result<usize, ClusterError>;

    /// Set `key=value` on `node`, or remove `key` when `value` is `None`.
    async fn set_node_label(
        &self,
        node: &str,
        key: &str,
        value: Option<&str>,
    ) -> Result<(), ClusterError>;

    /// Change the replica count by `delta`, returning the new count.
    async fn scale_deployment(&self, deployment: &str, delta: i32) -> Result<i32, ClusterError>;

    /// Delete the deployment's pods scheduled on `node`.
    async fn delete_pods_on_node(&self, deployment: &str, node: &str) -> Result<(), ClusterError>;
}

/// Kubernetes REST client.
pub struct KubeClient {
    http: reqwest::Client,
    base: String,
    namespace: String,
    token: Option<String>,
}

impl KubeClient {
    pub fn from_config(cfg: &ClusterConfig) -> Result<Self, ClusterError> {
        let mut builder = reqwest::Client::builder()
            .timeout(cfg.request_timeout())
            .danger_accept_invalid_certs(cfg.insecure_skip_tls_verify);
        if let Some(ca) = cfg.ca_file.as_ref().filter(|p| p.exists()) {
            let pem = fs::read(ca).map_err(|source| ClusterError::Credentials {
                path: ca.clone(),
                source,
            })?;
            let cert = reqwest::Certificate::from_pem(&pem).map_err(ClusterError::Client)?;
            builder = builder.add_root_certificate(cert);
        }
        let token = match cfg.token_file.as_ref().filter(|p| p.exists()) {
            Some(path) => Some(
                fs::read_to_string(path)
                    .map_err(|source| ClusterError::Credentials {
                        path: path.clone(),
                        source,
                    })?
                    .trim()
                    .to_string(),
            ),
            None => None,
        };
        Ok(Self {
            http: builder.build().map_err(ClusterError::Client)?,
            base: cfg.api_server.trim_end_matches('/').to_string(),
            namespace: cfg.namespace.clone(),
            token,
        })
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<Value>,
    ) -> Result<Value, ClusterError> {
        let url = format!("{}{}", self.base, path);
        let mut req = self.http.request(method.clone(), &url);
        if !query.is_empty() {
            req = req.query(query);
        }
        if let Some(token) = &self.token {
            req = req.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        if let Some(body) = body {
            req = req
                .header(CONTENT_TYPE, MERGE_PATCH)
                .body(body.to_string());
        }

        let resp = req.send().await.map_err(|source| ClusterError::Request {
            method: method.clone(),
            url: url.clone(),
            source,
        })?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ClusterError::Status {
                method,
                url,
                status,
                body,
            });
        }
        debug!("[cluster] {method} {url} -> {status}");
        resp.json::<Value>()
            .await
            .map_err(|source| ClusterError::Request {
                method,
                url,
                source,
            })
    }

    fn scale_path(&self, deployment: &str) -> String {
        format!(
            "/apis/apps/v1/namespaces/{}/deployments/{deployment}/scale",
            self.namespace
        )
    }
}

#[async_trait]
impl ClusterApi for KubeClient {
    async fn count_pods(&self) -> Result<usize, ClusterError> {
        let path = format!("/api/v1/namespaces/{}/pods", self.namespace);
        let list = self.send(Method::GET, &path, &[], None).await?;
        let count = list["items"].as_array().map_or(0, Vec::len);
        info!("[cluster] {count} pods in namespace {}", self.namespace);
        Ok(count)
    }

    async fn set_node_label(
        &self,
        node: &str,
        key: &str,
        value: Option<&str>,
    ) -> Result<(), ClusterError> {
        let patch = json!({ "metadata": { "labels": { key: value } } });
        self.send(Method::PATCH, &format!("/api/v1/nodes/{node}"), &[], Some(patch))
            .await?;
        match value {
            Some(v) => info!("[cluster] labelled node {node} with {key}={v}"),
            None => info!("[cluster] removed label {key} from node {node}"),
        }
        Ok(())
    }

    async fn scale_deployment(&self, deployment: &str, delta: i32) -> Result<i32, ClusterError> {
        let path = self.scale_path(deployment);
        let scale = self.send(Method::GET, &path, &[], None).await?;
        let current = scale["spec"]["replicas"]
            .as_i64()
            .ok_or_else(|| ClusterError::Unexpected {
                url: format!("{}{path}", self.base),
                reason: "scale has no spec.replicas".to_string(),
            })? as i32;
        let replicas = (current + delta).max(0);
        let patch = json!({ "spec": { "replicas": replicas } });
        self.send(Method::PATCH, &path, &[], Some(patch)).await?;
        info!("[cluster] scaled {deployment} from {current} to {replicas} replicas");
        Ok(replicas)
    }

    async fn delete_pods_on_node(&self, deployment: &str, node: &str) -> Result<(), ClusterError> {
        let path = format!("/api/v1/namespaces/{}/pods", self.namespace);
        let query = [
            ("labelSelector", format!("app={deployment}")),
            ("fieldSelector", format!("spec.nodeName={node}")),
        ];
        self.send(Method::DELETE, &path, &query, None).await?;
        info!("[cluster] deleted pods of {deployment} on node {node}");
        Ok(())
    }
}
