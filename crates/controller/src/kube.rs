//! Minimal dynamic client for the hub Kubernetes API: labeled list, create,
//! merge-patch and delete over the custom resources the reconcilers manage.

use std::time::Duration;

use serde::Deserialize;

pub const GROUP: &str = "foundry.dev";
pub const VERSION: &str = "v1alpha1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupVersionResource {
    pub group: &'static str,
    pub version: &'static str,
    pub plural: &'static str,
    pub kind: &'static str,
}

pub const VIRTUAL_MACHINES: GroupVersionResource = GroupVersionResource {
    group: GROUP,
    version: VERSION,
    plural: "virtualmachines",
    kind: "VirtualMachine",
};

pub const CLUSTERS: GroupVersionResource = GroupVersionResource {
    group: GROUP,
    version: VERSION,
    plural: "clusters",
    kind: "Cluster",
};

#[derive(Debug)]
pub enum KubeError {
    Timeout,
    Http(reqwest::Error),
    BadStatus(reqwest::StatusCode),
    InvalidResponse,
    Certificate,
}

impl std::fmt::Display for KubeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KubeError::Timeout => write!(f, "hub API request timed out"),
            KubeError::Http(err) => write!(f, "hub API HTTP error: {}", err),
            KubeError::BadStatus(status) => write!(f, "hub API returned status {}", status),
            KubeError::InvalidResponse => write!(f, "hub API returned invalid JSON"),
            KubeError::Certificate => write!(f, "hub CA bundle is not valid PEM"),
        }
    }
}

impl std::error::Error for KubeError {}

impl From<reqwest::Error> for KubeError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_timeout() {
            KubeError::Timeout
        } else {
            KubeError::Http(value)
        }
    }
}

#[derive(Deserialize)]
struct ObjectList {
    #[serde(default)]
    items: Vec<serde_json::Value>,
}

#[derive(Clone)]
pub struct KubeClient {
    base_url: String,
    token: String,
    http: reqwest::Client,
}

impl KubeClient {
    pub fn new(
        api_url: &str,
        token: &str,
        ca_bundle: &str,
        insecure: bool,
        timeout: Duration,
    ) -> Result<Self, KubeError> {
        let mut builder = reqwest::Client::builder().timeout(timeout);
        if insecure {
            builder = builder.danger_accept_invalid_certs(true);
        }
        if !ca_bundle.is_empty() {
            let certificate = reqwest::Certificate::from_pem(ca_bundle.as_bytes())
                .map_err(|_| KubeError::Certificate)?;
            builder = builder.add_root_certificate(certificate);
        }
        let http = builder.build().map_err(KubeError::Http)?;
        Ok(Self {
            base_url: api_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            http,
        })
    }

    fn collection_url(&self, gvr: &GroupVersionResource, namespace: &str) -> String {
        format!(
            "{}/apis/{}/{}/namespaces/{}/{}",
            self.base_url, gvr.group, gvr.version, namespace, gvr.plural
        )
    }

    fn object_url(&self, gvr: &GroupVersionResource, namespace: &str, name: &str) -> String {
        format!("{}/{}", self.collection_url(gvr, namespace), name)
    }

    pub async fn list_by_selector(
        &self,
        gvr: &GroupVersionResource,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<serde_json::Value>, KubeError> {
        let resp = self
            .http
            .get(self.collection_url(gvr, namespace))
            .bearer_auth(&self.token)
            .query(&[("labelSelector", label_selector)])
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(KubeError::BadStatus(resp.status()));
        }
        let list = resp
            .json::<ObjectList>()
            .await
            .map_err(|_| KubeError::InvalidResponse)?;
        Ok(list.items)
    }

    pub async fn create(
        &self,
        gvr: &GroupVersionResource,
        namespace: &str,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value, KubeError> {
        let resp = self
            .http
            .post(self.collection_url(gvr, namespace))
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(KubeError::BadStatus(resp.status()));
        }
        resp.json::<serde_json::Value>()
            .await
            .map_err(|_| KubeError::InvalidResponse)
    }

    pub async fn merge_patch(
        &self,
        gvr: &GroupVersionResource,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<serde_json::Value, KubeError> {
        let resp = self
            .http
            .patch(self.object_url(gvr, namespace, name))
            .bearer_auth(&self.token)
            .header(reqwest::header::CONTENT_TYPE, "application/merge-patch+json")
            .json(patch)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(KubeError::BadStatus(resp.status()));
        }
        resp.json::<serde_json::Value>()
            .await
            .map_err(|_| KubeError::InvalidResponse)
    }

    /// Deletes the named object; an absent object is not an error.
    pub async fn delete(
        &self,
        gvr: &GroupVersionResource,
        namespace: &str,
        name: &str,
    ) -> Result<(), KubeError> {
        let resp = self
            .http
            .delete(self.object_url(gvr, namespace, name))
            .bearer_auth(&self.token)
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        if !resp.status().is_success() {
            return Err(KubeError::BadStatus(resp.status()));
        }
        Ok(())
    }
}

/// Label carrying the entity identifier on native objects, for example
/// `foundry.dev/virtual-machine-uuid`.
pub fn uuid_label(kind: &str) -> String {
    format!("{}/{}-uuid", GROUP, kind.replace('_', "-"))
}
