pub mod config;
pub mod feedback;
pub mod forward;
pub mod hub_cache;
pub mod kube;
pub mod metrics;
pub mod webhook;
pub mod workqueue;

use foundry_store::StoreError;

use crate::kube::KubeError;

#[derive(Debug)]
pub enum ControllerError {
    Store(StoreError),
    Kube(KubeError),
    Webhook(String),
    Missing(String),
    Serialization(serde_json::Error),
}

impl std::fmt::Display for ControllerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControllerError::Store(err) => write!(f, "store error: {}", err),
            ControllerError::Kube(err) => write!(f, "hub API error: {}", err),
            ControllerError::Webhook(message) => write!(f, "webhook error: {}", message),
            ControllerError::Missing(message) => write!(f, "{}", message),
            ControllerError::Serialization(err) => write!(f, "serialization error: {}", err),
        }
    }
}

impl std::error::Error for ControllerError {}

impl From<StoreError> for ControllerError {
    fn from(value: StoreError) -> Self {
        ControllerError::Store(value)
    }
}

impl From<KubeError> for ControllerError {
    fn from(value: KubeError) -> Self {
        ControllerError::Kube(value)
    }
}

impl From<serde_json::Error> for ControllerError {
    fn from(value: serde_json::Error) -> Self {
        ControllerError::Serialization(value)
    }
}
