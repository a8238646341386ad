//! Authorization gate. The policy decision itself is evaluated by an
//! external engine; this client sends it the identity-propagation input and
//! reads the boolean verdict back.

use std::time::Duration;

use serde::Deserialize;

#[derive(Debug)]
pub enum PolicyError {
    Timeout,
    Http(reqwest::Error),
    BadStatus(reqwest::StatusCode),
    InvalidResponse,
}

impl std::fmt::Display for PolicyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PolicyError::Timeout => write!(f, "policy request timed out"),
            PolicyError::Http(err) => write!(f, "policy HTTP error: {}", err),
            PolicyError::BadStatus(status) => write!(f, "policy engine returned status {}", status),
            PolicyError::InvalidResponse => write!(f, "policy engine returned invalid JSON"),
        }
    }
}

impl std::error::Error for PolicyError {}

impl From<reqwest::Error> for PolicyError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_timeout() {
            PolicyError::Timeout
        } else {
            PolicyError::Http(value)
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct PolicyDecision {
    #[serde(default)]
    pub allow: bool,
}

#[derive(Deserialize)]
struct DataResponse {
    // A missing result denies, it is not an error.
    #[serde(default)]
    result: PolicyDecision,
}

#[derive(Clone)]
pub struct PolicyClient {
    decision_url: String,
    http: reqwest::Client,
}

impl PolicyClient {
    pub fn new(decision_url: String, timeout: Duration) -> Result<Self, PolicyError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(PolicyError::Http)?;
        Ok(Self { decision_url, http })
    }

    /// Evaluates the method-level policy for the given method path and user
    /// name. Returns the allow verdict; false or missing denies.
    pub async fn evaluate(&self, method_path: &str, user: &str) -> Result<bool, PolicyError> {
        let input = decision_input(method_path, user);
        let resp = self
            .http
            .post(&self.decision_url)
            .json(&serde_json::json!({ "input": input }))
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(PolicyError::BadStatus(resp.status()));
        }

        let decoded = resp
            .json::<DataResponse>()
            .await
            .map_err(|_| PolicyError::InvalidResponse)?;
        Ok(decoded.result.allow)
    }
}

pub fn decision_input(method_path: &str, user: &str) -> serde_json::Value {
    serde_json::json!({
        "context": {
            "request": {
                "http": {
                    "path": method_path,
                }
            }
        },
        "auth": {
            "identity": {
                "user": {
                    "username": user,
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decision_input_has_the_documented_shape() {
        let input = decision_input("/private.v1.Clusters/Create", "anonymous");
        assert_eq!(
            input["context"]["request"]["http"]["path"],
            "/private.v1.Clusters/Create"
        );
        assert_eq!(input["auth"]["identity"]["user"]["username"], "anonymous");
    }

    #[test]
    fn missing_result_denies() {
        let decoded: DataResponse = serde_json::from_str("{}").expect("empty body should decode");
        assert!(!decoded.result.allow);
    }

    #[test]
    fn missing_allow_denies() {
        let decoded: DataResponse =
            serde_json::from_str(r#"{"result":{}}"#).expect("body should decode");
        assert!(!decoded.result.allow);
    }

    #[test]
    fn explicit_allow_is_honored() {
        let decoded: DataResponse =
            serde_json::from_str(r#"{"result":{"allow":true}}"#).expect("body should decode");
        assert!(decoded.result.allow);
    }
}
