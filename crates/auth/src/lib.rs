use http::HeaderMap;
use regex::Regex;
use serde::{Deserialize, Serialize};

pub mod logic;
pub mod policy;

/// Name of the header that carries the subject document.
pub const SUBJECT_HEADER: &str = "x-subject";

/// User name of the reserved guest subject.
pub const GUEST_USER: &str = "guest";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub groups: Vec<String>,
}

impl Subject {
    pub fn new(user: impl Into<String>, groups: Vec<String>) -> Self {
        Self {
            user: user.into(),
            groups,
        }
    }

    /// The reserved sentinel subject attached to public calls that carry no
    /// authentication header.
    pub fn guest() -> Self {
        Self {
            user: GUEST_USER.to_string(),
            groups: Vec::new(),
        }
    }

    pub fn is_guest(&self) -> bool {
        self.user == GUEST_USER
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthError {
    pub code: &'static str,
    pub message: String,
}

impl AuthError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for AuthError {}

/// Parses the `X-Subject` header into a [`Subject`]. A method whose full
/// path matches one of the configured regular expressions is public: it
/// admits a missing header and gets the guest subject instead.
pub struct Authenticator {
    public_methods: Vec<Regex>,
}

impl Authenticator {
    pub fn new(public_method_exprs: &[String]) -> Result<Self, AuthError> {
        let mut public_methods = Vec::with_capacity(public_method_exprs.len());
        for expr in public_method_exprs {
            let compiled = Regex::new(expr).map_err(|_| {
                AuthError::new(
                    "ERR_INVALID_CONFIG",
                    format!("invalid public method pattern `{}`", expr),
                )
            })?;
            public_methods.push(compiled);
        }
        Ok(Self { public_methods })
    }

    pub fn is_public_method(&self, method: &str) -> bool {
        self.public_methods.iter().any(|re| re.is_match(method))
    }

    pub fn authenticate(&self, headers: &HeaderMap, method: &str) -> Result<Subject, AuthError> {
        let values = headers
            .get_all(SUBJECT_HEADER)
            .iter()
            .collect::<Vec<_>>();

        if values.is_empty() {
            if self.is_public_method(method) {
                return Ok(Subject::guest());
            }
            return Err(AuthError::new(
                "ERR_AUTH_REQUIRED",
                "missing authentication header",
            ));
        }
        if values.len() > 1 {
            return Err(AuthError::new(
                "ERR_AUTH_INVALID",
                "too many values for authentication header",
            ));
        }

        let raw = values[0].to_str().map_err(|_| {
            AuthError::new(
                "ERR_AUTH_INVALID",
                "authentication header is not valid text",
            )
        })?;
        let mut subject = serde_json::from_str::<Subject>(raw).map_err(|_| {
            AuthError::new(
                "ERR_AUTH_INVALID",
                "failed to decode authentication header",
            )
        })?;

        subject.user = subject.user.trim().to_string();
        for group in subject.groups.iter_mut() {
            *group = group.trim().to_string();
        }
        if subject.user.is_empty() {
            return Err(AuthError::new("ERR_AUTH_INVALID", "subject name is empty"));
        }

        tracing::debug!(user = %subject.user, "extracted subject from header");
        Ok(subject)
    }
}
