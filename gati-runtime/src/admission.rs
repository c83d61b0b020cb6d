//! Ingress admission: authentication and request-id acceptance.
//!
//! Admission failures never reach the fabric; they are answered directly
//! with 400/401/413-class responses.

use gati_core::envelope::{AuthContext, Headers};
use gati_core::error::{AdmissionError, GatiError};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

type ValidateFuture<'a> = Pin<Box<dyn Future<Output = Result<AuthContext, GatiError>> + Send + 'a>>;

/// External bearer-token validator. The core never parses tokens itself.
pub trait TokenValidator: Send + Sync + 'static {
    fn validate<'a>(&'a self, token: &'a str) -> ValidateFuture<'a>;
}

/// Configured admission method.
#[derive(Clone)]
pub enum AuthMode {
    None,
    /// Shared-secret API key in a configured header.
    ApiKey { header: String, secret: String },
    /// Bearer token verified by an external validator.
    Bearer { validator: Arc<dyn TokenValidator> },
}

impl AuthMode {
    /// Build from config; `bearer` requires a validator wired by the
    /// runtime builder and falls back to rejecting everything.
    pub fn from_config(config: &gati_core::config::GatiConfig) -> Self {
        match config.auth_method.as_str() {
            "api_key" => AuthMode::ApiKey {
                header: config.auth_api_key_header.clone(),
                secret: config.auth_api_key.clone().unwrap_or_default(),
            },
            "bearer" => AuthMode::Bearer {
                validator: Arc::new(RejectAllValidator),
            },
            _ => AuthMode::None,
        }
    }
}

/// Placeholder validator installed when `bearer` is configured without a
/// backend; every request is rejected so the misconfiguration is loud.
pub struct RejectAllValidator;

impl TokenValidator for RejectAllValidator {
    fn validate<'a>(&'a self, _token: &'a str) -> ValidateFuture<'a> {
        Box::pin(async {
            Err(GatiError::Admission(AdmissionError::Unauthorized(
                "no token validator configured".to_string(),
            )))
        })
    }
}

/// Run the configured admission method over the request headers.
pub async fn authenticate(mode: &AuthMode, headers: &Headers) -> Result<AuthContext, AdmissionError> {
    match mode {
        AuthMode::None => Ok(AuthContext::anonymous()),
        AuthMode::ApiKey { header, secret } => match headers.get(header) {
            Some(presented) if constant_time_eq(presented.as_bytes(), secret.as_bytes()) => {
                Ok(AuthContext {
                    method: "api_key".to_string(),
                    principal: None,
                    roles: Vec::new(),
                    claims: serde_json::Value::Null,
                })
            }
            Some(_) => Err(AdmissionError::Unauthorized("invalid api key".to_string())),
            None => Err(AdmissionError::Unauthorized(format!(
                "missing {header} header"
            ))),
        },
        AuthMode::Bearer { validator } => {
            let token = headers
                .get("authorization")
                .and_then(|value| value.strip_prefix("Bearer "))
                .ok_or_else(|| {
                    AdmissionError::Unauthorized("missing bearer token".to_string())
                })?;
            let mut auth = validator
                .validate(token)
                .await
                .map_err(|err| AdmissionError::Unauthorized(err.to_string()))?;
            auth.method = "bearer".to_string();
            Ok(auth)
        }
    }
}

/// A caller-supplied request id must be short and url-safe; anything else
/// is replaced by a generated one.
pub fn acceptable_request_id(candidate: &str) -> bool {
    !candidate.is_empty()
        && candidate.len() <= 128
        && candidate
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'.')
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> Headers {
        let mut headers = Headers::new();
        for (name, value) in pairs {
            headers.insert(*name, *value);
        }
        headers
    }

    #[tokio::test]
    async fn none_mode_admits_everyone_anonymously() {
        let auth = authenticate(&AuthMode::None, &headers(&[])).await.unwrap();
        assert_eq!(auth.method, "none");
        assert!(auth.principal.is_none());
    }

    #[tokio::test]
    async fn api_key_mode_checks_the_shared_secret() {
        let mode = AuthMode::ApiKey {
            header: "x-gati-api-key".to_string(),
            secret: "s3cret".to_string(),
        };
        assert!(authenticate(&mode, &headers(&[("X-Gati-Api-Key", "s3cret")]))
            .await
            .is_ok());
        assert!(authenticate(&mode, &headers(&[("X-Gati-Api-Key", "wrong")]))
            .await
            .is_err());
        assert!(authenticate(&mode, &headers(&[])).await.is_err());
    }

    #[tokio::test]
    async fn bearer_mode_delegates_to_the_validator() {
        struct StaticValidator;
        impl TokenValidator for StaticValidator {
            fn validate<'a>(&'a self, token: &'a str) -> ValidateFuture<'a> {
                let token = token.to_string();
                Box::pin(async move {
                    if token == "good" {
                        Ok(AuthContext {
                            method: String::new(),
                            principal: Some("alice".to_string()),
                            roles: vec!["admin".to_string()],
                            claims: serde_json::Value::Null,
                        })
                    } else {
                        Err(GatiError::Admission(AdmissionError::Unauthorized(
                            "bad token".to_string(),
                        )))
                    }
                })
            }
        }
        let mode = AuthMode::Bearer {
            validator: Arc::new(StaticValidator),
        };
        let auth = authenticate(&mode, &headers(&[("Authorization", "Bearer good")]))
            .await
            .unwrap();
        assert_eq!(auth.method, "bearer");
        assert_eq!(auth.principal.as_deref(), Some("alice"));
        assert!(authenticate(&mode, &headers(&[("Authorization", "Bearer bad")]))
            .await
            .is_err());
        assert!(authenticate(&mode, &headers(&[])).await.is_err());
    }

    #[test]
    fn request_id_syntax_check() {
        assert!(acceptable_request_id("req-123_a.b"));
        assert!(!acceptable_request_id(""));
        assert!(!acceptable_request_id("has space"));
        assert!(!acceptable_request_id(&"x".repeat(200)));
    }
}
