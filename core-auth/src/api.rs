//! URL joining and response decoding shared by the identity client and the
//! authorization pipeline.

use crate::error::{AuthError, Result};
use bridge_traits::http::HttpResponse;
use serde::de::DeserializeOwned;
use serde_json::Value;
use url::Url;

const FALLBACK_ERROR_MESSAGE: &str = "Request failed.";

/// Backend base URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiBase {
    base: Url,
}

impl ApiBase {
    pub fn new(base: Url) -> Self {
        Self { base }
    }

    pub fn as_url(&self) -> &Url {
        &self.base
    }

    /// Resolve `path` against the base.
    ///
    /// Absolute `http`/`https` URLs pass through. Anything else is appended to
    /// the base path, so `/auth/me` under `https://api.rentdesk.app/v1/`
    /// becomes `https://api.rentdesk.app/v1/auth/me` (plain `Url::join` would
    /// drop the `/v1`).
    ///
    /// ```
    /// use core_auth::api::ApiBase;
    /// use url::Url;
    ///
    /// let api = ApiBase::new(Url::parse("https://api.rentdesk.app/v1/").unwrap());
    /// assert_eq!(
    ///     api.url_for("/auth/me").unwrap(),
    ///     "https://api.rentdesk.app/v1/auth/me"
    /// );
    /// assert_eq!(
    ///     api.url_for("https://cdn.rentdesk.app/x").unwrap(),
    ///     "https://cdn.rentdesk.app/x"
    /// );
    /// ```
    pub fn url_for(&self, path: &str) -> Result<String> {
        let lower = path.to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            return Url::parse(path)
                .map(String::from)
                .map_err(|e| AuthError::InvalidRequest(format!("invalid URL {}: {}", path, e)));
        }

        let joined = format!(
            "{}/{}",
            self.base.as_str().trim_end_matches('/'),
            path.trim_start_matches('/')
        );

        Url::parse(&joined)
            .map(String::from)
            .map_err(|e| AuthError::InvalidRequest(format!("invalid path {}: {}", path, e)))
    }
}

/// Best human-readable message from an error response.
pub fn error_message(response: &HttpResponse) -> String {
    if let Ok(value) = serde_json::from_slice::<Value>(&response.body) {
        for field in ["message", "detail"] {
            match value.get(field) {
                Some(Value::String(s)) if !s.trim().is_empty() => return s.clone(),
                // Validation errors sometimes arrive as a list
                Some(Value::Array(items)) if !items.is_empty() => {
                    let joined = items
                        .iter()
                        .filter_map(|item| match item {
                            Value::String(s) => Some(s.clone()),
                            Value::Object(obj) => obj
                                .get("msg")
                                .and_then(Value::as_str)
                                .map(str::to_string),
                            _ => None,
                        })
                        .collect::<Vec<_>>()
                        .join("; ");
                    if !joined.is_empty() {
                        return joined;
                    }
                }
                _ => {}
            }
        }
    }

    match response.text() {
        Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
        _ => FALLBACK_ERROR_MESSAGE.to_string(),
    }
}

/// Map a non-2xx response to [`AuthError::Api`].
pub fn api_error(response: &HttpResponse) -> AuthError {
    AuthError::Api {
        status: response.status,
        message: error_message(response),
    }
}

/// Decode a successful response body. 204 and empty bodies decode as JSON
/// `null`, so `T = ()` or `Option<_>` accept them.
pub fn decode_body<T: DeserializeOwned>(response: &HttpResponse) -> Result<T> {
    if response.status == 204 || response.body.iter().all(u8::is_ascii_whitespace) {
        return serde_json::from_value(Value::Null)
            .map_err(|e| AuthError::InvalidResponse(format!("empty body: {}", e)));
    }

    serde_json::from_slice(&response.body)
        .map_err(|e| AuthError::InvalidResponse(e.to_string()))
}
