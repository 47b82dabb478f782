use std::collections::HashMap;

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use serde_json::Value;

/// This will use the real or the mock implementation, depending on whether we are compiling for tests or not.
#[mockall_double::double]
pub use client::ProviderClient;

use crate::dto;

pub const LOGIN_FLOW_PATH: &str = "self-service/login/api";
pub const WHOAMI_PATH: &str = "sessions/whoami";
pub const IDENTITIES_PATH: &str = "identities";
pub const SCHEMAS_PATH: &str = "schemas";

const DEFAULT_ERROR_MESSAGE: &str = "Unknown error";

/// Everything that can go wrong while talking to Kratos, each carrying a single human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    /// Kratos answered, but rejected the request (wrong credentials, invalid session, ...).
    #[error("{0}")]
    AuthenticationFailed(String),
    /// Kratos answered with a body we do not understand.
    #[error("Unrecognized response format: {0}")]
    MalformedResponse(String),
    /// Kratos could not be reached or did not answer with JSON.
    #[error("{0}")]
    Unavailable(String),
}

/// The part of a self-service login flow we need to submit credentials.
#[derive(serde::Deserialize, Debug, Default)]
pub struct LoginFlow {
    #[serde(default)]
    pub ui: LoginFlowUi,
}

#[derive(serde::Deserialize, Debug, Default)]
pub struct LoginFlowUi {
    pub action: Option<String>,
    pub method: Option<String>,
}

impl LoginFlow {
    /// The URL and HTTP method to submit the credentials to.
    pub fn submission(&self) -> Result<(&str, &str), ProviderError> {
        let action = self
            .ui
            .action
            .as_deref()
            .filter(|action| !action.is_empty())
            .ok_or_else(|| ProviderError::MalformedResponse("login flow has no ui.action".to_string()))?;
        Ok((action, self.ui.method.as_deref().unwrap_or("POST")))
    }
}

/// Body of a password login submission.
#[derive(serde::Serialize, Debug)]
pub struct PasswordLogin<'a> {
    pub method: &'static str,
    pub identifier: &'a str,
    pub password: &'a str,
}

impl<'a> PasswordLogin<'a> {
    pub fn new(identifier: &'a str, password: &'a str) -> Self {
        Self {
            method: "password",
            identifier,
            password,
        }
    }
}

fn error_reason(body: &Value) -> Option<&str> {
    body.pointer("/error/reason")?.as_str()
}

fn error_message(body: &Value) -> Option<&str> {
    body.pointer("/error/message")?.as_str()
}

fn first_ui_error(body: &Value) -> Option<&str> {
    body.pointer("/ui/messages")?
        .as_array()?
        .iter()
        .find(|message| message.get("type").and_then(Value::as_str) == Some("error"))?
        .get("text")?
        .as_str()
}

/// Strategies to extract an error message from a Kratos error body, in order of preference.
const ERROR_MESSAGE_STRATEGIES: [fn(&Value) -> Option<&str>; 3] = [error_reason, error_message, first_ui_error];

/// Find the most specific error message Kratos gave us in an error response.
pub fn resolve_error_message(body: &Value) -> String {
    ERROR_MESSAGE_STRATEGIES
        .iter()
        .filter_map(|strategy| strategy(body))
        .find(|message| !message.is_empty())
        .unwrap_or(DEFAULT_ERROR_MESSAGE)
        .to_string()
}

/// A schema as listed by the public API. Depending on the Kratos version, the
/// document arrives inline or as Base64 encoded JSON text.
#[derive(serde::Deserialize, Debug)]
pub struct SchemaRecord {
    pub id: String,
    pub schema: SchemaDocument,
}

#[derive(serde::Deserialize, Debug)]
#[serde(untagged)]
pub enum SchemaDocument {
    Encoded(String),
    Inline(Value),
}

impl SchemaDocument {
    pub fn decode(self) -> Result<Value, ProviderError> {
        match self {
            SchemaDocument::Inline(document) => Ok(document),
            SchemaDocument::Encoded(encoded) => {
                let raw = BASE64
                    .decode(encoded.trim())
                    .map_err(|e| ProviderError::MalformedResponse(format!("schema is not valid Base64: {e}")))?;
                serde_json::from_slice(&raw).map_err(|e| ProviderError::MalformedResponse(format!("schema is not valid JSON: {e}")))
            }
        }
    }
}

/// Decode all schema documents and key them by schema id.
pub fn decode_schemas(records: Vec<SchemaRecord>) -> Result<HashMap<String, dto::Schema>, ProviderError> {
    records
        .into_iter()
        .map(|record| {
            let definition = record.schema.decode()?;
            Ok((record.id.clone(), dto::Schema { id: record.id, definition }))
        })
        .collect()
}

#[cfg(not(test))]
mod client {
    use reqwest::{Method, StatusCode, header};
    use serde::{Serialize, de::DeserializeOwned};
    use url::Url;

    use super::*;
    use crate::config;

    /// A client for the public and admin API of a Kratos instance.
    /// Holds nothing but immutable configuration, so a single instance is shared by all sessions.
    pub struct ProviderClient {
        http: reqwest::Client,
        public_url: Url,
        admin_url: Option<Url>,
        session_cookie: String,
    }

    impl ProviderClient {
        pub fn new(config: &config::ProviderConfig) -> anyhow::Result<Self> {
            let http = reqwest::Client::builder().timeout(config.timeout).build()?;
            Ok(Self {
                http,
                public_url: config.public_url.clone(),
                admin_url: config.admin_url.clone(),
                session_cookie: config.session_cookie.clone(),
            })
        }

        /// Log in using the self-service login flow for API clients: initiate a flow, then submit
        /// the password to wherever the flow tells us to.
        pub async fn login(&self, identifier: &str, password: &str) -> Result<(), ProviderError> {
            let flow: LoginFlow = self.request(&self.public_url, LOGIN_FLOW_PATH, Method::GET, None::<&()>, None).await?;
            let (action, method) = flow.submission()?;
            let method = Method::from_bytes(method.to_uppercase().as_bytes())
                .map_err(|_| ProviderError::MalformedResponse(format!("login flow has invalid ui.method '{method}'")))?;

            tracing::debug!(%action, %method, "Submitting credentials to login flow");
            let _: Value = self
                .request(&self.public_url, action, method, Some(&PasswordLogin::new(identifier, password)), None)
                .await?;
            Ok(())
        }

        /// Check whether the token belongs to an active session.
        pub async fn verify_session_token(&self, token: &str) -> Result<(), ProviderError> {
            let cookie = format!("{}={}", self.session_cookie, token);
            let _: Value = self.request(&self.public_url, WHOAMI_PATH, Method::GET, None::<&()>, Some(cookie)).await?;
            Ok(())
        }

        /// Retrieve all identities, in the order Kratos lists them.
        pub async fn fetch_identities(&self) -> Result<Vec<dto::Identity>, ProviderError> {
            let admin_url = self
                .admin_url
                .as_ref()
                .ok_or_else(|| ProviderError::Unavailable("Kratos admin API URL is not configured".to_string()))?;
            self.request(admin_url, IDENTITIES_PATH, Method::GET, None::<&()>, None).await
        }

        /// Retrieve all identity schemas keyed by schema id.
        pub async fn fetch_schemas(&self) -> Result<HashMap<String, dto::Schema>, ProviderError> {
            let records: Vec<SchemaRecord> = self.request(&self.public_url, SCHEMAS_PATH, Method::GET, None::<&()>, None).await?;
            decode_schemas(records)
        }

        /// Send a JSON request to Kratos. `target` is resolved relative to `base`, so absolute URLs
        /// (like login flow actions) are used as they are.
        async fn request<T, B>(&self, base: &Url, target: &str, method: Method, body: Option<&B>, cookie: Option<String>) -> Result<T, ProviderError>
        where
            T: DeserializeOwned,
            B: Serialize + ?Sized,
        {
            let url = base
                .join(target)
                .map_err(|e| ProviderError::MalformedResponse(format!("invalid URL '{target}': {e}")))?;

            let mut request = self
                .http
                .request(method.clone(), url.clone())
                .header(header::ACCEPT, "application/json")
                .header(header::CONTENT_TYPE, "application/json");
            if let Some(body) = body {
                request = request.json(body);
            }
            if let Some(cookie) = cookie {
                request = request.header(header::COOKIE, cookie);
            }

            let response = request.send().await.map_err(|e| {
                tracing::warn!(%url, error = ?e, "Could not connect to Kratos");
                ProviderError::Unavailable(format!("Could not connect to Kratos: {e}"))
            })?;
            let status = response.status();
            tracing::trace!(%url, %method, %status, "Kratos responded");

            let bytes = response
                .bytes()
                .await
                .map_err(|e| ProviderError::Unavailable(format!("Could not read Kratos response: {e}")))?;
            let json: Value = match serde_json::from_slice(&bytes) {
                Ok(json) => json,
                Err(_) if !status.is_success() => return Err(ProviderError::Unavailable(status_text(status))),
                Err(e) => return Err(ProviderError::Unavailable(e.to_string())),
            };

            if !status.is_success() {
                let message = resolve_error_message(&json);
                tracing::debug!(%url, %status, reason = %message, "Kratos rejected request");
                return Err(ProviderError::AuthenticationFailed(message));
            }

            serde_json::from_value(json).map_err(|e| ProviderError::MalformedResponse(e.to_string()))
        }
    }

    fn status_text(status: StatusCode) -> String {
        status.canonical_reason().map(str::to_string).unwrap_or_else(|| status.to_string())
    }

    impl std::fmt::Debug for ProviderClient {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "Kratos client for '{}'", self.public_url)
        }
    }
}
