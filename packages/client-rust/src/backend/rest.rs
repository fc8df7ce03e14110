//! HTTP backend for a Frappe-style document API.
//!
//! Routes:
//! - `GET|PUT|DELETE /api/resource/{doctype}/{name}`, `POST /api/resource/{doctype}`
//!   (responses wrapped in `data`)
//! - `POST /api/method/{method}` (responses wrapped in `message`), including
//!   `frappe.client.rename_doc` and `frappe.desk.search.search_link`

use async_trait::async_trait;
use docform_core::value::as_id;
use docform_core::Values;
use reqwest::header::AUTHORIZATION;
use reqwest::{Method, RequestBuilder, Url};
use serde_json::{json, Value};

use crate::config::ClientConfig;
use crate::error::BackendError;
use crate::traits::{DocumentBackend, LinkCandidate, LinkQuery};

const RENAME_METHOD: &str = "frappe.client.rename_doc";
const SEARCH_METHOD: &str = "frappe.desk.search.search_link";

/// [`DocumentBackend`] over HTTP.
#[derive(Debug, Clone)]
pub struct RestBackend {
    client: reqwest::Client,
    base: Url,
    auth: Option<String>,
}

impl RestBackend {
    /// # Errors
    ///
    /// Fails when `base_url` does not parse or the HTTP client cannot be built.
    pub fn new(config: &ClientConfig) -> anyhow::Result<Self> {
        let base = Url::parse(&config.base_url)?;
        if base.cannot_be_a_base() {
            anyhow::bail!("{} cannot be used as a base URL", config.base_url);
        }
        let client = reqwest::Client::builder().timeout(config.request_timeout).build()?;
        let auth = match (&config.api_key, &config.api_secret) {
            (Some(key), Some(secret)) => Some(format!("token {key}:{secret}")),
            _ => None,
        };
        Ok(Self { client, base, auth })
    }

    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        // Checked in `new`.
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn resource(&self, method: Method, doctype: &str, name: Option<&str>) -> RequestBuilder {
        let url = match name {
            Some(name) => self.url(&["api", "resource", doctype, name]),
            None => self.url(&["api", "resource", doctype]),
        };
        self.client.request(method, url)
    }

    fn method(&self, method: &str) -> RequestBuilder {
        self.client.post(self.url(&["api", "method", method]))
    }

    /// Sends a request and returns the parsed body, mapping error statuses
    /// onto [`BackendError`]. `doctype`/`name` only label not-found errors.
    async fn send(&self, request: RequestBuilder, doctype: &str, name: &str) -> Result<Value, BackendError> {
        let request = match &self.auth {
            Some(token) => request.header(AUTHORIZATION, token),
            None => request,
        };
        let response = request
            .send()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;
        tracing::debug!(status = status.as_u16(), doctype, name, "backend response");

        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            match serde_json::from_str::<Value>(&text) {
                Ok(body) => body,
                Err(e) if status.is_success() => return Err(BackendError::Decode(e.to_string())),
                Err(_) => json!({ "message": text }),
            }
        };
        if status.is_success() {
            Ok(body)
        } else {
            Err(BackendError::from_response(status.as_u16(), &body, doctype, name))
        }
    }
}

fn unwrap_key(body: Value, key: &str) -> Result<Value, BackendError> {
    match body {
        Value::Object(mut map) => map
            .remove(key)
            .ok_or_else(|| BackendError::Decode(format!("response has no `{key}`"))),
        other => Err(BackendError::Decode(format!("expected an object, got {other}"))),
    }
}

fn into_record(value: Value) -> Result<Values, BackendError> {
    match value {
        Value::Object(map) => Ok(map.into_iter().collect()),
        other => Err(BackendError::Decode(format!("expected a document, got {other}"))),
    }
}

#[async_trait]
impl DocumentBackend for RestBackend {
    async fn get_doc(&self, doctype: &str, name: &str) -> Result<Values, BackendError> {
        let body = self
            .send(self.resource(Method::GET, doctype, Some(name)), doctype, name)
            .await?;
        into_record(unwrap_key(body, "data")?)
    }

    async fn insert_doc(&self, doctype: &str, doc: &Values) -> Result<Values, BackendError> {
        let body = self
            .send(self.resource(Method::POST, doctype, None).json(doc), doctype, "")
            .await?;
        into_record(unwrap_key(body, "data")?)
    }

    async fn update_doc(
        &self,
        doctype: &str,
        name: &str,
        changes: &Values,
        modified: Option<&Value>,
    ) -> Result<Values, BackendError> {
        let mut body = changes.clone();
        if let Some(modified) = modified {
            body.insert("modified".to_string(), modified.clone());
        }
        let response = self
            .send(self.resource(Method::PUT, doctype, Some(name)).json(&body), doctype, name)
            .await?;
        into_record(unwrap_key(response, "data")?)
    }

    async fn rename_doc(&self, doctype: &str, from: &str, to: &str) -> Result<String, BackendError> {
        let args = json!({
            "doctype": doctype,
            "old_name": from,
            "new_name": to,
            "merge": false,
        });
        let body = self.send(self.method(RENAME_METHOD).json(&args), doctype, from).await?;
        let message = unwrap_key(body, "message")?;
        Ok(as_id(&message).unwrap_or_else(|| to.to_string()))
    }

    async fn search_link(&self, query: &LinkQuery) -> Result<Vec<LinkCandidate>, BackendError> {
        let body = self
            .send(self.method(SEARCH_METHOD).json(query), &query.doctype, &query.txt)
            .await?;
        let message = unwrap_key(body, "message")?;
        let mut candidates: Vec<LinkCandidate> =
            serde_json::from_value(message).map_err(|e| BackendError::Decode(e.to_string()))?;
        for candidate in &mut candidates {
            if candidate.label.is_empty() {
                candidate.label.clone_from(&candidate.value);
            }
        }
        Ok(candidates)
    }

    async fn call_method(&self, method: &str, args: &Value) -> Result<Value, BackendError> {
        let body = self.send(self.method(method).json(args), method, "").await?;
        match body {
            Value::Object(mut map) => Ok(map.remove("message").unwrap_or(Value::Null)),
            _ => Ok(Value::Null),
        }
    }

    async fn delete_doc(&self, doctype: &str, name: &str) -> Result<(), BackendError> {
        self.send(self.resource(Method::DELETE, doctype, Some(name)), doctype, name)
            .await?;
        Ok(())
    }
}
