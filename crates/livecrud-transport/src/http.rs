//! HTTP implementation of the auth and CRUD endpoint sets.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use livecrud_core::{
    ApiError, AuthApi, ClientConfig, Credential, CrudApi, LoginGrant, Principal, Record, RecordId,
    config::{ConfigError, Endpoints},
};
use reqwest::{
    Client, Method, RequestBuilder, StatusCode, Url,
    cookie::{CookieStore, Jar},
    header::ACCEPT,
};
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::{Value, json};

const CSRF_COOKIE: &str = "csrftoken";
const CSRF_HEADER: &str = "X-CSRFToken";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access: String,
    #[serde(default)]
    refresh: Option<String>,
    #[serde(default)]
    user: Option<Principal>,
}

/// REST backend reached over HTTP.
///
/// Cookies persist across calls in an in-process jar, which is where the
/// backend keeps the long-lived refresh credential and the anti-forgery
/// token.
pub struct HttpBackend {
    client: Client,
    jar: Arc<Jar>,
    base: Url,
    endpoints: Endpoints,
    /// Refresh token, when the backend hands it out in the body too.
    refresh_token: Mutex<Option<String>>,
}

impl HttpBackend {
    /// Create a backend rooted at `base_url` (e.g. `http://host/api/`).
    ///
    /// # Errors
    /// Returns error if `base_url` does not parse or the client cannot be
    /// built.
    pub fn new(base_url: &str, endpoints: Endpoints) -> Result<Self, ConfigError> {
        let invalid = || ConfigError::InvalidUrl {
            field: "api_base_url",
            value: base_url.to_string(),
        };
        let mut base = Url::parse(base_url).map_err(|_| invalid())?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let jar = Arc::new(Jar::default());
        let client = Client::builder()
            .cookie_provider(Arc::clone(&jar))
            .build()
            .map_err(|_| invalid())?;

        Ok(Self {
            client,
            jar,
            base,
            endpoints,
            refresh_token: Mutex::new(None),
        })
    }

    /// Create a backend from the client configuration.
    ///
    /// # Errors
    /// Returns error if the API URL is invalid.
    pub fn from_config(config: &ClientConfig) -> Result<Self, ConfigError> {
        Self::new(&config.api_base_url, config.endpoints.clone())
    }

    fn url(&self, path: &str) -> Result<Url, ApiError> {
        self.base
            .join(path)
            .map_err(|e| ApiError::Network(format!("Invalid URL {path}: {e}")))
    }

    /// The anti-forgery token from the cookie jar, if the backend set one.
    #[must_use]
    pub fn csrf_token(&self) -> Option<String> {
        let header = self.jar.cookies(&self.base)?;
        let cookies = header.to_str().ok()?;
        cookies.split(';').find_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            (name == CSRF_COOKIE).then(|| value.to_string())
        })
    }

    fn request(&self, method: Method, url: Url, token: Option<&str>, csrf: bool) -> RequestBuilder {
        let mut request = self
            .client
            .request(method.clone(), url)
            .header(ACCEPT, "application/json");
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        if csrf {
            match self.csrf_token() {
                Some(csrf) => request = request.header(CSRF_HEADER, csrf),
                None if method != Method::GET => {
                    tracing::warn!(%method, "No CSRF token available for a mutating request");
                }
                None => {}
            }
        }
        request
    }

    /// Send a request and map the response. `Ok(None)` means no content.
    async fn send(&self, request: RequestBuilder) -> Result<Option<Value>, ApiError> {
        let response = request
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;
        let status = response.status();
        tracing::debug!(url = %response.url(), status = status.as_u16(), "HTTP response");

        if status == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;
        let body = serde_json::from_slice::<Value>(&bytes);

        if status.is_success() {
            return body
                .map(Some)
                .map_err(|e| ApiError::Decode(e.to_string()));
        }
        Err(error_for(status, body.ok()))
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ApiError> {
        let body = self.send(request).await?.unwrap_or(Value::Null);
        serde_json::from_value(body).map_err(|e| ApiError::Decode(e.to_string()))
    }

    fn remember_refresh_token(&self, token: Option<String>) {
        if token.is_none() {
            return;
        }
        match self.refresh_token.lock() {
            Ok(mut slot) => *slot = token,
            Err(poisoned) => *poisoned.into_inner() = token,
        }
    }

    fn take_refresh_token(&self, clear: bool) -> Option<String> {
        let mut slot = match self.refresh_token.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        if clear { slot.take() } else { slot.clone() }
    }
}

fn error_for(status: StatusCode, body: Option<Value>) -> ApiError {
    match (status, body) {
        (StatusCode::UNAUTHORIZED, _) => ApiError::Unauthorized,
        (StatusCode::BAD_REQUEST, Some(Value::Object(fields))) => {
            ApiError::Validation(fields.into_iter().collect())
        }
        (status, body) => {
            let detail = body
                .as_ref()
                .and_then(|b| b.get("detail"))
                .and_then(Value::as_str)
                .map_or_else(
                    || status.canonical_reason().unwrap_or("unknown").to_string(),
                    str::to_string,
                );
            ApiError::Status {
                status: status.as_u16(),
                detail,
            }
        }
    }
}

/// Accept a bare array or a paginated `{"results": [...]}` page.
fn records_from(body: Value) -> Result<Vec<Record>, ApiError> {
    let list = match body {
        Value::Object(mut page) if page.contains_key("results") => {
            page.remove("results").unwrap_or_default()
        }
        other => other,
    };
    serde_json::from_value(list).map_err(|e| ApiError::Decode(e.to_string()))
}

#[async_trait]
impl AuthApi for HttpBackend {
    async fn login(&self, username: &str, password: &str) -> Result<LoginGrant, ApiError> {
        let url = self.url(&self.endpoints.login)?;
        let request = self
            .request(Method::POST, url, None, false)
            .json(&json!({ "username": username, "password": password }));
        let tokens: TokenResponse = self.send_json(request).await?;
        self.remember_refresh_token(tokens.refresh);

        let principal = tokens.user.unwrap_or_else(|| Principal {
            id: Value::Null,
            username: username.to_string(),
            email: None,
        });
        Ok(LoginGrant {
            credential: Credential::from_token(tokens.access),
            principal,
        })
    }

    async fn logout(&self, token: Option<&str>) -> Result<(), ApiError> {
        let url = self.url(&self.endpoints.logout)?;
        let mut request = self.request(Method::POST, url, token, true);
        if let Some(refresh) = self.take_refresh_token(true) {
            request = request.json(&json!({ "refresh": refresh }));
        }
        self.send(request).await.map(|_| ())
    }

    async fn verify(&self, token: &str) -> Result<(), ApiError> {
        let url = self.url(&self.endpoints.verify)?;
        let request = self
            .request(Method::POST, url, None, false)
            .json(&json!({ "token": token }));
        self.send(request).await.map(|_| ())
    }

    async fn refresh(&self) -> Result<Credential, ApiError> {
        let url = self.url(&self.endpoints.refresh)?;
        let mut request = self.request(Method::POST, url, None, true);
        if let Some(refresh) = self.take_refresh_token(false) {
            request = request.json(&json!({ "refresh": refresh }));
        }
        let tokens: TokenResponse = self.send_json(request).await?;
        self.remember_refresh_token(tokens.refresh);
        Ok(Credential::from_token(tokens.access))
    }
}

#[async_trait]
impl CrudApi for HttpBackend {
    async fn list(&self, token: Option<&str>) -> Result<Vec<Record>, ApiError> {
        let url = self.url(&self.endpoints.resource)?;
        let body = self
            .send(self.request(Method::GET, url, token, false))
            .await?
            .unwrap_or_else(|| Value::Array(Vec::new()));
        records_from(body)
    }

    async fn create(&self, token: &str, body: &Value) -> Result<Record, ApiError> {
        let url = self.url(&self.endpoints.resource)?;
        let request = self.request(Method::POST, url, Some(token), false).json(body);
        self.send_json(request).await
    }

    async fn update(&self, token: &str, id: &RecordId, patch: &Value) -> Result<Record, ApiError> {
        let url = self.url(&self.endpoints.record(id))?;
        let request = self
            .request(Method::PATCH, url, Some(token), false)
            .json(patch);
        self.send_json(request).await
    }

    async fn delete(&self, token: &str, id: &RecordId) -> Result<(), ApiError> {
        let url = self.url(&self.endpoints.record(id))?;
        self.send(self.request(Method::DELETE, url, Some(token), true))
            .await
            .map(|_| ())
    }
}
