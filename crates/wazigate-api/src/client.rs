// Async HTTP client for the Waziup cloud REST API (v2).
//
// Auth: `POST /auth/token` returns a bearer token as plain text; every
// later request carries `Authorization: Bearer {token}`.

use std::sync::{PoisonError, RwLock};

use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderValue};
use reqwest::{RequestBuilder, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;
use url::Url;

use crate::error::Error;
use crate::models::{Gateway, NewDevice, NewEntity, RemoteDevice, TokenRequest, ValuePoint};
use crate::transport::{TransportConfig, id_compat};

const JSON_UTF8: &str = "application/json; charset=utf-8";
const TEXT_UTF8: &str = "text/plain; charset=utf-8";

/// Kind of child entity on a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Sensor,
    Actuator,
}

impl EntityKind {
    /// Path segment of the collection (`sensors` or `actuators`).
    pub fn collection(self) -> &'static str {
        match self {
            Self::Sensor => "sensors",
            Self::Actuator => "actuators",
        }
    }
}

// ── Client ───────────────────────────────────────────────────────────

/// Async client for one cloud.
///
/// Holds the bearer token obtained by [`authenticate`](Self::authenticate);
/// requests made before that go out unauthenticated.
pub struct CloudClient {
    http: reqwest::Client,
    base_url: Url,
    token: RwLock<Option<SecretString>>,
}

impl CloudClient {
    // ── Constructors ─────────────────────────────────────────────────

    pub fn new(base_url: &str, transport: &TransportConfig) -> Result<Self, Error> {
        Self::from_reqwest(base_url, transport.build_client()?)
    }

    /// Wrap an existing `reqwest::Client`.
    pub fn from_reqwest(base_url: &str, http: reqwest::Client) -> Result<Self, Error> {
        let base_url = Url::parse(base_url)?;
        if base_url.cannot_be_a_base() {
            return Err(Error::UnsupportedBaseUrl(base_url.into()));
        }
        Ok(Self {
            http,
            base_url,
            token: RwLock::new(None),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn has_token(&self) -> bool {
        self.token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn set_token(&self, token: Option<SecretString>) {
        *self.token.write().unwrap_or_else(PoisonError::into_inner) = token;
    }

    // ── URL builder ──────────────────────────────────────────────────

    /// Append path segments to the base URL; segments are percent-encoded.
    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn authorize(&self, req: RequestBuilder) -> RequestBuilder {
        let token = self.token.read().unwrap_or_else(PoisonError::into_inner);
        match token.as_ref() {
            Some(token) => match HeaderValue::from_str(&format!("Bearer {}", token.expose_secret())) {
                Ok(mut value) => {
                    value.set_sensitive(true);
                    req.header(AUTHORIZATION, value)
                }
                Err(_) => req,
            },
            None => req,
        }
    }

    // ── HTTP verbs ───────────────────────────────────────────────────

    async fn get<T: DeserializeOwned>(&self, segments: &[&str]) -> Result<T, Error> {
        let url = self.url(segments);
        debug!("GET {url}");

        let resp = self.authorize(self.http.get(url)).send().await?;
        Self::handle_response(resp).await
    }

    async fn post<B: Serialize + Sync>(&self, segments: &[&str], body: &B) -> Result<(), Error> {
        let url = self.url(segments);
        debug!("POST {url}");

        let resp = self.authorize(self.http.post(url)).json(body).send().await?;
        Self::handle_empty(resp).await
    }

    async fn put_text(&self, segments: &[&str], text: &str) -> Result<(), Error> {
        let url = self.url(segments);
        debug!("PUT {url}");

        let resp = self
            .authorize(self.http.put(url))
            .header(CONTENT_TYPE, TEXT_UTF8)
            .body(text.to_owned())
            .send()
            .await?;
        Self::handle_empty(resp).await
    }

    // ── Response handling ────────────────────────────────────────────

    async fn handle_response<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, Error> {
        let status = resp.status();
        if status.is_success() {
            let body = resp.text().await?;
            serde_json::from_str(&body).map_err(|e| {
                let preview = &body[..body.len().min(200)];
                Error::Deserialization {
                    message: format!("{e} (body preview: {preview:?})"),
                    body,
                }
            })
        } else {
            Err(Self::parse_error(status, resp).await)
        }
    }

    async fn handle_empty(resp: reqwest::Response) -> Result<(), Error> {
        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(Self::parse_error(status, resp).await)
        }
    }

    async fn parse_error(status: StatusCode, resp: reqwest::Response) -> Error {
        let raw = resp.text().await.unwrap_or_default();
        let message = if raw.trim().is_empty() {
            status.to_string()
        } else {
            raw.trim().to_owned()
        };
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            Error::Authentication {
                status: status.as_u16(),
                message,
            }
        } else {
            Error::Api {
                status: status.as_u16(),
                message,
            }
        }
    }

    // ━━ Public API ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    // ── Auth ─────────────────────────────────────────────────────────

    /// Exchange credentials for a bearer token without storing it.
    pub async fn request_token(
        &self,
        username: &str,
        password: &SecretString,
    ) -> Result<SecretString, Error> {
        let url = self.url(&["auth", "token"]);
        debug!("POST {url}");

        let body = TokenRequest {
            username,
            password: password.expose_secret(),
        };
        let resp = self.http.post(url).json(&body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Self::parse_error(status, resp).await);
        }
        let token = resp.text().await?;
        let token = token.trim().trim_matches('"');
        if token.is_empty() {
            return Err(Error::InvalidToken);
        }
        Ok(SecretString::from(token.to_owned()))
    }

    /// Obtain a token and use it for every following request.
    pub async fn authenticate(&self, username: &str, password: &SecretString) -> Result<(), Error> {
        let token = self.request_token(username, password).await?;
        self.set_token(Some(token));
        Ok(())
    }

    // ── Gateways ─────────────────────────────────────────────────────

    /// Register the gateway. `422` means it is registered already and is
    /// not an error.
    pub async fn register_gateway(&self, gateway: &Gateway) -> Result<(), Error> {
        match self.post(&["gateways"], gateway).await {
            Err(Error::Api { status: 422, .. }) => {
                debug!(gateway = %gateway.id, "gateway already registered");
                Ok(())
            }
            other => other,
        }
    }

    pub async fn set_gateway_name(&self, gateway_id: &str, name: &str) -> Result<(), Error> {
        let id = id_compat(gateway_id);
        self.put_text(&["gateways", &id, "name"], name).await
    }

    // ── Devices ──────────────────────────────────────────────────────

    /// Fetch a device document; `None` when the cloud does not know it.
    pub async fn get_device(&self, device_id: &str) -> Result<Option<RemoteDevice>, Error> {
        let id = id_compat(device_id);
        match self.get(&["devices", &id]).await {
            Ok(device) => Ok(Some(device)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn create_device(&self, device: &NewDevice) -> Result<(), Error> {
        let mut device = device.clone();
        device.id = id_compat(&device.id);
        self.post(&["devices"], &device).await
    }

    pub async fn set_device_name(&self, device_id: &str, name: &str) -> Result<(), Error> {
        let id = id_compat(device_id);
        self.put_text(&["devices", &id, "name"], name).await
    }

    // ── Sensors & actuators ──────────────────────────────────────────

    pub async fn create_entity(
        &self,
        device_id: &str,
        kind: EntityKind,
        entity: &NewEntity,
    ) -> Result<(), Error> {
        let id = id_compat(device_id);
        let entity = NewEntity {
            id: id_compat(&entity.id),
            name: entity.name.clone(),
        };
        self.post(&["devices", &id, kind.collection()], &entity).await
    }

    pub async fn set_entity_name(
        &self,
        device_id: &str,
        kind: EntityKind,
        entity_id: &str,
        name: &str,
    ) -> Result<(), Error> {
        let device = id_compat(device_id);
        let entity = id_compat(entity_id);
        self.put_text(&["devices", &device, kind.collection(), &entity, "name"], name)
            .await
    }

    // ── Values ───────────────────────────────────────────────────────

    /// Push sensor values as a JSON array with one element per line.
    pub async fn push_values(
        &self,
        device_id: &str,
        sensor_id: &str,
        values: &[ValuePoint],
    ) -> Result<(), Error> {
        let device = id_compat(device_id);
        let sensor = id_compat(sensor_id);
        let url = self.url(&["devices", &device, "sensors", &sensor, "values"]);
        debug!("POST {url} ({} values)", values.len());

        let body = encode_values(values)?;
        let resp = self
            .authorize(self.http.post(url))
            .header(CONTENT_TYPE, JSON_UTF8)
            .body(body)
            .send()
            .await?;
        Self::handle_empty(resp).await
    }
}

/// `[` newline, one JSON object per line joined by `,`, newline `]`.
pub fn encode_values(values: &[ValuePoint]) -> Result<String, Error> {
    let mut body = String::from("[\n");
    for (i, point) in values.iter().enumerate() {
        if i > 0 {
            body.push_str(",\n");
        }
        body.push_str(&serde_json::to_string(point)?);
    }
    body.push_str("\n]");
    Ok(body)
}
