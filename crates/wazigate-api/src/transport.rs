// Transport configuration and cloud address helpers.
//
// The cloud record stores free-form URLs typed by the user. These helpers
// turn them into the REST base URL and the MQTT `host:port` the
// synchronizer dials.

use std::time::Duration;

use url::Url;

use crate::error::Error;

const DEFAULT_MQTT_PORT: u16 = 1883;

/// Shared transport configuration for building HTTP clients.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: concat!("wazigate/", env!("CARGO_PKG_VERSION")).to_owned(),
        }
    }
}

impl TransportConfig {
    /// Build a `reqwest::Client` from this config.
    pub fn build_client(&self) -> Result<reqwest::Client, Error> {
        reqwest::Client::builder()
            .timeout(self.timeout)
            .user_agent(&self.user_agent)
            .build()
            .map_err(Error::Transport)
    }
}

// ── Address normalization ────────────────────────────────────────────

/// Parse a user-supplied address, defaulting the scheme to `default_scheme`.
///
/// Accepts `//host/path`, `host/path` and full URLs.
fn parse_with_scheme(raw: &str, default_scheme: &str) -> Result<Url, Error> {
    let raw = raw.trim();
    let candidate = if raw.contains("://") {
        raw.to_owned()
    } else {
        format!("{default_scheme}://{}", raw.trim_start_matches("//"))
    };
    Ok(Url::parse(&candidate)?)
}

/// REST base address of a cloud: scheme defaults to `https`, query and
/// fragment are dropped, a trailing `/` is removed.
pub fn rest_addr(raw: &str) -> Result<String, Error> {
    let mut url = parse_with_scheme(raw, "https")?;
    url.set_query(None);
    url.set_fragment(None);
    Ok(url.as_str().trim_end_matches('/').to_owned())
}

/// `host:port` of the cloud MQTT broker.
///
/// Uses the host of `mqtt` when given, else the host of `rest`; the port
/// defaults to 1883.
pub fn mqtt_addr(rest: &str, mqtt: Option<&str>) -> Result<String, Error> {
    let source = mqtt.filter(|m| !m.trim().is_empty()).unwrap_or(rest);
    let url = parse_with_scheme(source, "mqtt")?;
    let host = url
        .host_str()
        .ok_or_else(|| Error::UnsupportedBaseUrl(source.to_owned()))?;
    // `Url::port` hides the scheme's default port; only an explicit one counts.
    let port = url.port().unwrap_or(DEFAULT_MQTT_PORT);
    Ok(format!("{host}:{port}"))
}

/// Identifiers on the cloud side may not contain spaces.
pub fn id_compat(id: &str) -> String {
    id.replace(' ', "_")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn rest_addr_defaults_and_trims() {
        assert_eq!(
            rest_addr("//api.waziup.io/api/v2").unwrap(),
            "https://api.waziup.io/api/v2"
        );
        assert_eq!(
            rest_addr("api.waziup.io/api/v2/?x=1#top").unwrap(),
            "https://api.waziup.io/api/v2"
        );
        assert_eq!(
            rest_addr("http://localhost:8080/").unwrap(),
            "http://localhost:8080"
        );
    }

    #[test]
    fn mqtt_addr_falls_back_to_rest_host() {
        assert_eq!(
            mqtt_addr("https://api.waziup.io/api/v2", None).unwrap(),
            "api.waziup.io:1883"
        );
        assert_eq!(
            mqtt_addr("https://api.waziup.io/api/v2", Some("")).unwrap(),
            "api.waziup.io:1883"
        );
        assert_eq!(
            mqtt_addr("https://api.waziup.io", Some("tcp://broker.local:2883")).unwrap(),
            "broker.local:2883"
        );
        assert_eq!(
            mqtt_addr("//api.waziup.io/api/v2", Some("broker.local")).unwrap(),
            "broker.local:1883"
        );
    }

    #[test]
    fn ids_lose_their_spaces() {
        assert_eq!(id_compat("my device 1"), "my_device_1");
        assert_eq!(id_compat("plain"), "plain");
    }
}
