//! Blocking JSON client for HTTP runtime APIs (Proxmox VE).

use crate::connection::{ConnectionOptions, Transport};
use crate::RuntimeError;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;
use ureq::tls::TlsConfig;

/// Raw answer from the runtime API.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub body: String,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Blocking HTTP client bound to one runtime endpoint.
///
/// Owns the transport (an SSH tunnel, if any) so the endpoint stays
/// reachable for exactly as long as the client lives.
pub struct ApiClient {
    agent: ureq::Agent,
    base_url: String,
    headers: Vec<(String, String)>,
    _transport: Transport,
}

impl ApiClient {
    pub fn connect(options: ConnectionOptions) -> Result<Self, RuntimeError> {
        let base_url = options.endpoint.url().ok_or_else(|| {
            RuntimeError::Provider(format!(
                "{} API at {} is not reachable over HTTP",
                options.target, options.endpoint
            ))
        })?;
        let mut config = ureq::Agent::config_builder()
            .timeout_connect(Some(options.connect_timeout))
            .timeout_global(Some(options.request_timeout))
            .http_status_as_error(false);
        if options.accept_invalid_certs {
            config = config.tls_config(TlsConfig::builder().disable_verification(true).build());
        }
        Ok(Self {
            agent: ureq::Agent::new_with_config(config.build()),
            base_url,
            headers: Vec::new(),
            _transport: options.transport,
        })
    }

    /// Plain client without a managed transport, for endpoints that are
    /// reachable directly.
    pub fn plain(base_url: impl Into<String>, timeout: Duration) -> Self {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .build();
        Self {
            agent: ureq::Agent::new_with_config(config),
            base_url: base_url.into(),
            headers: Vec::new(),
            _transport: Transport::Direct,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Header sent with every request.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.push((name.into(), value.into()));
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    pub fn get(&self, path: &str, query: &[(&str, &str)]) -> Result<ApiResponse, RuntimeError> {
        let url = self.url(path);
        debug!("GET {url}");
        let mut req = self.agent.get(&url);
        for (k, v) in query {
            req = req.query(*k, *v);
        }
        for (k, v) in &self.headers {
            req = req.header(k.as_str(), v.as_str());
        }
        let resp = req.call().map_err(|e| transport_error(&url, &e))?;
        read_response(&url, resp)
    }

    pub fn post(&self, path: &str) -> Result<ApiResponse, RuntimeError> {
        let url = self.url(path);
        debug!("POST {url}");
        let mut req = self.agent.post(&url);
        for (k, v) in &self.headers {
            req = req.header(k.as_str(), v.as_str());
        }
        let resp = req.send_empty().map_err(|e| transport_error(&url, &e))?;
        read_response(&url, resp)
    }

    pub fn post_form(
        &self,
        path: &str,
        form: &[(&str, &str)],
    ) -> Result<ApiResponse, RuntimeError> {
        let url = self.url(path);
        debug!("POST {url} (form)");
        let mut req = self.agent.post(&url);
        for (k, v) in &self.headers {
            req = req.header(k.as_str(), v.as_str());
        }
        let resp = req
            .send_form(form.iter().copied())
            .map_err(|e| transport_error(&url, &e))?;
        read_response(&url, resp)
    }

    /// GET and decode a JSON body, mapping error statuses.
    pub fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, RuntimeError> {
        let resp = check(path, self.get(path, query)?)?;
        serde_json::from_str(&resp.body)
            .map_err(|e| RuntimeError::Provider(format!("{path}: invalid JSON: {e}")))
    }
}

/// Map non-2xx statuses to the runtime error taxonomy.
pub fn check(path: &str, resp: ApiResponse) -> Result<ApiResponse, RuntimeError> {
    match resp.status {
        s if (200..300).contains(&s) => Ok(resp),
        401 | 403 => Err(RuntimeError::Credential(format!(
            "{path}: HTTP {}: {}",
            resp.status,
            summarize(&resp.body)
        ))),
        404 => Err(RuntimeError::NotFound(path.to_owned())),
        s => Err(RuntimeError::Provider(format!(
            "{path}: HTTP {s}: {}",
            summarize(&resp.body)
        ))),
    }
}

/// First line of an error body, bounded.
fn summarize(body: &str) -> String {
    let line = body.lines().next().unwrap_or_default().trim();
    if line.len() > 200 {
        let mut end = 200;
        while !line.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &line[..end])
    } else {
        line.to_owned()
    }
}

fn read_response(
    url: &str,
    mut resp: ureq::http::Response<ureq::Body>,
) -> Result<ApiResponse, RuntimeError> {
    let status = resp.status().as_u16();
    let body = resp
        .body_mut()
        .read_to_string()
        .map_err(|e| transport_error(url, &e))?;
    Ok(ApiResponse { status, body })
}

fn transport_error(url: &str, err: &ureq::Error) -> RuntimeError {
    RuntimeError::Connectivity(format!("{url}: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resp(status: u16, body: &str) -> ApiResponse {
        ApiResponse {
            status,
            body: body.to_owned(),
        }
    }

    #[test]
    fn status_mapping() {
        assert!(check("/x", resp(204, "")).is_ok());
        assert!(matches!(
            check("/x", resp(401, "no ticket")),
            Err(RuntimeError::Credential(_))
        ));
        assert!(matches!(
            check("/x", resp(404, "")),
            Err(RuntimeError::NotFound(_))
        ));
        let err = check("/x", resp(500, "{\"message\":\"boom\"}\nmore")).unwrap_err();
        assert!(err.to_string().contains("boom"));
        assert!(!err.to_string().contains("more"));
    }

    #[test]
    fn summarize_bounds_long_bodies() {
        let long = "é".repeat(300);
        let s = summarize(&long);
        assert!(s.ends_with("..."));
        assert!(s.len() <= 204);
    }

    #[test]
    fn unreachable_endpoint_is_connectivity_error() {
        let client = ApiClient::plain("http://127.0.0.1:9", Duration::from_secs(2));
        assert!(matches!(
            client.get("/_ping", &[]),
            Err(RuntimeError::Connectivity(_))
        ));
    }
}
