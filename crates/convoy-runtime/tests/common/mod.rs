//! In-process HTTP double for runtime APIs.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io::Read;
use std::sync::{Arc, Mutex};
use tiny_http::{Response, Server};

#[derive(Debug, Clone)]
pub struct Captured {
    pub method: String,
    /// Request target without any API version prefix.
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: String,
}

/// Docker clients prefix every path with the API version (`/v1.47/_ping`).
fn unversioned(path: &str) -> &str {
    if let Some(rest) = path.strip_prefix("/v") {
        if let Some(i) = rest.find('/') {
            if i > 0 && rest[..i].chars().all(|c| c.is_ascii_digit() || c == '.') {
                return &rest[i..];
            }
        }
    }
    path
}

type Routes = Arc<Mutex<Vec<(String, String, u16, String)>>>;

/// Answers `(method, path)` with canned responses. Paths are matched
/// without their query string or a leading `/vX.Y` version segment; the
/// most recently added route wins.
pub struct FakeApi {
    pub port: u16,
    routes: Routes,
    captured: Arc<Mutex<Vec<Captured>>>,
    _server: Arc<Server>,
}

impl FakeApi {
    pub fn start() -> Self {
        let server = Arc::new(Server::http("127.0.0.1:0").unwrap());
        let port = server.server_addr().to_ip().unwrap().port();
        let routes: Routes = Arc::new(Mutex::new(Vec::new()));
        let captured = Arc::new(Mutex::new(Vec::new()));

        let srv = Arc::clone(&server);
        let table = Arc::clone(&routes);
        let log = Arc::clone(&captured);
        std::thread::spawn(move || {
            for mut request in srv.incoming_requests() {
                let method = request.method().to_string().to_uppercase();
                let url = unversioned(request.url()).to_owned();
                let path = url.split('?').next().unwrap_or_default().to_owned();
                let headers = request
                    .headers()
                    .iter()
                    .map(|h| {
                        (
                            h.field.as_str().as_str().to_ascii_lowercase(),
                            h.value.as_str().to_owned(),
                        )
                    })
                    .collect();
                let mut body = String::new();
                let _ = request.as_reader().read_to_string(&mut body);
                log.lock().unwrap().push(Captured {
                    method: method.clone(),
                    url,
                    headers,
                    body,
                });

                let found = table
                    .lock()
                    .unwrap()
                    .iter()
                    .rev()
                    .find(|(m, p, _, _)| *m == method && *p == path)
                    .map(|(_, _, status, body)| (*status, body.clone()));
                let (status, body) = found.unwrap_or((404, "{\"message\":\"no route\"}".to_owned()));
                let _ = request.respond(Response::from_string(body).with_status_code(status));
            }
        });

        Self {
            port,
            routes,
            captured,
            _server: server,
        }
    }

    pub fn route(&self, method: &str, path: &str, status: u16, body: &str) {
        self.routes.lock().unwrap().push((
            method.to_owned(),
            path.to_owned(),
            status,
            body.to_owned(),
        ));
    }

    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    pub fn requests(&self) -> Vec<Captured> {
        self.captured.lock().unwrap().clone()
    }

    /// Paths of every request made with `method`, in order.
    pub fn paths(&self, method: &str) -> Vec<String> {
        self.requests()
            .into_iter()
            .filter(|c| c.method == method)
            .map(|c| c.url.split('?').next().unwrap_or_default().to_owned())
            .collect()
    }

    pub fn requests_to(&self, method: &str, path_prefix: &str) -> Vec<Captured> {
        self.requests()
            .into_iter()
            .filter(|c| c.method == method && c.url.starts_with(path_prefix))
            .collect()
    }
}
