//! Update detection against an in-process registry with a token endpoint.

use convoy_remote::{RegistryChain, RegistryConfig, RegistryError, RegistryKind};
use convoy_schema::PassthroughVault;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tiny_http::{Header, Method, Response, Server};

const TIMEOUT: Duration = Duration::from_secs(5);
const TOKEN: &str = "Bearer pull-token";
const REMOTE_DIGEST: &str = "sha256:2222222222222222222222222222222222222222222222222222222222222222";

fn header(name: &str, value: &str) -> Header {
    Header::from_bytes(name.as_bytes(), value.as_bytes()).unwrap()
}

/// Serves `team/app` with two pages of tags. Tag and manifest requests
/// need the token handed out by `/token`.
struct TaggedRegistry {
    url: String,
    seen: Arc<Mutex<Vec<String>>>,
    _server: Arc<Server>,
}

impl TaggedRegistry {
    fn start() -> Self {
        let server = Arc::new(Server::http("127.0.0.1:0").unwrap());
        let port = server.server_addr().to_ip().unwrap().port();
        let url = format!("http://127.0.0.1:{port}");
        let seen = Arc::new(Mutex::new(Vec::new()));

        let srv = Arc::clone(&server);
        let log = Arc::clone(&seen);
        let realm = format!("{url}/token");
        std::thread::spawn(move || {
            for request in srv.incoming_requests() {
                let authorized = request
                    .headers()
                    .iter()
                    .any(|h| h.field.equiv("Authorization") && h.value.as_str() == TOKEN);
                let head = *request.method() == Method::Head;
                let path = request.url().to_owned();
                log.lock().unwrap().push(format!("{} {path}", request.method()));

                let response = if path == "/v2/" {
                    let challenge = format!(r#"Bearer realm="{realm}",service="tagged""#);
                    Response::from_string("unauthorized")
                        .with_status_code(401)
                        .with_header(header("WWW-Authenticate", &challenge))
                } else if path.starts_with("/token") {
                    Response::from_string(r#"{"token":"pull-token"}"#)
                } else if !authorized {
                    Response::from_string("unauthorized").with_status_code(401)
                } else if path == "/v2/team/app/tags/list" {
                    Response::from_string(r#"{"name":"team/app","tags":["1.24","1.25","latest"]}"#)
                        .with_header(header(
                            "Link",
                            r#"</v2/team/app/tags/list?last=latest&n=3>; rel="next""#,
                        ))
                } else if path == "/v2/team/app/tags/list?last=latest&n=3" {
                    Response::from_string(r#"{"name":"team/app","tags":["1.26","1.27-rc","2.0.0"]}"#)
                } else if head && path == "/v2/team/app/manifests/latest" {
                    Response::from_string("")
                        .with_header(header("Docker-Content-Digest", REMOTE_DIGEST))
                } else {
                    Response::from_string("not found").with_status_code(404)
                };
                let _ = request.respond(response);
            }
        });

        Self {
            url,
            seen,
            _server: server,
        }
    }

    fn image(&self, rest: &str) -> String {
        format!("{}/{rest}", self.url.trim_start_matches("http://"))
    }

    fn chain(&self) -> RegistryChain {
        let config = RegistryConfig::new("corp", RegistryKind::Custom).with_url(&self.url);
        RegistryChain::from_configs(&[config], &PassthroughVault, TIMEOUT).unwrap()
    }
}

#[test]
fn newer_version_tag_is_found_across_pages() {
    let registry = TaggedRegistry::start();
    let update = registry
        .chain()
        .check_update(&registry.image("team/app:1.25"), None)
        .unwrap()
        .unwrap();
    assert!(update.available);
    assert_eq!(update.latest_tag, "1.26");

    let seen = registry.seen.lock().unwrap();
    assert!(seen.iter().any(|s| s.ends_with("?last=latest&n=3")), "{seen:?}");
}

#[test]
fn highest_tag_reports_no_update() {
    let registry = TaggedRegistry::start();
    let update = registry
        .chain()
        .check_update(&registry.image("team/app:2.0.0"), None)
        .unwrap()
        .unwrap();
    assert!(!update.available);
    assert_eq!(update.latest_tag, "2.0.0");
}

#[test]
fn moved_digest_is_an_update() {
    let registry = TaggedRegistry::start();
    let chain = registry.chain();
    let image = registry.image("team/app:latest");

    let stale = chain.check_update(&image, Some("sha256:1111")).unwrap().unwrap();
    assert!(stale.available);
    assert_eq!(stale.remote_digest.as_deref(), Some(REMOTE_DIGEST));

    let current = chain.check_update(&image, Some(REMOTE_DIGEST)).unwrap().unwrap();
    assert!(!current.available);
}

#[test]
fn digest_comparison_needs_a_local_digest() {
    let registry = TaggedRegistry::start();
    let update = registry
        .chain()
        .check_update(&registry.image("team/app:latest"), None)
        .unwrap();
    assert!(update.is_none());
    assert!(registry
        .seen
        .lock()
        .unwrap()
        .iter()
        .all(|s| !s.contains("/manifests/")));
}

#[test]
fn unknown_repository_is_an_http_error() {
    let registry = TaggedRegistry::start();
    let err = registry
        .chain()
        .check_update(&registry.image("team/other:1.0"), None)
        .unwrap_err();
    assert!(matches!(err, RegistryError::Http(_)), "{err}");
}
