//! Request-routing semantics for the embedded HTTP server: the captive redirect dance on
//! `/`, the `/wifidog/auth` login flow, and the small diagnostic endpoints.
//!
//! [`HttpFront::handle`] is pure with respect to its [`RequestContext`] input and
//! produces an [`HttpResponse`] value, so the redirect/auth logic is testable without a
//! running server. [`serve`] is the thin adapter wiring a `tiny_http::Server` to it.

use std::collections::HashMap;
use std::fs;
use std::sync::Arc;
use std::time::Duration;

use url::form_urlencoded;

use crate::auth_client::{AuthClient, AuthTransport, Verdict};
use crate::client_table::ClientTable;
use crate::command::ClientSummary;
use crate::config::{AuthServerConfig, Config};
use crate::firewall::FirewallBackend;
use crate::lifecycle;

/// Abstraction over MAC resolution so request handling can be tested without a kernel
/// ARP table.
pub trait ArpResolver: Send + Sync {
    fn resolve_mac(&self, ip: &str) -> Option<String>;
}

/// Reads `/proc/net/arp`, matching the original gateway's ARP lookup mechanism.
pub struct ProcNetArpResolver;

impl ArpResolver for ProcNetArpResolver {
    fn resolve_mac(&self, ip: &str) -> Option<String> {
        let content = fs::read_to_string("/proc/net/arp").ok()?;
        content.lines().skip(1).find_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            (cols.len() >= 4 && cols[0] == ip).then(|| cols[3].to_string())
        })
    }
}

#[derive(Clone, Debug)]
pub struct RequestContext {
    pub path: String,
    pub query: HashMap<String, String>,
    pub host: Option<String>,
    pub remote_ip: String,
}

#[derive(Clone, Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl HttpResponse {
    fn redirect(location: String, body: String) -> Self {
        HttpResponse { status: 307, headers: vec![("Location".to_string(), location)], body }
    }

    fn text(status: u16, body: impl Into<String>) -> Self {
        HttpResponse { status, headers: Vec::new(), body: body.into() }
    }
}

fn original_url(ctx: &RequestContext) -> String {
    let host = ctx.host.clone().unwrap_or_default();
    let mut url = format!("http://{host}{}", ctx.path);
    if !ctx.query.is_empty() {
        let qs = form_urlencoded::Serializer::new(String::new()).extend_pairs(ctx.query.iter()).finish();
        url.push('?');
        url.push_str(&qs);
    }
    url
}

/// Builds the `Location` header the auth server's login page expects.
fn captive_redirect_location(server: &AuthServerConfig, config: &Config, original_url: &str) -> String {
    let scheme = if server.use_ssl { "https" } else { "http" };
    let port = if server.use_ssl { server.ssl_port } else { server.http_port };
    let encoded_url: String = form_urlencoded::byte_serialize(original_url.as_bytes()).collect();
    format!(
        "{scheme}://{}:{port}{}login?gw_address={}&gw_port={}&gw_id={}&url={encoded_url}",
        server.host, server.base_path, config.gateway_address, config.gateway_port, config.gateway_id
    )
}

pub struct HttpFront<T: AuthTransport = crate::auth_client::ReqwestTransport> {
    config: Arc<Config>,
    table: Arc<ClientTable>,
    auth: Arc<AuthClient<T>>,
    firewall: Arc<dyn FirewallBackend>,
    arp: Arc<dyn ArpResolver>,
}

impl<T: AuthTransport> HttpFront<T> {
    pub fn new(
        config: Arc<Config>,
        table: Arc<ClientTable>,
        auth: Arc<AuthClient<T>>,
        firewall: Arc<dyn FirewallBackend>,
        arp: Arc<dyn ArpResolver>,
    ) -> Self {
        HttpFront { config, table, auth, firewall, arp }
    }

    pub fn handle(&self, ctx: &RequestContext) -> HttpResponse {
        match ctx.path.as_str() {
            "/wifidog/about" => self.about(),
            "/wifidog/auth" => self.auth(ctx),
            "/wifidog/ping" => self.ping(),
            "/wifidog/status" => self.status(),
            _ => self.captive_redirect(ctx),
        }
    }

    /// Plain-text liveness probe. `AuthClient::ping` is the opposite direction — this
    /// answers whatever is probing the gateway itself, not the gateway probing the auth
    /// server.
    fn ping(&self) -> HttpResponse {
        HttpResponse::text(200, "Pong")
    }

    fn captive_redirect(&self, ctx: &RequestContext) -> HttpResponse {
        let server = match self.auth.current_servers().into_iter().next() {
            Some(s) => s,
            None => return HttpResponse::text(503, "no auth server configured"),
        };
        let location = captive_redirect_location(&server, &self.config, &original_url(ctx));
        let body = format!(
            "<html><body>Please authenticate yourself <a href=\"{location}\">here</a>.</body></html>"
        );
        HttpResponse::redirect(location, body)
    }

    fn about(&self) -> HttpResponse {
        HttpResponse::text(
            200,
            format!(
                "<html><body>{} - wifidog-compatible captive portal gateway</body></html>",
                self.config.httpd_name
            ),
        )
    }

    fn status(&self) -> HttpResponse {
        let mut body = String::new();
        for client in self.table.iter_snapshot() {
            let summary = ClientSummary::from(&client);
            body.push_str(&format!(
                "{} {} {} in={} out={} gw={}\n",
                summary.ip, summary.mac, summary.mark, summary.incoming, summary.outgoing, summary.to_gateway
            ));
        }
        HttpResponse::text(200, body)
    }

    fn auth(&self, ctx: &RequestContext) -> HttpResponse {
        let token = match ctx.query.get("token").filter(|t| !t.is_empty()) {
            Some(token) => token.clone(),
            None => return HttpResponse::text(200, "Invalid token"),
        };

        let mac = match self.arp.resolve_mac(&ctx.remote_ip) {
            Some(mac) => mac,
            None => return HttpResponse::text(200, "Failed to retrieve your MAC address"),
        };

        tracing::debug!(ip = %ctx.remote_ip, mac = %mac, token = %token, "incoming auth request");

        let client = match self.table.append(&ctx.remote_ip, &mac, &token) {
            Ok(client) => client,
            Err(e) => {
                tracing::debug!(error = %e, ip = %ctx.remote_ip, "client table rejected auth request");
                return self.captive_redirect(ctx);
            }
        };

        let verdict = self.auth.login(&token, &ctx.remote_ip, &mac);
        match lifecycle::apply_verdict(&self.table, self.firewall.as_ref(), &client, verdict) {
            lifecycle::Outcome::Allowed => HttpResponse::text(200, "<html><body>Internet access granted. Enjoy.</body></html>"),
            _ => self.captive_redirect(ctx),
        }
    }
}

fn query_from_str(query_str: &str) -> HashMap<String, String> {
    form_urlencoded::parse(query_str.as_bytes()).into_owned().collect()
}

fn build_context(request: &tiny_http::Request) -> RequestContext {
    let full = request.url();
    let (path, query_str) = full.split_once('?').unwrap_or((full, ""));
    let host = request
        .headers()
        .iter()
        .find(|h| h.field.as_str().as_str().eq_ignore_ascii_case("host"))
        .map(|h| h.value.as_str().to_string());
    let remote_ip = request.remote_addr().map(|addr| addr.ip().to_string()).unwrap_or_default();

    RequestContext { path: path.to_string(), query: query_from_str(query_str), host, remote_ip }
}

fn respond(request: tiny_http::Request, response: HttpResponse) {
    let mut http_response =
        tiny_http::Response::from_string(response.body).with_status_code(tiny_http::StatusCode(response.status));
    for (name, value) in &response.headers {
        if let Ok(header) = tiny_http::Header::from_bytes(name.as_bytes(), value.as_bytes()) {
            http_response.add_header(header);
        }
    }
    if let Err(e) = request.respond(http_response) {
        tracing::warn!(error = %e, "failed writing http response");
    }
}

/// Runs the embedded single-threaded HTTP server until `stop` fires. Accept timeouts are
/// short so the stop flag is observed promptly on shutdown.
pub fn serve<T: AuthTransport + 'static>(
    server: tiny_http::Server,
    front: Arc<HttpFront<T>>,
    stop: crossbeam_channel::Receiver<()>,
) {
    loop {
        match server.recv_timeout(Duration::from_millis(500)) {
            Ok(Some(request)) => {
                let ctx = build_context(&request);
                let response = front.handle(&ctx);
                respond(request, response);
            }
            Ok(None) => {
                if stop.try_recv().is_ok() {
                    return;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "error receiving http request");
            }
        }
    }
}
