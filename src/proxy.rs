//! HTTP edge: forwards every request to the backend and splices rendered
//! content into HTML responses on routes that ask for it.
//!
//! For a GET on a rendering route the render is triggered *before* the
//! backend request goes out, so the browser and the backend work in
//! parallel; the response is held only until the render is published.

use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::header::{self, HeaderMap, HeaderName};
use axum::http::request::Parts;
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use lol_html::html_content::ContentType;
use lol_html::{element, rewrite_str, RewriteStrSettings, Selector};
use log::{debug, info, warn};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use url::Url;

use crate::cache::{RenderedPage, RequestKey};
use crate::coordinator::Coordinator;
use crate::route::{Route, RouteTable};
use crate::{Error, Result};

/// Headers that describe a single connection and are never forwarded.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Shared state of the proxy handlers.
#[derive(Clone)]
pub struct ProxyState {
    coordinator: Arc<Coordinator>,
    routes: Arc<RouteTable>,
    backend: Arc<Url>,
    client: reqwest::Client,
}

impl ProxyState {
    pub fn new(coordinator: Arc<Coordinator>, routes: RouteTable, backend: Url) -> Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            coordinator,
            routes: Arc::new(routes),
            backend: Arc::new(backend),
            client,
        })
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }
}

pub fn build_router(state: ProxyState) -> Router {
    Router::new().fallback(forward).with_state(state)
}

/// Serves the proxy on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: ProxyState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!("Proxy listening on {} -> {}", addr, state.backend);
    }
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn forward(State(state): State<ProxyState>, request: Request) -> Response {
    match proxy_request(&state, request).await {
        Ok(response) => response,
        Err(err) => {
            warn!("Proxy error: {}", err);
            (StatusCode::BAD_GATEWAY, err.to_string()).into_response()
        }
    }
}

async fn proxy_request(state: &ProxyState, request: Request) -> Result<Response> {
    let (parts, body) = request.into_parts();
    let target = backend_target(&state.backend, &parts);
    debug!("{} {} -> {}", parts.method, parts.uri, target);

    let route = state
        .routes
        .match_path(parts.uri.path())
        .filter(|route| route.renders() && parts.method == Method::GET);

    let render = match route.map(|route| (inbound_url(&parts, &state.backend), route)) {
        Some((Ok(inbound), route)) => {
            let key = RequestKey::from_url(&inbound);
            state
                .coordinator
                .trigger_render(key.clone(), target.clone(), Arc::clone(&route));
            Some((key, route))
        }
        Some((Err(err), _)) => {
            warn!("Not rendering {}: {}", parts.uri, err);
            None
        }
        None => None,
    };

    let body = to_bytes(body, usize::MAX)
        .await
        .map_err(|e| Error::NetworkError(format!("Failed to read request body: {}", e)))?;
    let upstream = state
        .client
        .request(parts.method.clone(), target)
        .headers(request_headers(&parts.headers, render.is_some()))
        .body(body)
        .send()
        .await?;

    let status = upstream.status();
    let mut headers = response_headers(upstream.headers());
    let mut bytes = upstream.bytes().await?.to_vec();

    if let Some((key, route)) = render {
        if status.is_success() && is_html(&headers) {
            if let Some(page) = state.coordinator.await_render(&key).await {
                bytes = augment(bytes, &route, &page, &key);
                headers.remove(header::ETAG);
            }
        }
    }

    let mut response = Response::new(Body::from(bytes));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    Ok(response)
}

/// Returns the spliced document, or `body` untouched when there is nothing
/// to splice or it cannot be rewritten.
fn augment(body: Vec<u8>, route: &Route, page: &RenderedPage, key: &RequestKey) -> Vec<u8> {
    if page.is_empty() {
        debug!("No render for {}; passing backend response through", key);
        return body;
    }
    let html = match String::from_utf8(body) {
        Ok(html) => html,
        Err(err) => {
            warn!("Response for {} is not UTF-8; passing through", key);
            return err.into_bytes();
        }
    };
    match splice(&html, route, page) {
        Ok(spliced) => spliced.into_bytes(),
        Err(err) => {
            warn!("Failed to splice render into {}: {}", key, err);
            html.into_bytes()
        }
    }
}

/// Injects `page` into `html`: the preview markup at the end of `<head>` when
/// the route has `ogp`, the rendered fragment as the content of the body
/// selector when it has `ssr`.
pub fn splice(html: &str, route: &Route, page: &RenderedPage) -> Result<String> {
    let mut handlers = Vec::new();

    if route.ogp && !page.metadata.is_empty() {
        handlers.push(element!("head", |el| {
            el.append(&page.metadata, ContentType::Html);
            Ok(())
        }));
    }

    if route.ssr && !page.inner_html.is_empty() {
        // element! unwraps the parse; reject bad selectors first
        route.body_selector.parse::<Selector>().map_err(|e| {
            Error::RenderError(format!("Invalid selector {:?}: {}", route.body_selector, e))
        })?;
        handlers.push(element!(route.body_selector.as_str(), |el| {
            el.set_inner_content(&page.inner_html, ContentType::Html);
            Ok(())
        }));
    }

    if handlers.is_empty() {
        return Ok(html.to_string());
    }

    rewrite_str(
        html,
        RewriteStrSettings {
            element_content_handlers: handlers,
            ..RewriteStrSettings::default()
        },
    )
    .map_err(|e| Error::RenderError(e.to_string()))
}

/// Same path and query, on the backend's scheme and authority.
fn backend_target(backend: &Url, parts: &Parts) -> Url {
    let mut target = backend.clone();
    target.set_path(parts.uri.path());
    target.set_query(parts.uri.query());
    target
}

/// The URL the client asked for, reconstructed from the request line and
/// `Host` header.
fn inbound_url(parts: &Parts, backend: &Url) -> Result<Url> {
    let host = parts
        .headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| parts.uri.authority().map(|a| a.as_str()))
        .or_else(|| backend.host_str())
        .unwrap_or("localhost");
    let scheme = parts
        .headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .filter(|proto| matches!(*proto, "http" | "https"))
        .unwrap_or("http");
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    Url::parse(&format!("{}://{}{}", scheme, host, path_and_query))
        .map_err(|e| Error::Other(format!("Invalid inbound URL: {}", e)))
}

fn request_headers(inbound: &HeaderMap, rendering: bool) -> HeaderMap {
    let mut headers = without_hop_by_hop(inbound);
    headers.remove(header::HOST);
    headers.remove(header::CONTENT_LENGTH);
    if rendering {
        // the body must arrive uncompressed to be rewritten
        headers.remove(header::ACCEPT_ENCODING);
    }
    if let Some(host) = inbound.get(header::HOST) {
        headers.insert(HeaderName::from_static("x-forwarded-host"), host.clone());
    }
    headers
}

fn response_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut headers = without_hop_by_hop(upstream);
    // recomputed from the final body
    headers.remove(header::CONTENT_LENGTH);
    headers
}

fn without_hop_by_hop(source: &HeaderMap) -> HeaderMap {
    let listed: Vec<String> = source
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .collect();

    let mut headers = HeaderMap::with_capacity(source.len());
    for (name, value) in source {
        let lower = name.as_str();
        if HOP_BY_HOP.contains(&lower) || listed.iter().any(|l| l == lower) {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers
}

fn is_html(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim_start().to_ascii_lowercase().starts_with("text/html"))
        .unwrap_or(false)
}
