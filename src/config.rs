//! Proxy configuration loaded from TOML.
//!
//! ```toml
//! domain = "example.com"
//! proxy_address = "0.0.0.0:8080"
//! backend_server = "http://127.0.0.1:3000"
//! site_name = "Example"
//! site_owner = "Jo Writer"
//! site_logo_url = "https://example.com/logo.png"
//!
//! [route.post]
//! path = "/posts/:id"
//! body_selector = "article"
//! ogp = true
//! ssr = true
//!
//! [render]
//! task_timeout = "5s"
//! queue_capacity = 10
//! cache_ttl = "1h"
//! ```

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use url::Url;

use crate::cache::DEFAULT_CACHE_TTL;
use crate::coordinator::CoordinatorOptions;
use crate::preview::SiteProfile;
use crate::route::{Route, RouteTable, DEFAULT_BODY_SELECTOR};
use crate::worker::{WorkerOptions, DEFAULT_QUEUE_CAPACITY, DEFAULT_TASK_TIMEOUT};
use crate::{EngineConfig, Error, Result, Viewport};

/// Address the proxy listens on when the file does not say.
pub const DEFAULT_PROXY_ADDRESS: &str = "127.0.0.1:8080";

fn default_proxy_address() -> String {
    DEFAULT_PROXY_ADDRESS.to_string()
}

/// Top-level configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// Public domain of the site, used for `twitter:domain`.
    #[serde(default)]
    pub domain: String,
    #[serde(default = "default_proxy_address")]
    pub proxy_address: String,
    /// Base URL every request is forwarded to.
    pub backend_server: String,
    #[serde(default)]
    pub site_name: String,
    #[serde(default)]
    pub site_owner: String,
    /// Fallback preview image.
    #[serde(default)]
    pub site_logo_url: String,
    #[serde(default)]
    pub twitter_id: Option<String>,
    #[serde(default)]
    pub facebook_app_id: Option<String>,
    /// `[route.<name>]` tables keyed by route name.
    #[serde(default, rename = "route")]
    pub routes: BTreeMap<String, Route>,
    #[serde(default)]
    pub render: RenderSettings,
}

/// The `[render]` table.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RenderSettings {
    #[serde(with = "humantime_serde")]
    pub task_timeout: Duration,
    pub queue_capacity: usize,
    #[serde(with = "humantime_serde")]
    pub cache_ttl: Duration,
    /// Defaults to `cache_ttl`; `"0s"` disables the sweep.
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Option<Duration>,
    /// Defaults to one task budget per queue slot plus one.
    #[serde(with = "humantime_serde")]
    pub result_timeout: Option<Duration>,
    pub user_agent: Option<String>,
    pub viewport: Viewport,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            task_timeout: DEFAULT_TASK_TIMEOUT,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            cache_ttl: DEFAULT_CACHE_TTL,
            sweep_interval: None,
            result_timeout: None,
            user_agent: None,
            viewport: Viewport::default(),
        }
    }
}

impl ProxyConfig {
    /// Reads, normalizes and validates the file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&raw)
            .map_err(|e| Error::ConfigError(format!("{}: {}", path.display(), e)))
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: ProxyConfig =
            toml::from_str(raw).map_err(|e| Error::ConfigError(e.to_string()))?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Fills in values the file may leave blank.
    fn normalize(&mut self) {
        for (name, route) in self.routes.iter_mut() {
            route.name = name.clone();
            if route.body_selector.trim().is_empty() {
                route.body_selector = DEFAULT_BODY_SELECTOR.to_string();
            }
        }
        for id in [&mut self.twitter_id, &mut self.facebook_app_id] {
            if id.as_deref().is_some_and(|v| v.trim().is_empty()) {
                *id = None;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.backend_url()?;

        for route in self.routes.values() {
            if route.path.is_empty() || !route.path.starts_with('/') {
                return Err(Error::ConfigError(format!(
                    "route {}: path must start with '/', got {:?}",
                    route.name, route.path
                )));
            }
            if route.body_selector.parse::<lol_html::Selector>().is_err() {
                return Err(Error::ConfigError(format!(
                    "route {}: invalid body_selector {:?}",
                    route.name, route.body_selector
                )));
            }
        }

        if self.render.queue_capacity == 0 {
            return Err(Error::ConfigError(
                "render.queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.render.task_timeout.is_zero() {
            return Err(Error::ConfigError(
                "render.task_timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn backend_url(&self) -> Result<Url> {
        let url = Url::parse(&self.backend_server).map_err(|e| {
            Error::ConfigError(format!(
                "Invalid backend_server {:?}: {}",
                self.backend_server, e
            ))
        })?;
        match url.scheme() {
            "http" | "https" if url.has_host() => Ok(url),
            _ => Err(Error::ConfigError(format!(
                "backend_server must be an http(s) URL, got {:?}",
                self.backend_server
            ))),
        }
    }

    pub fn route_table(&self) -> RouteTable {
        RouteTable::new(self.routes.values().cloned())
    }

    pub fn site_profile(&self) -> SiteProfile {
        SiteProfile {
            domain: self.domain.clone(),
            site_name: self.site_name.clone(),
            owner: self.site_owner.clone(),
            logo_url: self.site_logo_url.clone(),
            twitter_id: self.twitter_id.clone(),
            facebook_app_id: self.facebook_app_id.clone(),
        }
    }

    pub fn coordinator_options(&self) -> CoordinatorOptions {
        let render = &self.render;
        let worker = WorkerOptions {
            task_timeout: render.task_timeout,
            queue_capacity: render.queue_capacity,
        };
        let sweep_interval = match render.sweep_interval {
            Some(every) if every.is_zero() => None,
            Some(every) => Some(every),
            None => Some(render.cache_ttl),
        };
        CoordinatorOptions {
            result_timeout: render
                .result_timeout
                .unwrap_or_else(|| CoordinatorOptions::default_result_timeout(&worker)),
            worker,
            cache_ttl: render.cache_ttl,
            sweep_interval,
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        let mut config = EngineConfig {
            viewport: self.render.viewport,
            ..EngineConfig::default()
        };
        if let Some(agent) = &self.render.user_agent {
            config.user_agent = agent.clone();
        }
        config
    }
}
