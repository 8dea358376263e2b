//! ssrproxy
//!
//! A reverse proxy that augments selected routes of a web backend with
//! server-side rendered HTML and Open Graph metadata. Pages are rendered by a
//! single headless browser session; concurrent requests for the same page are
//! coalesced so each URL is rendered at most once at a time, and the result is
//! cached and broadcast to every request waiting on it.
//!
//! # Architecture
//!
//! - [`cache`]: request-key → render outcome map with TTL and a broadcast-once
//!   ready signal per entry
//! - [`worker`]: the thread that owns the browser session and drains a bounded
//!   task queue
//! - [`coordinator`]: deduplicates requests, submits tasks, finalizes entries
//! - [`preview`]: description/image extraction and `<meta>` markup
//! - [`proxy`], [`config`], [`route`]: the HTTP edge around the pipeline
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use ssrproxy::{Coordinator, CoordinatorOptions, EngineConfig, RequestKey, Route, SiteProfile};
//!
//! # async fn example() -> ssrproxy::Result<()> {
//! let config = EngineConfig::default();
//! let coordinator = Coordinator::start(
//!     move || ssrproxy::new_engine(config),
//!     SiteProfile::default(),
//!     CoordinatorOptions::default(),
//! )
//! .await?;
//!
//! let key = RequestKey::parse("https://example.com/posts/1")?;
//! let target = url::Url::parse("http://127.0.0.1:3000/posts/1").unwrap();
//! let route = Arc::new(Route::new("post", "/posts/:id").with_ogp(true));
//!
//! coordinator.request_render(key.clone(), target, route).await;
//! if let Some(page) = coordinator.await_render(&key).await {
//!     println!("{}", page.metadata);
//! }
//! # Ok(())
//! # }
//! ```

use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

pub mod cache;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod preview;
pub mod proxy;
pub mod route;
pub mod worker;

// Chrome DevTools Protocol backend
#[cfg(feature = "cdp")]
pub mod cdp;

pub use cache::{CacheEntry, RenderCache, RenderedPage, RequestKey, Reservation};
pub use config::ProxyConfig;
pub use coordinator::{Coordinator, CoordinatorOptions};
pub use error::{Error, Result};
pub use preview::{PagePreview, SiteProfile};
pub use route::{Route, RouteTable};
pub use worker::{RenderTask, RenderWorker, RenderedFragment, WorkerOptions};

/// Configuration for the browser session
///
/// The defaults mirror a desktop browser so client-side rendered pages lay
/// out the same way they would for a visitor.
///
/// # Examples
///
/// ```
/// let cfg = ssrproxy::EngineConfig::default();
/// assert!(cfg.user_agent.contains("ssrproxy"));
/// ```
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// User agent string to send with requests
    pub user_agent: String,
    /// Viewport dimensions
    pub viewport: Viewport,
    /// Custom HTTP headers sent with every navigation
    pub headers: HashMap<String, String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            user_agent: "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0 Safari/537.36 ssrproxy/0.1".to_string(),
            viewport: Viewport::default(),
            headers: HashMap::new(),
        }
    }
}

/// Viewport dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
        }
    }
}

/// A browser session the render worker drives.
///
/// Implementations are used from a single thread only and are never shared.
/// Each method receives the time left in the current task's budget where it
/// may block.
pub trait Engine {
    /// Navigate to `url` and wait for the navigation to commit
    fn load_url(&mut self, url: &str, timeout: Duration) -> Result<()>;

    /// Block until the element matching `selector` is visible
    fn wait_visible(&mut self, selector: &str, timeout: Duration) -> Result<()>;

    /// Title of the current page
    fn title(&self) -> Result<String>;

    /// innerHTML of the first element matching `selector`
    fn inner_html(&self, selector: &str) -> Result<String>;

    /// Close the session and clean up resources
    fn close(self) -> Result<()>
    where
        Self: Sized;
}

/// Create a browser session with the default backend
#[cfg(feature = "cdp")]
pub fn new_engine(config: EngineConfig) -> Result<impl Engine> {
    cdp::CdpEngine::new(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.viewport.width, 1280);
        assert_eq!(config.viewport.height, 720);
        assert!(config.headers.is_empty());
    }

    #[test]
    fn test_viewport() {
        let viewport = Viewport {
            width: 1920,
            height: 1080,
        };
        assert_eq!(viewport.width, 1920);
        assert_eq!(viewport.height, 1080);
    }
}
