//! Chrome DevTools Protocol adapter implementation

use crate::{Engine, EngineConfig, Error, Result};
use headless_chrome::browser::tab::Tab;
use headless_chrome::{Browser, LaunchOptions};
use log::debug;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// The browser process is owned for the lifetime of the worker, which may
/// sit idle between renders far longer than the crate's default allows.
const IDLE_BROWSER_TIMEOUT: Duration = Duration::from_secs(60 * 60 * 24 * 365);

/// How often visibility is re-checked while waiting on an element.
const VISIBILITY_POLL: Duration = Duration::from_millis(50);

const IS_VISIBLE_JS: &str = r#"function() {
    const style = window.getComputedStyle(this);
    const rect = this.getBoundingClientRect();
    return style.display !== 'none'
        && style.visibility !== 'hidden'
        && rect.width > 0
        && rect.height > 0;
}"#;

const INNER_HTML_JS: &str = "function() { return this.innerHTML; }";

/// CDP-based browser session (uses the `headless_chrome` crate)
///
/// Launches a headless Chrome instance and drives a single tab. Only the
/// render worker thread ever holds one of these.
pub struct CdpEngine {
    browser: Browser,
    tab: Arc<Tab>,
    config: EngineConfig,
}

impl CdpEngine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        let launch_options = LaunchOptions::default_builder()
            .headless(true)
            .window_size(Some((config.viewport.width, config.viewport.height)))
            .idle_browser_timeout(IDLE_BROWSER_TIMEOUT)
            .build()
            .map_err(|e| {
                Error::InitializationError(format!("Failed to build launch options: {}", e))
            })?;

        let browser = Browser::new(launch_options)
            .map_err(|e| Error::InitializationError(format!("Failed to launch browser: {}", e)))?;

        let tab = browser
            .new_tab()
            .map_err(|e| Error::InitializationError(format!("Failed to create tab: {}", e)))?;

        tab.set_user_agent(&config.user_agent, None, None)
            .map_err(|e| Error::InitializationError(format!("Failed to set user agent: {}", e)))?;

        if !config.headers.is_empty() {
            // headless_chrome expects a HashMap<&str, &str>
            let headers: std::collections::HashMap<&str, &str> = config
                .headers
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str()))
                .collect();

            tab.set_extra_http_headers(headers)
                .map_err(|e| Error::InitializationError(format!("Failed to set headers: {}", e)))?;
        }

        debug!(
            "Browser session ready ({}x{})",
            config.viewport.width, config.viewport.height
        );

        Ok(Self {
            browser,
            tab,
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn is_visible(&self, selector: &str) -> Result<bool> {
        let element = match self.tab.find_element(selector) {
            Ok(element) => element,
            // not attached yet
            Err(_) => return Ok(false),
        };
        let probe = element.call_js_fn(IS_VISIBLE_JS, vec![], false)?;
        Ok(probe
            .value
            .and_then(|v| v.as_bool())
            .unwrap_or(false))
    }
}

impl Engine for CdpEngine {
    fn load_url(&mut self, url: &str, timeout: Duration) -> Result<()> {
        self.tab.set_default_timeout(timeout);

        self.tab
            .navigate_to(url)
            .map_err(|e| Error::LoadError(format!("Navigation failed: {}", e)))?;

        self.tab
            .wait_until_navigated()
            .map_err(|e| Error::LoadError(format!("Wait for navigation failed: {}", e)))?;

        Ok(())
    }

    fn wait_visible(&mut self, selector: &str, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;

        self.tab
            .wait_for_element_with_custom_timeout(selector, timeout)
            .map_err(|_| Error::timeout(timeout))?;

        // present is not the same as laid out; poll until it has a box
        loop {
            if self.is_visible(selector)? {
                return Ok(());
            }
            if Instant::now() + VISIBILITY_POLL >= deadline {
                return Err(Error::timeout(timeout));
            }
            std::thread::sleep(VISIBILITY_POLL);
        }
    }

    fn title(&self) -> Result<String> {
        self.tab
            .get_title()
            .map_err(|e| Error::RenderError(format!("Failed to get title: {}", e)))
    }

    fn inner_html(&self, selector: &str) -> Result<String> {
        let element = self
            .tab
            .find_element(selector)
            .map_err(|e| Error::RenderError(format!("No element for {}: {}", selector, e)))?;

        let html = element
            .call_js_fn(INNER_HTML_JS, vec![], false)
            .map_err(|e| Error::RenderError(format!("Failed to read innerHTML: {}", e)))?;

        match html.value {
            Some(serde_json::Value::String(html)) => Ok(html),
            Some(other) => Ok(other.to_string()),
            None => Err(Error::RenderError("No value returned for innerHTML".into())),
        }
    }

    fn close(self) -> Result<()> {
        // dropping the browser terminates the child process
        drop(self.tab);
        drop(self.browser);
        Ok(())
    }
}
