//! Browser driver abstraction.
//!
//! Defines the `BrowserDriver` and `BrowserSession` traits that abstract
//! over the browser engine (currently Chromium via chromiumoxide). Each
//! session is a dedicated browser process bound to one egress identity:
//! the proxy goes in as a launch argument and the user agent as a CDP
//! override before the first navigation.

use std::path::PathBuf;
use std::time::Instant;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::emulation::SetUserAgentOverrideParams;
use chromiumoxide::page::Page;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{FetchError, FetchResult};
use crate::rotation::Identity;

/// Find the Chromium binary path.
pub fn find_chromium() -> Option<PathBuf> {
    // 1. TRELLIS_CHROMIUM_PATH env
    if let Ok(p) = std::env::var("TRELLIS_CHROMIUM_PATH") {
        let path = PathBuf::from(&p);
        if path.exists() {
            return Some(path);
        }
    }

    // 2. ~/.trellis/chromium/
    if let Some(home) = dirs::home_dir() {
        let candidates = if cfg!(target_os = "macos") {
            vec![
                home.join(".trellis/chromium/chrome-mac-arm64/Google Chrome for Testing.app/Contents/MacOS/Google Chrome for Testing"),
                home.join(".trellis/chromium/chrome-mac-x64/Google Chrome for Testing.app/Contents/MacOS/Google Chrome for Testing"),
                home.join(".trellis/chromium/chrome"),
            ]
        } else {
            vec![
                home.join(".trellis/chromium/chrome-linux64/chrome"),
                home.join(".trellis/chromium/chrome"),
            ]
        };
        for c in candidates {
            if c.exists() {
                return Some(c);
            }
        }
    }

    // 3. System PATH
    if let Ok(path) = which::which("google-chrome") {
        return Some(path);
    }
    if let Ok(path) = which::which("chromium") {
        return Some(path);
    }
    if let Ok(path) = which::which("chromium-browser") {
        return Some(path);
    }

    // 4. Common macOS locations
    if cfg!(target_os = "macos") {
        let common =
            PathBuf::from("/Applications/Google Chrome.app/Contents/MacOS/Google Chrome");
        if common.exists() {
            return Some(common);
        }
    }

    None
}

/// A browser engine that can open identity-bound sessions.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    /// Launch a fresh session egressing as the given identity.
    async fn open_session(&self, identity: &Identity) -> FetchResult<Box<dyn BrowserSession>>;
}

/// A single browser session for rendering storefront pages.
#[async_trait]
pub trait BrowserSession: Send + Sync {
    /// Navigate to a URL and wait for the load to settle.
    async fn navigate(&mut self, url: &str, timeout_ms: u64) -> FetchResult<()>;
    /// Execute JavaScript in the page context and return the result.
    async fn execute_js(&self, script: &str) -> FetchResult<serde_json::Value>;
    /// Get the full page HTML.
    async fn page_html(&self) -> FetchResult<String>;
    /// Tear the session down, killing the browser process.
    async fn close(self: Box<Self>) -> FetchResult<()>;
}

/// Chromium-backed driver. Binary discovery happens at session open, so
/// construction never fails and a missing install only surfaces when the
/// browser strategy actually runs.
#[derive(Debug, Default)]
pub struct ChromiumDriver;

impl ChromiumDriver {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BrowserDriver for ChromiumDriver {
    async fn open_session(&self, identity: &Identity) -> FetchResult<Box<dyn BrowserSession>> {
        let chrome_path = find_chromium().ok_or_else(|| {
            FetchError::Driver(
                "Chromium not found. Set TRELLIS_CHROMIUM_PATH or install Chrome.".into(),
            )
        })?;

        let mut config = BrowserConfig::builder()
            .chrome_executable(chrome_path)
            .arg("--headless=new")
            .arg("--disable-gpu")
            .arg("--no-sandbox")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--disable-extensions")
            .arg("--window-size=1920,1080");
        if let Some(proxy) = &identity.proxy_endpoint {
            config = config.arg(format!("--proxy-server={proxy}"));
        }
        let config = config
            .build()
            .map_err(|e| FetchError::Driver(format!("failed to build browser config: {e}")))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| FetchError::Driver(format!("failed to launch Chromium: {e}")))?;

        // Drive the CDP event loop until the browser goes away.
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                let _ = event;
            }
        });

        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| FetchError::Driver(format!("failed to create page: {e}")))?;

        let override_params = SetUserAgentOverrideParams::builder()
            .user_agent(identity.user_agent.clone())
            .build()
            .map_err(FetchError::Driver)?;
        // `Page::set_user_agent` takes `impl Into<SetUserAgentOverrideParams>`,
        // but the generated `impl<T: Into<String>> From<T>` on the params type
        // shadows the identity conversion, so send the built command directly.
        page.execute(override_params)
            .await
            .map_err(|e| FetchError::Driver(format!("failed to set user agent: {e}")))?;

        debug!(identity = identity.label(), "browser session opened");
        Ok(Box::new(ChromiumSession {
            browser,
            page,
            handler_task,
        }))
    }
}

/// One live Chromium process plus its page and CDP event pump.
pub struct ChromiumSession {
    browser: Browser,
    page: Page,
    handler_task: JoinHandle<()>,
}

#[async_trait]
impl BrowserSession for ChromiumSession {
    async fn navigate(&mut self, url: &str, timeout_ms: u64) -> FetchResult<()> {
        let start = Instant::now();
        let result = tokio::time::timeout(
            std::time::Duration::from_millis(timeout_ms),
            self.page.goto(url),
        )
        .await;

        match result {
            Ok(Ok(_response)) => {
                let remaining = timeout_ms.saturating_sub(start.elapsed().as_millis() as u64);
                // Load events may never fire on SPA storefronts; cap the
                // wait and fall through to content polling either way.
                let _ = tokio::time::timeout(
                    std::time::Duration::from_millis(remaining.max(1)),
                    self.page.wait_for_navigation(),
                )
                .await;
                Ok(())
            }
            Ok(Err(e)) => Err(FetchError::Driver(format!("navigation failed: {e}"))),
            Err(_) => Err(FetchError::RenderTimeout(timeout_ms)),
        }
    }

    async fn execute_js(&self, script: &str) -> FetchResult<serde_json::Value> {
        let result = self
            .page
            .evaluate(script)
            .await
            .map_err(|e| FetchError::Driver(format!("JS execution failed: {e}")))?;

        result
            .into_value()
            .map_err(|e| FetchError::Driver(format!("failed to convert JS result: {e:?}")))
    }

    async fn page_html(&self) -> FetchResult<String> {
        let result = self
            .page
            .evaluate("document.documentElement.outerHTML")
            .await
            .map_err(|e| FetchError::Driver(format!("failed to get HTML: {e}")))?;

        let html: String = result
            .into_value()
            .map_err(|e| FetchError::Driver(format!("failed to convert HTML result: {e:?}")))?;
        Ok(html)
    }

    async fn close(self: Box<Self>) -> FetchResult<()> {
        let ChromiumSession {
            mut browser,
            page,
            handler_task,
        } = *self;
        let _ = page.close().await;
        if let Err(e) = browser.close().await {
            debug!(error = %e, "browser close failed, killing process");
        }
        let _ = browser.wait().await;
        // The event pump ends when the websocket drops; abort covers the
        // case where the process had to be killed mid-handshake.
        handler_task.abort();
        Ok(())
    }
}
