//! Browser process glue: launching a Chromium binary and holding the
//! chromiumoxide handler loop. Profile management stays with the caller; the
//! core only needs a working page.

use std::path::PathBuf;
use std::sync::Arc;

use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::Page;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::EnvSettings;
use crate::{HarError, Result};

const CHROME_CANDIDATES: &[&str] = &[
    "google-chrome",
    "google-chrome-stable",
    "chromium",
    "chromium-browser",
    "chrome",
];

/// Resolves the browser binary: CHROME_PATH wins, then PATH discovery.
/// `None` lets chromiumoxide use its own detection.
pub fn find_chrome(settings: &EnvSettings) -> Option<PathBuf> {
    if let Some(path) = &settings.chrome_path {
        return Some(path.clone());
    }
    CHROME_CANDIDATES
        .iter()
        .find_map(|candidate| which::which(candidate).ok())
}

pub struct BrowserHandle {
    browser: Browser,
    handler_task: JoinHandle<()>,
}

impl BrowserHandle {
    /// Launches the browser and spawns its event handler loop.
    pub async fn launch(settings: &EnvSettings) -> Result<Self> {
        let mut builder = BrowserConfig::builder();
        if !settings.headless.unwrap_or(true) {
            builder = builder.with_head();
        }
        if let Some(path) = find_chrome(settings) {
            debug!(path = %path.display(), "using browser binary");
            builder = builder.chrome_executable(path);
        }
        let config = builder
            .build()
            .map_err(|e| HarError::Connection(format!("browser config: {e}")))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| HarError::Connection(format!("browser launch: {e}")))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!(error = %e, "browser handler event error");
                }
            }
        });

        Ok(Self {
            browser,
            handler_task,
        })
    }

    pub async fn new_page(&self) -> Result<Arc<Page>> {
        let page = self
            .browser
            .new_page("about:blank")
            .await
            .map_err(|e| HarError::Connection(format!("new page: {e}")))?;
        Ok(Arc::new(page))
    }

    pub async fn close(mut self) {
        if let Err(e) = self.browser.close().await {
            debug!(error = %e, "browser close failed");
        }
        let _ = self.browser.wait().await;
        self.handler_task.abort();
    }
}
