//! Browser-persisted key/value state
//!
//! The application reads its login and preference markers from
//! `localStorage` when it renders. Writes go through the page's evaluate
//! primitive and are read back before the call returns; the reload variants
//! only return once the reload's load event has fired, so the next step
//! always sees an application that rendered with the new state.

use std::time::Duration;
use tracing::{debug, info};

use crate::browser::{BrowserControl, PageScript};
use crate::error::{E2eError, E2eResult};

pub struct SessionInjector<'a> {
    page: &'a dyn BrowserControl,
    reload_timeout: Duration,
}

impl<'a> SessionInjector<'a> {
    pub fn new(page: &'a dyn BrowserControl, reload_timeout: Duration) -> Self {
        Self { page, reload_timeout }
    }

    /// Write `key`, returning once the write is observable in the page.
    pub async fn inject(&self, key: &str, value: &str) -> E2eResult<()> {
        let stored = self
            .page
            .evaluate(&PageScript::SetItem {
                key: key.to_string(),
                value: value.to_string(),
            })
            .await?;

        if stored.as_str() != Some(value) {
            return Err(E2eError::Session(format!(
                "write of '{}' not acknowledged (read back {})",
                key, stored
            )));
        }
        debug!("Session key '{}' injected", key);
        Ok(())
    }

    pub async fn clear(&self, key: &str) -> E2eResult<()> {
        let gone = self
            .page
            .evaluate(&PageScript::RemoveItem { key: key.to_string() })
            .await?;

        if gone != serde_json::Value::Bool(true) {
            return Err(E2eError::Session(format!("key '{}' still present after clear", key)));
        }
        debug!("Session key '{}' cleared", key);
        Ok(())
    }

    pub async fn read(&self, key: &str) -> E2eResult<Option<String>> {
        let value = self
            .page
            .evaluate(&PageScript::GetItem { key: key.to_string() })
            .await?;
        match value {
            serde_json::Value::Null => Ok(None),
            serde_json::Value::String(s) => Ok(Some(s)),
            other => Err(E2eError::Session(format!("unexpected value for '{}': {}", key, other))),
        }
    }

    /// Write every entry, then reload and wait for the load event.
    pub async fn inject_and_reload(&self, entries: &[(String, String)]) -> E2eResult<()> {
        for (key, value) in entries {
            self.inject(key, value).await?;
        }
        info!("Injected {} session key(s), reloading", entries.len());
        self.page.reload(self.reload_timeout).await
    }

    /// Remove every key, then reload and wait for the load event.
    pub async fn clear_and_reload(&self, keys: &[String]) -> E2eResult<()> {
        for key in keys {
            self.clear(key).await?;
        }
        info!("Cleared {} session key(s), reloading", keys.len());
        self.page.reload(self.reload_timeout).await
    }
}
