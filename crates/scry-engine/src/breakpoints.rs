//! Per-class, per-line breakpoint descriptors and their JDWP requests.
//!
//! A descriptor exists independently of its request: a breakpoint on a class
//! the target has not loaded yet is *pending* and gets installed when the
//! class is materialized. Disabling clears the request but keeps the
//! descriptor.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use scry_jdwp::wire::{
    EventModifier, EVENT_KIND_BREAKPOINT, SUSPEND_POLICY_EVENT_THREAD,
};
use scry_jdwp::TargetVm;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::classes::{ClassRegistry, LoadedClass};
use crate::error::{EngineError, Result};

/// Snapshot of one breakpoint descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Breakpoint {
    pub class: String,
    pub line: u32,
    pub enabled: bool,
    pub annotation: Option<String>,
    /// A JDWP request currently backs this breakpoint.
    pub installed: bool,
}

#[derive(Debug, Clone)]
struct Entry {
    enabled: bool,
    annotation: Option<String>,
    request_id: Option<i32>,
}

impl Entry {
    fn new(annotation: Option<String>) -> Self {
        Self {
            enabled: true,
            annotation,
            request_id: None,
        }
    }

    fn describe(&self, class: &str, line: u32) -> Breakpoint {
        Breakpoint {
            class: class.to_string(),
            line,
            enabled: self.enabled,
            annotation: self.annotation.clone(),
            installed: self.request_id.is_some(),
        }
    }
}

type Entries = BTreeMap<String, BTreeMap<u32, Entry>>;

pub struct BreakpointRegistry<V> {
    vm: Arc<V>,
    classes: Arc<ClassRegistry>,
    entries: Mutex<Entries>,
}

impl<V: TargetVm> BreakpointRegistry<V> {
    /// Seeds a pending descriptor for every compile-time line of every
    /// watched class.
    pub fn new(vm: Arc<V>, classes: Arc<ClassRegistry>) -> Self {
        let mut entries = Entries::new();
        for source in classes.sources() {
            let lines = entries.entry(source.name().to_string()).or_default();
            for &line in source.breakpoint_lines() {
                lines.insert(line, Entry::new(None));
            }
        }
        entries.retain(|_, lines| !lines.is_empty());
        Self {
            vm,
            classes,
            entries: Mutex::new(entries),
        }
    }

    /// Creates (or re-enables and re-annotates) the breakpoint at `class:line`.
    ///
    /// For a loaded class the request is installed right away and a line
    /// without code fails with [`EngineError::UnresolvableLocation`]; for a
    /// class not loaded yet the descriptor stays pending.
    pub async fn set(
        &self,
        class: &str,
        line: u32,
        annotation: Option<String>,
    ) -> Result<Breakpoint> {
        if !self.classes.is_watched(class) {
            return Err(EngineError::UnknownClass(class.to_string()));
        }

        let mut entries = self.entries.lock().await;
        let mut entry = entries
            .get(class)
            .and_then(|lines| lines.get(&line))
            .cloned()
            .unwrap_or_else(|| Entry::new(None));
        entry.enabled = true;
        entry.annotation = annotation;

        if entry.request_id.is_none() {
            if let Some(loaded) = self.classes.loaded(class) {
                self.install(&loaded, line, &mut entry).await?;
            }
        }

        let described = entry.describe(class, line);
        entries
            .entry(class.to_string())
            .or_default()
            .insert(line, entry);
        Ok(described)
    }

    pub async fn get(&self, class: &str, line: u32) -> Option<Breakpoint> {
        let entries = self.entries.lock().await;
        entries
            .get(class)
            .and_then(|lines| lines.get(&line))
            .map(|entry| entry.describe(class, line))
    }

    /// Drops the descriptor and its request. `true` if one existed.
    pub async fn remove(&self, class: &str, line: u32) -> bool {
        let mut entries = self.entries.lock().await;
        let Some(lines) = entries.get_mut(class) else {
            return false;
        };
        let Some(entry) = lines.remove(&line) else {
            return false;
        };
        if lines.is_empty() {
            entries.remove(class);
        }
        if let Some(request_id) = entry.request_id {
            self.clear_request(class, line, request_id).await;
        }
        true
    }

    pub async fn is_enabled(&self, class: &str, line: u32) -> bool {
        let entries = self.entries.lock().await;
        entries
            .get(class)
            .and_then(|lines| lines.get(&line))
            .is_some_and(|entry| entry.enabled)
    }

    /// Enables or disables an existing breakpoint. Returns `false`, and does
    /// nothing, when there is no breakpoint at `class:line`.
    pub async fn set_enabled(&self, class: &str, line: u32, enabled: bool) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        let Some(entry) = entries
            .get_mut(class)
            .and_then(|lines| lines.get_mut(&line))
        else {
            return Ok(false);
        };
        if entry.enabled == enabled {
            return Ok(true);
        }

        if enabled {
            if let Some(loaded) = self.classes.loaded(class) {
                self.install(&loaded, line, entry).await?;
            }
        } else if let Some(request_id) = entry.request_id.take() {
            self.clear_request(class, line, request_id).await;
        }
        entry.enabled = enabled;
        Ok(true)
    }

    /// Creates the breakpoint if absent, otherwise flips its enabled flag.
    pub async fn toggle(&self, class: &str, line: u32) -> Result<Breakpoint> {
        match self.get(class, line).await {
            None => self.set(class, line, None).await,
            Some(mut current) => {
                current.enabled = !current.enabled;
                self.set_enabled(class, line, current.enabled).await?;
                Ok(self.get(class, line).await.unwrap_or(current))
            }
        }
    }

    pub async fn enabled_lines(&self, class: &str) -> Vec<u32> {
        let entries = self.entries.lock().await;
        entries
            .get(class)
            .map(|lines| {
                lines
                    .iter()
                    .filter(|(_, entry)| entry.enabled)
                    .map(|(line, _)| *line)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Classes with at least one descriptor, enabled or not.
    pub async fn classes_of_interest(&self) -> BTreeSet<String> {
        self.entries.lock().await.keys().cloned().collect()
    }

    pub async fn breakpoints(&self) -> Vec<Breakpoint> {
        let entries = self.entries.lock().await;
        entries
            .iter()
            .flat_map(|(class, lines)| {
                lines
                    .iter()
                    .map(move |(line, entry)| entry.describe(class, *line))
            })
            .collect()
    }

    /// Installs every enabled, not yet installed breakpoint of a freshly
    /// loaded class. Lines without code are logged and skipped. Returns the
    /// number of requests installed.
    pub async fn materialize(&self, loaded: &LoadedClass) -> usize {
        let mut entries = self.entries.lock().await;
        let Some(lines) = entries.get_mut(loaded.name()) else {
            return 0;
        };

        let mut installed = 0;
        for (line, entry) in lines.iter_mut() {
            if !entry.enabled || entry.request_id.is_some() {
                continue;
            }
            match self.install(loaded, *line, entry).await {
                Ok(()) => installed += 1,
                Err(EngineError::UnresolvableLocation { class, line }) => {
                    tracing::warn!(
                        target: "scry.engine",
                        class = %class,
                        line,
                        "breakpoint line has no executable code; skipping"
                    );
                }
                Err(err) => {
                    tracing::warn!(
                        target: "scry.engine",
                        class = loaded.name(),
                        line = *line,
                        error = %err,
                        "failed to install breakpoint"
                    );
                }
            }
        }
        installed
    }

    async fn install(&self, loaded: &LoadedClass, line: u32, entry: &mut Entry) -> Result<()> {
        let location =
            loaded
                .location_of_line(line)
                .ok_or_else(|| EngineError::UnresolvableLocation {
                    class: loaded.name().to_string(),
                    line,
                })?;
        let request_id = self
            .vm
            .set_event_request(
                EVENT_KIND_BREAKPOINT,
                SUSPEND_POLICY_EVENT_THREAD,
                &[EventModifier::LocationOnly { location }],
            )
            .await?;
        tracing::debug!(
            target: "scry.engine",
            class = loaded.name(),
            line,
            request_id,
            "installed breakpoint"
        );
        entry.request_id = Some(request_id);
        Ok(())
    }

    async fn clear_request(&self, class: &str, line: u32, request_id: i32) {
        if let Err(err) = self
            .vm
            .clear_event_request(EVENT_KIND_BREAKPOINT, request_id)
            .await
        {
            tracing::warn!(
                target: "scry.engine",
                class,
                line,
                request_id,
                error = %err,
                "failed to clear breakpoint request"
            );
        }
    }
}
