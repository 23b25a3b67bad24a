//! Source descriptors for watched classes.
//!
//! The engine never reads source files itself; a [`SourceProvider`] hands
//! the text over on demand.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use scry_config::ClassConfig;
use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Supplies the source text of one class. May fail.
pub trait SourceProvider: Send + Sync {
    fn contents(&self) -> Result<String, BoxError>;
}

impl<F> SourceProvider for F
where
    F: Fn() -> Result<String, BoxError> + Send + Sync,
{
    fn contents(&self) -> Result<String, BoxError> {
        self()
    }
}

/// Source text held in memory.
#[derive(Debug, Clone, Default)]
pub struct InlineSource(String);

impl InlineSource {
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }
}

impl SourceProvider for InlineSource {
    fn contents(&self) -> Result<String, BoxError> {
        Ok(self.0.clone())
    }
}

#[derive(Debug, Error)]
#[error("failed to read source of {class}: {source}")]
pub struct SourceError {
    pub class: String,
    #[source]
    pub source: BoxError,
}

#[derive(Default)]
struct SourceCache {
    enabled: bool,
    text: Option<Arc<str>>,
}

/// A class the session watches: its binary name, where its source comes from
/// and the breakpoint lines known before the target starts.
pub struct SourceClass {
    name: String,
    provider: Arc<dyn SourceProvider>,
    breakpoints: Vec<u32>,
    cache: Mutex<SourceCache>,
}

impl SourceClass {
    pub fn new(name: impl Into<String>, provider: impl SourceProvider + 'static) -> Self {
        Self {
            name: name.into(),
            provider: Arc::new(provider),
            breakpoints: Vec::new(),
            cache: Mutex::new(SourceCache::default()),
        }
    }

    pub fn from_config(config: &ClassConfig, provider: impl SourceProvider + 'static) -> Self {
        let class = Self::new(config.name.clone(), provider).with_breakpoints(&config.breakpoints);
        class.set_cached(config.cached);
        class
    }

    /// Compile-time breakpoint lines, installed once the class is loaded.
    pub fn with_breakpoints(mut self, lines: &[u32]) -> Self {
        self.breakpoints = lines.to_vec();
        self.breakpoints.sort_unstable();
        self.breakpoints.dedup();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn breakpoint_lines(&self) -> &[u32] {
        &self.breakpoints
    }

    pub fn is_cached(&self) -> bool {
        self.cache.lock().enabled
    }

    /// Turning caching off drops any text already held.
    pub fn set_cached(&self, cached: bool) {
        let mut cache = self.cache.lock();
        cache.enabled = cached;
        if !cached {
            cache.text = None;
        }
    }

    pub fn contents(&self) -> Result<Arc<str>, SourceError> {
        if let Some(text) = &self.cache.lock().text {
            return Ok(Arc::clone(text));
        }

        let text: Arc<str> = self
            .provider
            .contents()
            .map_err(|source| SourceError {
                class: self.name.clone(),
                source,
            })?
            .into();

        let mut cache = self.cache.lock();
        if cache.enabled {
            cache.text = Some(Arc::clone(&text));
        }
        Ok(text)
    }
}

impl fmt::Debug for SourceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceClass")
            .field("name", &self.name)
            .field("breakpoints", &self.breakpoints)
            .field("cached", &self.is_cached())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn counting(calls: Arc<AtomicUsize>) -> impl SourceProvider {
        move || -> Result<String, BoxError> {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok("class Demo {}".to_string())
        }
    }

    #[test]
    fn uncached_descriptor_refetches() {
        let calls = Arc::new(AtomicUsize::new(0));
        let class = SourceClass::new("demo.Demo", counting(calls.clone()));
        class.contents().unwrap();
        class.contents().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn cache_toggle_keeps_and_drops_text() {
        let calls = Arc::new(AtomicUsize::new(0));
        let class = SourceClass::new("demo.Demo", counting(calls.clone()));
        class.set_cached(true);
        assert_eq!(&*class.contents().unwrap(), "class Demo {}");
        class.contents().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        class.set_cached(false);
        class.contents().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn provider_failure_names_the_class() {
        let class = SourceClass::new("demo.Missing", || -> Result<String, BoxError> {
            Err("not on the source path".into())
        });
        let err = class.contents().unwrap_err();
        assert_eq!(err.class, "demo.Missing");
        assert!(err.to_string().contains("not on the source path"));
    }

    #[test]
    fn config_lines_are_sorted_and_deduplicated() {
        let config = ClassConfig {
            name: "demo.Generator".into(),
            breakpoints: vec![24, 15, 24],
            cached: true,
        };
        let class = SourceClass::from_config(&config, InlineSource::default());
        assert_eq!(class.breakpoint_lines(), &[15, 24]);
        assert!(class.is_cached());
    }
}
