//! Backend adapter contract
//!
//! One uniform trait every OCR engine implements, plus the registry the
//! dispatcher resolves engines through. Adapters own all coordinate
//! fixups: geometry leaves an adapter already canonical, and nothing
//! downstream compensates for a backend quirk.

#[cfg(windows)]
pub mod native;
pub mod neural;
pub mod stub;

use std::collections::HashMap;
use std::sync::Arc;

use image::DynamicImage;
use tracing::warn;

use crate::error::BackendError;
use crate::geometry::Quad;
use crate::protocol::{ModelDescriptor, TextBlock};

/// How the dispatcher may run an adapter's blocking calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheduling {
    /// Safe on any blocking thread, several calls at a time.
    PoolSafe,
    /// Must run on one dedicated thread with at most one call in flight.
    /// For engines wrapping run-loop-driven or apartment-bound native APIs
    /// that are not reentrant.
    Confined,
}

/// The uniform surface every OCR engine implements.
///
/// Calls block; the dispatcher decides where they run based on
/// [`Scheduling`]. All geometry in returned blocks is canonical pixel
/// space (see [`crate::geometry`]).
pub trait RecognitionBackend: Send + Sync {
    /// Registry id callers select this engine by.
    fn name(&self) -> &'static str;

    fn scheduling(&self) -> Scheduling;

    /// Pre-initialize expensive state (model sessions, engine handles).
    fn warm_up(&self) -> Result<(), BackendError> {
        Ok(())
    }

    /// Find text regions without recognizing their content. Returned
    /// blocks are in the detected state with empty line content.
    fn detect(&self, image: &DynamicImage) -> Result<Vec<TextBlock>, BackendError>;

    /// Full recognition. With empty `regions` the engine segments the
    /// image itself; otherwise it recognizes exactly the given regions.
    fn recognize(
        &self,
        image: &DynamicImage,
        regions: &[Quad],
        language: Option<&str>,
    ) -> Result<Vec<TextBlock>, BackendError>;

    fn supported_languages(&self) -> Result<Vec<String>, BackendError>;

    /// Models this engine can install or has installed. Engines without
    /// managed models advertise none.
    fn supported_models(&self) -> Vec<ModelDescriptor> {
        Vec::new()
    }

    /// Install a model by name. `Ok(false)` means the engine manages no
    /// model under that name.
    fn install_model(&self, name: &str) -> Result<bool, BackendError> {
        let _ = name;
        Ok(false)
    }
}

/// Engine lookup table with a default fallback.
///
/// Engine ids are opaque strings matched exactly. An unknown id resolves
/// to the default engine with only a log line: existing callers rely on
/// getting an answer rather than an error for a misspelled id.
pub struct BackendRegistry {
    engines: HashMap<String, Arc<dyn RecognitionBackend>>,
    default: Arc<dyn RecognitionBackend>,
}

impl BackendRegistry {
    /// Registry containing just the default engine.
    pub fn new(default: Arc<dyn RecognitionBackend>) -> Self {
        let mut engines = HashMap::new();
        engines.insert(default.name().to_string(), Arc::clone(&default));
        Self { engines, default }
    }

    pub fn register(&mut self, backend: Arc<dyn RecognitionBackend>) {
        self.engines.insert(backend.name().to_string(), backend);
    }

    /// Resolve an engine id. `None` and the empty string mean "the
    /// default"; an unknown id falls back to the default and warns.
    pub fn resolve(&self, requested: Option<&str>) -> Arc<dyn RecognitionBackend> {
        let id = match requested {
            None | Some("") => return Arc::clone(&self.default),
            Some(id) => id,
        };
        match self.engines.get(id) {
            Some(engine) => Arc::clone(engine),
            None => {
                warn!(
                    requested = id,
                    fallback = self.default.name(),
                    "unknown engine id, using default"
                );
                Arc::clone(&self.default)
            }
        }
    }

    pub fn default_name(&self) -> &'static str {
        self.default.name()
    }

    pub fn engine_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.engines.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::stub::StubBackend;
    use super::*;

    #[test]
    fn resolves_registered_engines_exactly() {
        let mut registry = BackendRegistry::new(Arc::new(StubBackend::new("alpha")));
        registry.register(Arc::new(StubBackend::new("beta")));

        assert_eq!(registry.resolve(Some("beta")).name(), "beta");
        assert_eq!(registry.resolve(Some("alpha")).name(), "alpha");
        assert_eq!(registry.engine_names(), vec!["alpha", "beta"]);
    }

    #[test]
    fn unknown_and_empty_ids_fall_back_to_default() {
        let mut registry = BackendRegistry::new(Arc::new(StubBackend::new("alpha")));
        registry.register(Arc::new(StubBackend::new("beta")));

        assert_eq!(registry.resolve(None).name(), "alpha");
        assert_eq!(registry.resolve(Some("")).name(), "alpha");
        assert_eq!(registry.resolve(Some("no-such-engine")).name(), "alpha");
    }

    #[test]
    fn trait_defaults_advertise_no_models() {
        let engine = StubBackend::new("bare");
        assert!(engine.supported_models().is_empty());
        assert_eq!(engine.install_model("anything").unwrap(), false);
    }
}
