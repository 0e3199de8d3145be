//! Toolchain health prober.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::future::join_all;
use tracing::{debug, instrument};

use crate::backend::IsolationBackend;
use crate::language::LanguageRegistry;

/// Checks which registered toolchains the backend can run right now.
///
/// Never executes user code and never pulls images.
#[derive(Clone)]
pub struct ToolchainProber {
    backend: Arc<dyn IsolationBackend>,
}

impl ToolchainProber {
    pub fn new(backend: Arc<dyn IsolationBackend>) -> Self {
        Self { backend }
    }

    /// Availability of every registered language, keyed by id.
    #[instrument(skip_all, fields(backend = self.backend.name()))]
    pub async fn probe(&self, languages: &LanguageRegistry) -> BTreeMap<String, bool> {
        let checks = languages.descriptors().map(|descriptor| async move {
            let available = self.backend.is_available(descriptor).await;
            (descriptor.language_id.clone(), available)
        });
        let results: BTreeMap<String, bool> = join_all(checks).await.into_iter().collect();
        debug!(
            available = results.values().filter(|up| **up).count(),
            total = results.len(),
            "Probed toolchains"
        );
        results
    }
}

impl std::fmt::Debug for ToolchainProber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolchainProber")
            .field("backend", &self.backend.name())
            .finish()
    }
}
