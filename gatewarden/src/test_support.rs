// gatewarden/src/test_support.rs
//
// Shared fixtures for unit tests: detector dependency bundles wired to
// in-memory collaborators with a fixed identity key.

use std::sync::Arc;

use crate::behavior::BehaviorAnalyzer;
use crate::config::Options;
use crate::detectors::DetectorDeps;
use crate::identity::IdentityResolver;
use crate::learning::{FeatureExtractor, HeuristicModel};
use crate::state::WindowStore;
use crate::stores::{MemoryFingerprintStore, StaticBrowserVersions, StaticPatternCache};

pub(crate) fn deps_for(options: Options, cache: Arc<StaticPatternCache>) -> DetectorDeps {
    DetectorDeps {
        options:        Arc::new(options),
        window:         Arc::new(WindowStore::new()),
        analyzer:       BehaviorAnalyzer::default(),
        identity:       IdentityResolver::new(vec![7u8; 32]).expect("test key is long enough"),
        patterns:       cache,
        versions:       Arc::new(StaticBrowserVersions::default()),
        fingerprints:   Arc::new(MemoryFingerprintStore::new()),
        model:          Arc::new(HeuristicModel::new()),
        extractor:      Arc::new(FeatureExtractor::new()),
        llm:            None,
        pattern_writer: None,
    }
}

/// Default options, empty pattern cache.
pub(crate) fn plain_deps() -> DetectorDeps {
    deps_for(Options::default(), Arc::new(StaticPatternCache::new()))
}

/// Default options with a pre-seeded pattern cache.
pub(crate) fn deps_with(seed: impl FnOnce(&StaticPatternCache)) -> DetectorDeps {
    let cache = Arc::new(StaticPatternCache::new());
    seed(&cache);
    deps_for(Options::default(), cache)
}

/// Tor checking on, with a pre-seeded pattern cache.
pub(crate) fn tor_enabled_deps(seed: impl FnOnce(&StaticPatternCache)) -> DetectorDeps {
    let cache = Arc::new(StaticPatternCache::new());
    seed(&cache);
    let mut options = Options::default();
    options.ip.tor_check_enabled = true;
    deps_for(options, cache)
}
