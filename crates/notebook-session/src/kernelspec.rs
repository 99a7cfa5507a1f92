//! Kernel specification catalog and kernel selection.
//!
//! The catalog is fetched at most once per [`KernelspecCache`] and then
//! served from memory. Two callers racing on the first fetch may both hit
//! the catalog; the first result stored is kept and the other is dropped.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::error::SessionError;

/// A launchable kernel type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelspecInfo {
    pub name: String,
    pub display_name: String,
    pub language: String,
}

/// Kernel metadata declared by a notebook.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KernelHint {
    pub name: Option<String>,
    pub language: Option<String>,
}

/// Kernelspecs keyed by kernel name.
pub type KernelspecMap = BTreeMap<String, KernelspecInfo>;

#[async_trait]
pub trait KernelspecCatalog: Send + Sync {
    async fn fetch_all(&self) -> Result<KernelspecMap, SessionError>;
}

/// Catalog backed by the Jupyter data directories on this machine.
pub struct RuntimelibCatalog;

#[async_trait]
impl KernelspecCatalog for RuntimelibCatalog {
    async fn fetch_all(&self) -> Result<KernelspecMap, SessionError> {
        let specs = runtimelib::list_kernelspecs().await;
        Ok(specs
            .into_iter()
            .map(|s| {
                (
                    s.kernel_name.clone(),
                    KernelspecInfo {
                        name: s.kernel_name,
                        display_name: s.kernelspec.display_name,
                        language: s.kernelspec.language,
                    },
                )
            })
            .collect())
    }
}

pub struct KernelspecCache {
    catalog: Arc<dyn KernelspecCatalog>,
    specs: RwLock<Option<Arc<KernelspecMap>>>,
}

impl KernelspecCache {
    pub fn new(catalog: Arc<dyn KernelspecCatalog>) -> Self {
        Self {
            catalog,
            specs: RwLock::new(None),
        }
    }

    /// Return the cached catalog, fetching it on first use.
    ///
    /// Failed fetches are not cached.
    pub async fn get(&self) -> Result<Arc<KernelspecMap>, SessionError> {
        if let Some(specs) = self.cached() {
            return Ok(specs);
        }

        let fetched = Arc::new(self.catalog.fetch_all().await?);
        info!("[kernelspec] Fetched {} kernelspecs", fetched.len());

        let mut guard = self.specs.write().unwrap_or_else(PoisonError::into_inner);
        Ok(guard.get_or_insert(fetched).clone())
    }

    pub fn cached(&self) -> Option<Arc<KernelspecMap>> {
        self.specs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Pick a kernel name for a notebook.
///
/// Preference order: the declared kernelspec name, a spec whose language
/// matches the declared language, the configured default, then the first
/// spec by name.
pub fn select_kernel_name(
    hint: &KernelHint,
    specs: &KernelspecMap,
    default_kernel: &str,
) -> Result<String, SessionError> {
    if let Some(name) = hint.name.as_deref() {
        if specs.contains_key(name) {
            return Ok(name.to_string());
        }
        debug!("[kernelspec] Declared kernel {} is not installed", name);
    }

    if let Some(language) = hint.language.as_deref() {
        if let Some(spec) = specs
            .values()
            .find(|s| s.language.eq_ignore_ascii_case(language))
        {
            return Ok(spec.name.clone());
        }
    }

    if specs.contains_key(default_kernel) {
        return Ok(default_kernel.to_string());
    }

    specs
        .keys()
        .next()
        .cloned()
        .ok_or(SessionError::NoKernelspec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingCatalog {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl KernelspecCatalog for CountingCatalog {
        async fn fetch_all(&self) -> Result<KernelspecMap, SessionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(SessionError::Catalog("offline".into()));
            }
            Ok(catalog())
        }
    }

    fn spec(name: &str, language: &str) -> (String, KernelspecInfo) {
        (
            name.to_string(),
            KernelspecInfo {
                name: name.to_string(),
                display_name: name.to_uppercase(),
                language: language.to_string(),
            },
        )
    }

    fn catalog() -> KernelspecMap {
        [spec("deno", "typescript"), spec("ir", "R"), spec("python3", "python")]
            .into_iter()
            .collect()
    }

    fn hint(name: Option<&str>, language: Option<&str>) -> KernelHint {
        KernelHint {
            name: name.map(String::from),
            language: language.map(String::from),
        }
    }

    #[tokio::test]
    async fn test_cache_fetches_once() {
        let catalog = Arc::new(CountingCatalog {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let cache = KernelspecCache::new(catalog.clone());

        assert!(cache.cached().is_none());
        let first = cache.get().await.unwrap();
        let second = cache.get().await.unwrap();

        assert_eq!(catalog.calls.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_cache_does_not_store_failures() {
        let catalog = Arc::new(CountingCatalog {
            calls: AtomicUsize::new(0),
            fail: true,
        });
        let cache = KernelspecCache::new(catalog.clone());

        assert!(cache.get().await.is_err());
        assert!(cache.get().await.is_err());
        assert_eq!(catalog.calls.load(Ordering::SeqCst), 2);
        assert!(cache.cached().is_none());
    }

    #[test]
    fn test_select_declared_name() {
        let name = select_kernel_name(&hint(Some("ir"), Some("python")), &catalog(), "python3");
        assert_eq!(name.unwrap(), "ir");
    }

    #[test]
    fn test_select_by_language_when_name_missing() {
        let name = select_kernel_name(&hint(Some("julia-1.9"), Some("r")), &catalog(), "python3");
        assert_eq!(name.unwrap(), "ir");
    }

    #[test]
    fn test_select_default_without_metadata() {
        let name = select_kernel_name(&KernelHint::default(), &catalog(), "python3");
        assert_eq!(name.unwrap(), "python3");
    }

    #[test]
    fn test_select_first_spec_when_default_missing() {
        let name = select_kernel_name(&KernelHint::default(), &catalog(), "julia");
        assert_eq!(name.unwrap(), "deno");
    }

    #[test]
    fn test_select_empty_catalog_fails() {
        let err = select_kernel_name(&KernelHint::default(), &KernelspecMap::new(), "python3");
        assert!(matches!(err, Err(SessionError::NoKernelspec)));
    }
}
