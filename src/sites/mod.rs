use std::collections::HashMap;
use std::sync::Arc;

use crate::core::config::CollectorConfig;
use crate::core::error::Result;
use crate::interfaces::SearchSite;

pub mod youtube;

// ============================================================================
// 站点注册表
// ============================================================================

type SiteFactory = Box<dyn Fn(&CollectorConfig) -> Result<Arc<dyn SearchSite>> + Send + Sync>;

pub struct SiteRegistry {
    factories: HashMap<String, SiteFactory>,
}

impl SiteRegistry {
    pub fn new() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };
        registry.register(youtube::Youtube::ID, |cfg| {
            Ok(Arc::new(youtube::Youtube::new(cfg)?) as Arc<dyn SearchSite>)
        });
        registry
    }

    pub fn register<F>(&mut self, id: &str, factory: F)
    where
        F: Fn(&CollectorConfig) -> Result<Arc<dyn SearchSite>> + Send + Sync + 'static,
    {
        self.factories.insert(id.to_string(), Box::new(factory));
    }

    pub fn create(&self, id: &str, config: &CollectorConfig) -> Option<Result<Arc<dyn SearchSite>>> {
        self.factories.get(id).map(|f| f(config))
    }

    pub fn list(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.factories.keys().map(|s| s.as_str()).collect();
        ids.sort_unstable();
        ids
    }
}

impl Default for SiteRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn youtube_is_registered() {
        let registry = SiteRegistry::new();
        assert_eq!(registry.list(), vec!["youtube"]);
        let site = registry.create("youtube", &CollectorConfig::default()).unwrap().unwrap();
        assert_eq!(site.id(), "youtube");
        assert!(registry.create("vimeo", &CollectorConfig::default()).is_none());
    }
}
