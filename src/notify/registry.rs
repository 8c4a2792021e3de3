//! 通知先レジストリ
//!
//! 受信者集合の名前ごとに通知先を保持する。恒久的な失敗を返した通知先は
//! ここから取り除かれ、以降のジョブに含まれなくなる。

use parking_lot::RwLock;
use std::collections::HashMap;

use crate::models::Endpoint;

#[derive(Debug, Default)]
pub struct EndpointRegistry {
    sets: RwLock<HashMap<String, Vec<Endpoint>>>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 通知先を登録（重複は無視）
    pub fn register(&self, recipient_set: &str, endpoint: Endpoint) {
        let mut sets = self.sets.write();
        let endpoints = sets.entry(recipient_set.to_string()).or_default();
        if !endpoints.contains(&endpoint) {
            endpoints.push(endpoint);
        }
    }

    /// 通知先を外す。外れたらtrue
    pub fn remove(&self, recipient_set: &str, endpoint: &Endpoint) -> bool {
        let mut sets = self.sets.write();
        let Some(endpoints) = sets.get_mut(recipient_set) else {
            return false;
        };
        let before = endpoints.len();
        endpoints.retain(|e| e != endpoint);
        let removed = endpoints.len() != before;
        if removed {
            tracing::info!(
                "🗑️ [NOTIFY] endpoint removed set={} url={}",
                recipient_set,
                endpoint.url
            );
        }
        removed
    }

    pub fn endpoints(&self, recipient_set: &str) -> Vec<Endpoint> {
        self.sets
            .read()
            .get(recipient_set)
            .cloned()
            .unwrap_or_default()
    }

    /// 登録済みの集合なら、まだ登録されている通知先だけに絞る
    pub fn filter_active(&self, recipient_set: &str, targets: Vec<Endpoint>) -> Vec<Endpoint> {
        match self.sets.read().get(recipient_set) {
            Some(active) => targets.into_iter().filter(|t| active.contains(t)).collect(),
            None => targets,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_remove() {
        let registry = EndpointRegistry::new();
        registry.register("highlights", Endpoint::webhook("http://a"));
        registry.register("highlights", Endpoint::webhook("http://a"));
        registry.register("highlights", Endpoint::push("http://b"));
        assert_eq!(registry.endpoints("highlights").len(), 2);

        assert!(registry.remove("highlights", &Endpoint::webhook("http://a")));
        assert!(!registry.remove("highlights", &Endpoint::webhook("http://a")));
        assert_eq!(
            registry.endpoints("highlights"),
            vec![Endpoint::push("http://b")]
        );
    }

    #[test]
    fn test_filter_active() {
        let registry = EndpointRegistry::new();
        registry.register("set", Endpoint::webhook("http://a"));
        let targets = vec![Endpoint::webhook("http://a"), Endpoint::webhook("http://gone")];
        assert_eq!(
            registry.filter_active("set", targets.clone()),
            vec![Endpoint::webhook("http://a")]
        );
        // 未登録の集合はそのまま
        assert_eq!(registry.filter_active("adhoc", targets.clone()), targets);
    }
}
