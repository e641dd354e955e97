// MIT License - Copyright (c) 2026 Peter Wright
// Per-parent object caches and session-wide invalidation

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use crate::cgate::objects::{Group, Project};
use crate::cgate::protocol::ObjectPath;

/// Object categories that can be invalidated independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheCategory {
    Projects,
    Networks,
    Applications,
    Groups,
    Units,
}

/// Children of one parent object, keyed and iterated in ascending key order.
#[derive(Debug)]
pub struct ObjectCache<K, T> {
    entries: RwLock<BTreeMap<K, Arc<T>>>,
}

impl<K: Ord + Clone, T> Default for ObjectCache<K, T> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
        }
    }
}

impl<K: Ord + Clone, T> ObjectCache<K, T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, key: &K) -> Option<Arc<T>> {
        self.entries.read().await.get(key).cloned()
    }

    /// Return the cached object for `key`, creating it with `make` if absent.
    ///
    /// Concurrent callers for the same key all receive the same instance.
    pub async fn get_or_insert_with(&self, key: K, make: impl FnOnce() -> T) -> Arc<T> {
        if let Some(existing) = self.entries.read().await.get(&key) {
            return existing.clone();
        }
        self.entries
            .write()
            .await
            .entry(key)
            .or_insert_with(|| Arc::new(make()))
            .clone()
    }

    /// All cached objects in ascending key order.
    pub async fn values(&self) -> Vec<Arc<T>> {
        self.entries.read().await.values().cloned().collect()
    }

    pub async fn remove(&self, key: &K) -> Option<Arc<T>> {
        self.entries.write().await.remove(key)
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

/// Root of the object hierarchy owned by one session.
#[derive(Debug, Default)]
pub struct SessionCache {
    projects: ObjectCache<String, Project>,
}

impl SessionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached project by name, without contacting C-Gate.
    pub async fn project(&self, name: &str) -> Option<Arc<Project>> {
        self.projects.get(&name.to_string()).await
    }

    /// Cached project by name, created on first sight. Blank names mean "none".
    pub async fn get_or_create_project(&self, name: &str) -> Option<Arc<Project>> {
        let name = name.trim();
        if name.is_empty() {
            return None;
        }
        Some(
            self.projects
                .get_or_insert_with(name.to_string(), || Project::new(name))
                .await,
        )
    }

    pub async fn projects(&self) -> Vec<Arc<Project>> {
        self.projects.values().await
    }

    /// Resolve a cached group from its address.
    pub async fn find_group(&self, path: &ObjectPath) -> Option<Arc<Group>> {
        let ObjectPath::Group {
            project,
            network,
            application,
            group,
        } = path
        else {
            return None;
        };
        let project = self.project(project).await?;
        let network = project.network(*network).await?;
        let application = network.application(*application).await?;
        application.group(*group).await
    }

    /// Drop every cached object of `category`, across all parents.
    pub async fn invalidate(&self, category: CacheCategory) {
        debug!("Invalidating cached {:?}", category);
        if category == CacheCategory::Projects {
            self.projects.clear().await;
            return;
        }
        for project in self.projects.values().await {
            if category == CacheCategory::Networks {
                project.networks().clear().await;
                continue;
            }
            for network in project.networks().values().await {
                match category {
                    CacheCategory::Applications => network.applications().clear().await,
                    CacheCategory::Units => network.units().clear().await,
                    CacheCategory::Groups => {
                        for application in network.applications().values().await {
                            application.groups().clear().await;
                        }
                    }
                    CacheCategory::Projects | CacheCategory::Networks => {}
                }
            }
        }
    }

    pub async fn invalidate_all(&self) {
        self.invalidate(CacheCategory::Projects).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_values_in_ascending_order() {
        let cache: ObjectCache<u8, &str> = ObjectCache::new();
        cache.get_or_insert_with(56, || "lighting").await;
        cache.get_or_insert_with(2, || "first").await;
        cache.get_or_insert_with(203, || "enable").await;
        let values: Vec<&str> = cache.values().await.iter().map(|v| **v).collect();
        assert_eq!(values, vec!["first", "lighting", "enable"]);
    }

    #[tokio::test]
    async fn test_get_or_insert_keeps_first_instance() {
        let cache: ObjectCache<u8, String> = ObjectCache::new();
        let a = cache.get_or_insert_with(1, || "a".to_string()).await;
        let b = cache.get_or_insert_with(1, || "b".to_string()).await;
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(*b, "a");
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_invalidate_by_category() {
        let cache = SessionCache::new();
        let project = cache.get_or_create_project("HOME").await.unwrap();
        let network = project.get_or_create_network("254").await.unwrap();
        let app = network.get_or_create_application("56").await.unwrap();
        app.get_or_create_group("1").await.unwrap();
        network.get_or_create_unit("12").await.unwrap();

        cache.invalidate(CacheCategory::Groups).await;
        assert!(app.groups().is_empty().await);
        assert_eq!(network.units().len().await, 1);

        cache.invalidate(CacheCategory::Units).await;
        assert!(network.units().is_empty().await);
        assert_eq!(network.applications().len().await, 1);

        cache.invalidate(CacheCategory::Networks).await;
        assert!(project.networks().is_empty().await);

        cache.invalidate_all().await;
        assert!(cache.projects().await.is_empty());
    }

    #[tokio::test]
    async fn test_find_group_by_path() {
        let cache = SessionCache::new();
        let project = cache.get_or_create_project("HOME").await.unwrap();
        let network = project.get_or_create_network("254").await.unwrap();
        let app = network.get_or_create_application("56").await.unwrap();
        let group = app.get_or_create_group("7").await.unwrap();

        let path = ObjectPath::parse("//HOME/254/56/7").unwrap();
        let found = cache.find_group(&path).await.unwrap();
        assert!(Arc::ptr_eq(&found, &group));
        assert!(cache.find_group(&ObjectPath::parse("//HOME/254/56/8").unwrap()).await.is_none());
        assert!(cache.get_or_create_project("  ").await.is_none());
    }
}
