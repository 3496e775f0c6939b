use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard};

use lru::LruCache;
use tempo_core::Timeperiod;
use tracing::debug;

use crate::types::{TreeNode, TreeView};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    tree: String,
    /// `None` for the whole-tree view.
    node: Option<(String, Timeperiod)>,
}

#[derive(Clone)]
enum CachedView {
    Tree(Arc<TreeView>),
    Nodes(Arc<Vec<TreeNode>>),
}

/// Bounded LRU of built tree views, keyed by tree name and requested node.
///
/// Any write that touches a tree must call [`TreeCache::invalidate_tree`].
pub struct TreeCache {
    inner: Mutex<LruCache<CacheKey, CachedView>>,
}

impl TreeCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<CacheKey, CachedView>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn tree(&self, tree: &str) -> Option<Arc<TreeView>> {
        let key = CacheKey {
            tree: tree.to_string(),
            node: None,
        };
        match self.lock().get(&key) {
            Some(CachedView::Tree(view)) => Some(Arc::clone(view)),
            _ => None,
        }
    }

    pub fn put_tree(&self, tree: &str, view: Arc<TreeView>) {
        let key = CacheKey {
            tree: tree.to_string(),
            node: None,
        };
        self.lock().put(key, CachedView::Tree(view));
    }

    pub fn nodes(&self, tree: &str, process_name: &str, timeperiod: &Timeperiod) -> Option<Arc<Vec<TreeNode>>> {
        let key = CacheKey {
            tree: tree.to_string(),
            node: Some((process_name.to_string(), timeperiod.clone())),
        };
        match self.lock().get(&key) {
            Some(CachedView::Nodes(nodes)) => Some(Arc::clone(nodes)),
            _ => None,
        }
    }

    pub fn put_nodes(
        &self,
        tree: &str,
        process_name: &str,
        timeperiod: &Timeperiod,
        nodes: Arc<Vec<TreeNode>>,
    ) {
        let key = CacheKey {
            tree: tree.to_string(),
            node: Some((process_name.to_string(), timeperiod.clone())),
        };
        self.lock().put(key, CachedView::Nodes(nodes));
    }

    /// Drop every cached view of `tree`. Returns how many were dropped.
    pub fn invalidate_tree(&self, tree: &str) -> usize {
        let mut cache = self.lock();
        let stale: Vec<CacheKey> = cache
            .iter()
            .filter(|(k, _)| k.tree == tree)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &stale {
            cache.pop(key);
        }
        if !stale.is_empty() {
            debug!(tree, dropped = stale.len(), "tree cache invalidated");
        }
        stale.len()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view(name: &str) -> Arc<TreeView> {
        Arc::new(TreeView {
            tree_name: name.to_string(),
            dependent_on: vec![],
            dependant_trees: vec![],
            processes: vec![],
            nodes: vec![],
        })
    }

    #[test]
    fn invalidation_is_scoped_to_one_tree() {
        let cache = TreeCache::new(8);
        let tp = Timeperiod::parse("2024031500").unwrap();
        cache.put_tree("site", view("site"));
        cache.put_nodes("site", "SiteDaily", &tp, Arc::new(vec![]));
        cache.put_tree("alert", view("alert"));

        assert_eq!(cache.invalidate_tree("site"), 2);
        assert!(cache.tree("site").is_none());
        assert!(cache.nodes("site", "SiteDaily", &tp).is_none());
        assert!(cache.tree("alert").is_some());
    }

    #[test]
    fn capacity_is_bounded() {
        let cache = TreeCache::new(2);
        cache.put_tree("a", view("a"));
        cache.put_tree("b", view("b"));
        cache.put_tree("c", view("c"));
        assert_eq!(cache.len(), 2);
        assert!(cache.tree("a").is_none());

        let zero = TreeCache::new(0);
        zero.put_tree("a", view("a"));
        assert_eq!(zero.len(), 1);
    }
}
