use std::sync::Arc;

use tempo_core::timeperiod::{cast, next};
use tempo_core::{TimeQualifier, Timeperiod};
use tempo_registry::{ManagedProcessEntry, ProcessRegistry, Topology};
use tempo_store::UowStore;
use tracing::{debug, instrument};

use crate::cache::TreeCache;
use crate::error::{Result, TimetableError};
use crate::types::{ProcessSummary, TreeNode, TreeView};

/// Structural view over the store: trees, their nodes and the blocking
/// checks that read them.
pub struct Timetable {
    topology: Arc<Topology>,
    registry: Arc<ProcessRegistry>,
    store: Arc<UowStore>,
    cache: TreeCache,
}

impl Timetable {
    pub fn new(
        topology: Arc<Topology>,
        registry: Arc<ProcessRegistry>,
        store: Arc<UowStore>,
        cache_capacity: usize,
    ) -> Self {
        Self {
            topology,
            registry,
            store,
            cache: TreeCache::new(cache_capacity),
        }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub(crate) fn store(&self) -> &UowStore {
        &self.store
    }

    /// Cached whole-tree view.
    pub fn get_tree(&self, tree_name: &str) -> Result<Arc<TreeView>> {
        if let Some(view) = self.cache.tree(tree_name) {
            return Ok(view);
        }
        let view = Arc::new(self.build_tree(tree_name)?);
        self.cache.put_tree(tree_name, Arc::clone(&view));
        Ok(view)
    }

    /// Cached children of one node.
    pub fn get_tree_nodes(&self, process_name: &str, timeperiod: &Timeperiod) -> Result<Arc<Vec<TreeNode>>> {
        let tree = self
            .topology
            .tree_of(process_name)
            .ok_or_else(|| TimetableError::ProcessNotFound(process_name.to_string()))?;
        if let Some(nodes) = self.cache.nodes(&tree.name, process_name, timeperiod) {
            return Ok(nodes);
        }
        let nodes = Arc::new(self.build_tree_nodes(process_name, timeperiod)?);
        self.cache
            .put_nodes(&tree.name, process_name, timeperiod, Arc::clone(&nodes));
        Ok(nodes)
    }

    /// Build a tree view straight from the store, bypassing the cache.
    #[instrument(skip(self))]
    pub fn build_tree(&self, tree_name: &str) -> Result<TreeView> {
        let tree = self
            .topology
            .tree(tree_name)
            .ok_or_else(|| TimetableError::TreeNotFound(tree_name.to_string()))?;

        let mut processes = Vec::with_capacity(tree.levels.len());
        for level in &tree.levels {
            let entry = self.registry.managed_entry(&level.process_name)?;
            let next_timeperiod = self.resolve_next_timeperiod(&entry)?;
            processes.push(ProcessSummary::new(entry, next_timeperiod));
        }

        let nodes = match tree.levels.first() {
            Some(top) => {
                let has_children = tree.levels.len() > 1;
                self.store
                    .jobs(&top.process_name, top.time_qualifier)?
                    .into_iter()
                    .map(|job| TreeNode::from_job(job, has_children))
                    .collect()
            }
            None => Vec::new(),
        };

        debug!(nodes = nodes.len(), "tree view built");
        Ok(TreeView {
            tree_name: tree.name.clone(),
            dependent_on: tree.dependent_on.clone(),
            dependant_trees: tree.dependant_trees.clone(),
            processes,
            nodes,
        })
    }

    /// Existing buckets one level down whose parent is `timeperiod`.
    pub fn build_tree_nodes(&self, process_name: &str, timeperiod: &Timeperiod) -> Result<Vec<TreeNode>> {
        let qualifier = self
            .topology
            .qualifier_of(process_name)
            .ok_or_else(|| TimetableError::ProcessNotFound(process_name.to_string()))?;
        let Some(child) = self.topology.child_level(process_name) else {
            return Ok(Vec::new());
        };
        let grandchildren = self.topology.child_level(&child.process_name).is_some();

        let parent = cast(timeperiod, qualifier);
        let from = cast(&parent, child.time_qualifier);
        let to = cast(&next(&parent, qualifier), child.time_qualifier);
        let nodes = self
            .store
            .jobs_between(&child.process_name, child.time_qualifier, &from, &to)?
            .into_iter()
            .map(|job| TreeNode::from_job(job, grandchildren))
            .filter(|node| node.parent_timeperiod.as_ref() == Some(&parent))
            .collect();
        Ok(nodes)
    }

    /// Header of every managed process, in registry order. Not cached.
    pub fn process_summaries(&self) -> Result<Vec<ProcessSummary>> {
        self.registry
            .managed_entries()?
            .into_iter()
            .map(|entry| {
                let next_timeperiod = self.resolve_next_timeperiod(&entry)?;
                Ok(ProcessSummary::new(entry, next_timeperiod))
            })
            .collect()
    }

    /// The declared `next_timeperiod` if a bucket exists for it, otherwise
    /// the greatest existing bucket.
    pub fn resolve_next_timeperiod(&self, entry: &ManagedProcessEntry) -> Result<Option<Timeperiod>> {
        if let Some(declared) = &entry.next_timeperiod {
            if self
                .store
                .job(&entry.process_name, entry.time_qualifier, declared)?
                .is_some()
            {
                return Ok(Some(declared.clone()));
            }
        }
        Ok(self
            .store
            .max_job_timeperiod(&entry.process_name, entry.time_qualifier)?)
    }

    /// Drop cached views of the tree holding `process_name`.
    pub fn invalidate_process(&self, process_name: &str) {
        if let Some(tree) = self.topology.tree_of(process_name) {
            self.cache.invalidate_tree(&tree.name);
        }
    }

    pub fn invalidate_all(&self) {
        self.cache.clear();
    }

    pub(crate) fn qualifier(&self, process_name: &str) -> Result<TimeQualifier> {
        self.topology
            .qualifier_of(process_name)
            .ok_or_else(|| TimetableError::ProcessNotFound(process_name.to_string()))
    }
}
