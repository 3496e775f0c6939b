use std::collections::{BTreeMap, HashMap, HashSet};

use serde::Serialize;
use tempo_core::config::TempoConfig;
use tempo_core::TimeQualifier;
use tracing::debug;

use crate::error::{RegistryError, Result};
use crate::types::{ScheduleKey, FREERUN_SEPARATOR};

/// One level of a timetable tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TreeLevel {
    pub process_name: String,
    pub time_qualifier: TimeQualifier,
}

/// Static shape of a tree: its levels ordered coarsest → finest, and its edges
/// in the dependency graph.
#[derive(Debug, Clone, Serialize)]
pub struct TreeTopology {
    pub name: String,
    pub levels: Vec<TreeLevel>,
    /// Trees this tree waits on.
    pub dependent_on: Vec<String>,
    /// Trees that wait on this tree.
    pub dependant_trees: Vec<String>,
}

impl TreeTopology {
    pub fn level_for(&self, qualifier: TimeQualifier) -> Option<&TreeLevel> {
        self.levels.iter().find(|l| l.time_qualifier == qualifier)
    }

    pub fn position(&self, process_name: &str) -> Option<usize> {
        self.levels.iter().position(|l| l.process_name == process_name)
    }

    /// Finest level that is coarser than `qualifier`.
    pub fn nearest_coarser(&self, qualifier: TimeQualifier) -> Option<&TreeLevel> {
        self.levels
            .iter()
            .filter(|l| l.time_qualifier > qualifier)
            .min_by_key(|l| l.time_qualifier)
    }
}

/// Immutable tree layout plus the cycle-checked dependency graph.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    trees: BTreeMap<String, TreeTopology>,
    process_tree: HashMap<String, String>,
    schedule_keys: Vec<ScheduleKey>,
}

impl Topology {
    /// Validate the configuration and build the topology.
    ///
    /// Rejects process names containing `::`, duplicate names, processes in zero or several trees, trees
    /// whose levels are not one-per-qualifier and contiguous, unknown
    /// `dependent_on` targets and dependency cycles.
    pub fn build(config: &TempoConfig) -> Result<Self> {
        let mut qualifiers: HashMap<&str, TimeQualifier> = HashMap::new();
        let mut schedule_keys = Vec::new();
        for entry in &config.managed {
            if entry.process_name.contains(FREERUN_SEPARATOR) {
                return Err(RegistryError::ReservedSeparator(entry.process_name.clone()));
            }
            if qualifiers
                .insert(&entry.process_name, entry.time_qualifier)
                .is_some()
            {
                return Err(RegistryError::DuplicateProcess(entry.process_name.clone()));
            }
            schedule_keys.push(ScheduleKey::Managed(entry.process_name.clone()));
        }

        let mut freerun_seen = HashSet::new();
        for entry in &config.freerun {
            if entry.process_name.contains(FREERUN_SEPARATOR) {
                return Err(RegistryError::ReservedSeparator(entry.process_name.clone()));
            }
            if !freerun_seen.insert((&entry.process_name, &entry.entry_name)) {
                return Err(RegistryError::DuplicateFreerun {
                    process_name: entry.process_name.clone(),
                    entry_name: entry.entry_name.clone(),
                });
            }
            schedule_keys.push(ScheduleKey::Freerun {
                process_name: entry.process_name.clone(),
                entry_name: entry.entry_name.clone(),
            });
        }

        let mut trees = BTreeMap::new();
        let mut process_tree: HashMap<String, String> = HashMap::new();
        for tree in &config.trees {
            if trees.contains_key(&tree.name) {
                return Err(RegistryError::DuplicateTree(tree.name.clone()));
            }
            if tree.processes.is_empty() {
                return Err(invalid(&tree.name, "tree has no processes"));
            }

            let mut levels = Vec::with_capacity(tree.processes.len());
            for process in &tree.processes {
                let qualifier = *qualifiers.get(process.as_str()).ok_or_else(|| {
                    RegistryError::UnknownProcess {
                        tree: tree.name.clone(),
                        process: process.clone(),
                    }
                })?;
                if let Some(first) = process_tree.insert(process.clone(), tree.name.clone()) {
                    return Err(RegistryError::ProcessInMultipleTrees {
                        process: process.clone(),
                        first,
                        second: tree.name.clone(),
                    });
                }
                levels.push(TreeLevel {
                    process_name: process.clone(),
                    time_qualifier: qualifier,
                });
            }

            levels.sort_by(|a, b| b.time_qualifier.cmp(&a.time_qualifier));
            for pair in levels.windows(2) {
                if pair[0].time_qualifier == pair[1].time_qualifier {
                    return Err(invalid(
                        &tree.name,
                        &format!("two processes at qualifier {}", pair[0].time_qualifier),
                    ));
                }
                if pair[0].time_qualifier.finer() != Some(pair[1].time_qualifier) {
                    return Err(invalid(
                        &tree.name,
                        &format!(
                            "levels {} and {} are not adjacent",
                            pair[0].time_qualifier, pair[1].time_qualifier
                        ),
                    ));
                }
            }

            trees.insert(
                tree.name.clone(),
                TreeTopology {
                    name: tree.name.clone(),
                    levels,
                    dependent_on: tree.dependent_on.clone(),
                    dependant_trees: Vec::new(),
                },
            );
        }

        for entry in &config.managed {
            if !process_tree.contains_key(&entry.process_name) {
                return Err(RegistryError::OrphanProcess(entry.process_name.clone()));
            }
        }

        // resolve edges, then derive the reverse direction
        let mut reverse: Vec<(String, String)> = Vec::new();
        for tree in trees.values() {
            for dependency in &tree.dependent_on {
                if !trees.contains_key(dependency) {
                    return Err(RegistryError::UnknownTree {
                        tree: tree.name.clone(),
                        dependency: dependency.clone(),
                    });
                }
                reverse.push((dependency.clone(), tree.name.clone()));
            }
        }
        for (dependency, dependant) in reverse {
            if let Some(tree) = trees.get_mut(&dependency) {
                if !tree.dependant_trees.contains(&dependant) {
                    tree.dependant_trees.push(dependant);
                }
            }
        }

        let topology = Self {
            trees,
            process_tree,
            schedule_keys,
        };
        topology.check_acyclic()?;
        debug!(trees = topology.trees.len(), "topology built");
        Ok(topology)
    }

    fn check_acyclic(&self) -> Result<()> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        fn visit(
            topology: &Topology,
            name: &str,
            marks: &mut HashMap<String, Mark>,
            path: &mut Vec<String>,
        ) -> Result<()> {
            match marks.get(name) {
                Some(Mark::Done) => return Ok(()),
                Some(Mark::Visiting) => {
                    let start = path.iter().position(|p| p == name).unwrap_or(0);
                    let mut cycle = path[start..].to_vec();
                    cycle.push(name.to_string());
                    return Err(RegistryError::DependencyCycle(cycle));
                }
                None => {}
            }
            marks.insert(name.to_string(), Mark::Visiting);
            path.push(name.to_string());
            if let Some(tree) = topology.trees.get(name) {
                for dependency in &tree.dependent_on {
                    visit(topology, dependency, marks, path)?;
                }
            }
            path.pop();
            marks.insert(name.to_string(), Mark::Done);
            Ok(())
        }

        let mut marks = HashMap::new();
        for name in self.trees.keys() {
            visit(self, name, &mut marks, &mut Vec::new())?;
        }
        Ok(())
    }

    pub fn tree(&self, name: &str) -> Option<&TreeTopology> {
        self.trees.get(name)
    }

    pub fn trees(&self) -> impl Iterator<Item = &TreeTopology> {
        self.trees.values()
    }

    pub fn tree_of(&self, process_name: &str) -> Option<&TreeTopology> {
        self.process_tree
            .get(process_name)
            .and_then(|t| self.trees.get(t))
    }

    pub fn qualifier_of(&self, process_name: &str) -> Option<TimeQualifier> {
        let tree = self.tree_of(process_name)?;
        tree.levels
            .iter()
            .find(|l| l.process_name == process_name)
            .map(|l| l.time_qualifier)
    }

    /// Level one qualifier up in the same tree.
    pub fn parent_level(&self, process_name: &str) -> Option<&TreeLevel> {
        let tree = self.tree_of(process_name)?;
        let position = tree.position(process_name)?;
        position.checked_sub(1).and_then(|p| tree.levels.get(p))
    }

    /// Level one qualifier down in the same tree.
    pub fn child_level(&self, process_name: &str) -> Option<&TreeLevel> {
        let tree = self.tree_of(process_name)?;
        let position = tree.position(process_name)?;
        tree.levels.get(position + 1)
    }

    /// Trees the process's tree depends on.
    pub fn dependencies_of(&self, process_name: &str) -> Vec<&TreeTopology> {
        self.tree_of(process_name)
            .map(|tree| {
                tree.dependent_on
                    .iter()
                    .filter_map(|d| self.trees.get(d))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Trees that depend on the process's tree.
    pub fn dependants_of(&self, process_name: &str) -> Vec<&TreeTopology> {
        self.tree_of(process_name)
            .map(|tree| {
                tree.dependant_trees
                    .iter()
                    .filter_map(|d| self.trees.get(d))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every timer the scheduler should run, managed entries first.
    pub fn schedule_keys(&self) -> &[ScheduleKey] {
        &self.schedule_keys
    }
}

fn invalid(tree: &str, reason: &str) -> RegistryError {
    RegistryError::InvalidTree {
        tree: tree.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempo_core::config::{FreerunEntryConfig, ManagedEntryConfig, TreeConfig};
    use tempo_core::{BlockingType, StateMachineKind, TriggerFrequency};

    fn managed(name: &str, qualifier: TimeQualifier) -> ManagedEntryConfig {
        ManagedEntryConfig {
            process_name: name.to_string(),
            time_qualifier: qualifier,
            state_machine_name: StateMachineKind::Discrete,
            blocking_type: BlockingType::BlockingNormal,
            trigger_frequency: TriggerFrequency::every(60),
            is_on: true,
        }
    }

    fn tree(name: &str, processes: &[&str], dependent_on: &[&str]) -> TreeConfig {
        TreeConfig {
            name: name.to_string(),
            processes: processes.iter().map(|p| p.to_string()).collect(),
            dependent_on: dependent_on.iter().map(|p| p.to_string()).collect(),
        }
    }

    fn two_trees() -> TempoConfig {
        TempoConfig {
            managed: vec![
                managed("SiteDaily", TimeQualifier::Daily),
                managed("SiteHourly", TimeQualifier::Hourly),
                managed("AlertDaily", TimeQualifier::Daily),
            ],
            trees: vec![
                tree("site", &["SiteHourly", "SiteDaily"], &[]),
                tree("alert", &["AlertDaily"], &["site"]),
            ],
            ..TempoConfig::default()
        }
    }

    #[test]
    fn levels_are_ordered_coarsest_first() {
        let topology = Topology::build(&two_trees()).unwrap();
        let site = topology.tree("site").unwrap();
        assert_eq!(site.levels[0].process_name, "SiteDaily");
        assert_eq!(site.levels[1].process_name, "SiteHourly");
        assert_eq!(
            topology.parent_level("SiteHourly").unwrap().process_name,
            "SiteDaily"
        );
        assert_eq!(
            topology.child_level("SiteDaily").unwrap().process_name,
            "SiteHourly"
        );
        assert!(topology.parent_level("SiteDaily").is_none());
        assert_eq!(site.dependant_trees, vec!["alert".to_string()]);
        assert_eq!(topology.dependencies_of("AlertDaily")[0].name, "site");
        assert_eq!(topology.dependants_of("SiteHourly")[0].name, "alert");
    }

    #[test]
    fn cycles_are_rejected() {
        let mut config = two_trees();
        config.trees[0].dependent_on = vec!["alert".to_string()];
        let err = Topology::build(&config).unwrap_err();
        assert_eq!(err.code(), "DEPENDENCY_CYCLE");
        match err {
            RegistryError::DependencyCycle(path) => {
                assert_eq!(path.first(), path.last());
                assert!(path.len() >= 3);
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let mut config = two_trees();
        config.trees[1].dependent_on = vec!["alert".to_string()];
        assert!(matches!(
            Topology::build(&config),
            Err(RegistryError::DependencyCycle(_))
        ));
    }

    #[test]
    fn structural_errors_are_reported() {
        let mut duplicate = two_trees();
        duplicate.managed.push(managed("SiteDaily", TimeQualifier::Daily));
        assert!(matches!(
            Topology::build(&duplicate),
            Err(RegistryError::DuplicateProcess(_))
        ));

        let mut orphan = two_trees();
        orphan.managed.push(managed("Lonely", TimeQualifier::Hourly));
        assert!(matches!(
            Topology::build(&orphan),
            Err(RegistryError::OrphanProcess(_))
        ));

        let mut shared = two_trees();
        shared.trees[1].processes.push("SiteHourly".to_string());
        assert!(matches!(
            Topology::build(&shared),
            Err(RegistryError::ProcessInMultipleTrees { .. })
        ));

        let mut unknown = two_trees();
        unknown.trees[1].dependent_on = vec!["nowhere".to_string()];
        assert!(matches!(
            Topology::build(&unknown),
            Err(RegistryError::UnknownTree { .. })
        ));

        let mut gap = two_trees();
        gap.managed.push(managed("SiteMonthly", TimeQualifier::Yearly));
        gap.trees[0].processes.push("SiteMonthly".to_string());
        assert!(matches!(
            Topology::build(&gap),
            Err(RegistryError::InvalidTree { .. })
        ));
    }

    #[test]
    fn process_names_cannot_look_like_freerun_keys() {
        let mut config = two_trees();
        config.managed[0].process_name = "Site::Daily".to_string();
        config.trees[0].processes[1] = "Site::Daily".to_string();
        let err = Topology::build(&config).unwrap_err();
        assert!(matches!(err, RegistryError::ReservedSeparator(ref name) if name == "Site::Daily"));
        assert_eq!(err.code(), "CONFIG_ERROR");

        let mut config = two_trees();
        config.freerun.push(FreerunEntryConfig {
            process_name: "Cleanup::Worker".to_string(),
            entry_name: "nightly".to_string(),
            trigger_frequency: TriggerFrequency::every(3600),
            is_on: true,
            description: None,
        });
        assert!(matches!(
            Topology::build(&config),
            Err(RegistryError::ReservedSeparator(_))
        ));
    }
}
