use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// How a managed process walks through its timeperiods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateMachineKind {
    /// May run on the still-open timeperiod; re-runs it until it closes.
    Continuous,
    /// Starts a timeperiod only once its finer-grained buckets are terminal.
    Discrete,
    /// Starts a closed timeperiod once its dependencies allow it.
    SimpleDiscrete,
}

impl StateMachineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StateMachineKind::Continuous => "continuous",
            StateMachineKind::Discrete => "discrete",
            StateMachineKind::SimpleDiscrete => "simple_discrete",
        }
    }
}

impl std::fmt::Display for StateMachineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StateMachineKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "continuous" => Ok(StateMachineKind::Continuous),
            "discrete" => Ok(StateMachineKind::Discrete),
            "simple_discrete" => Ok(StateMachineKind::SimpleDiscrete),
            other => Err(CoreError::UnknownVariant(format!("state machine {other}"))),
        }
    }
}

/// Blocking policy between a node and its children or dependency trees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockingType {
    BlockingNormal,
    BlockingChildren,
    BlockingDependencies,
}

impl BlockingType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockingType::BlockingNormal => "blocking_normal",
            BlockingType::BlockingChildren => "blocking_children",
            BlockingType::BlockingDependencies => "blocking_dependencies",
        }
    }
}

impl std::fmt::Display for BlockingType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BlockingType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "blocking_normal" => Ok(BlockingType::BlockingNormal),
            "blocking_children" => Ok(BlockingType::BlockingChildren),
            "blocking_dependencies" => Ok(BlockingType::BlockingDependencies),
            other => Err(CoreError::UnknownVariant(format!("blocking type {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_variants_are_rejected() {
        let ok: BlockingType = serde_json::from_str("\"blocking_children\"").unwrap();
        assert_eq!(ok, BlockingType::BlockingChildren);
        assert!(serde_json::from_str::<BlockingType>("\"blocking_everything\"").is_err());
        assert!(serde_json::from_str::<StateMachineKind>("\"pipeline_continuous\"").is_err());
    }

    #[test]
    fn display_matches_serde_name() {
        for kind in [
            StateMachineKind::Continuous,
            StateMachineKind::Discrete,
            StateMachineKind::SimpleDiscrete,
        ] {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{kind}\""));
            assert_eq!(kind.as_str().parse::<StateMachineKind>().unwrap(), kind);
        }
        assert!("blocking_all".parse::<BlockingType>().is_err());
    }
}
