//! Agent actions and their fixed wire codes.

use std::{fmt, str::FromStr};

use thiserror::Error;

/// Structured in-game action performed by the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentAction {
    /// Attack in the facing direction.
    Attack,
    /// Pick up items of a kind nearby.
    Collect,
    /// Break the block in a direction.
    Destroy,
    /// Check for redstone power in a direction.
    DetectRedstone,
    /// Check whether a direction is blocked.
    DetectObstacle,
    /// Drop items from one inventory slot.
    Drop,
    /// Drop the whole inventory.
    DropAll,
    /// Report the block in a direction.
    Inspect,
    /// Count the items in a slot.
    InspectItemCount,
    /// Describe the item in a slot.
    InspectItemDetail,
    /// Report the free space in a slot.
    InspectItemSpace,
    /// Use the block in a direction.
    Interact,
    /// Move one block in a direction.
    Move,
    /// Place a block from a slot.
    PlaceBlock,
    /// Till the ground in a direction.
    Till,
    /// Move items between inventory slots.
    TransferItemTo,
    /// Turn left or right.
    Turn,
}

impl AgentAction {
    /// Every action, in code order.
    pub const ALL: [Self; 17] = [
        Self::Attack,
        Self::Collect,
        Self::Destroy,
        Self::DetectRedstone,
        Self::DetectObstacle,
        Self::Drop,
        Self::DropAll,
        Self::Inspect,
        Self::InspectItemCount,
        Self::InspectItemDetail,
        Self::InspectItemSpace,
        Self::Interact,
        Self::Move,
        Self::PlaceBlock,
        Self::Till,
        Self::TransferItemTo,
        Self::Turn,
    ];

    /// Name used in `actionName`.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Attack => "attack",
            Self::Collect => "collect",
            Self::Destroy => "destroy",
            Self::DetectRedstone => "detectRedstone",
            Self::DetectObstacle => "detectObstacle",
            Self::Drop => "drop",
            Self::DropAll => "dropAll",
            Self::Inspect => "inspect",
            Self::InspectItemCount => "inspectItemCount",
            Self::InspectItemDetail => "inspectItemDetail",
            Self::InspectItemSpace => "inspectItemSpace",
            Self::Interact => "interact",
            Self::Move => "move",
            Self::PlaceBlock => "placeBlock",
            Self::Till => "till",
            Self::TransferItemTo => "transferItemTo",
            Self::Turn => "turn",
        }
    }

    /// Code used in the `action` header field. 9 is unassigned.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Attack => 1,
            Self::Collect => 2,
            Self::Destroy => 3,
            Self::DetectRedstone => 4,
            Self::DetectObstacle => 5,
            Self::Drop => 6,
            Self::DropAll => 7,
            Self::Inspect => 8,
            Self::InspectItemCount => 10,
            Self::InspectItemDetail => 11,
            Self::InspectItemSpace => 12,
            Self::Interact => 13,
            Self::Move => 14,
            Self::PlaceBlock => 15,
            Self::Till => 16,
            Self::TransferItemTo => 17,
            Self::Turn => 18,
        }
    }
}

/// Action name outside the fixed table.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown agent action: {0}")]
pub struct UnknownAction(pub String);

impl FromStr for AgentAction {
    type Err = UnknownAction;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|action| action.name() == s)
            .ok_or_else(|| UnknownAction(s.to_string()))
    }
}

impl fmt::Display for AgentAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn test_table_is_consistent() {
        let codes: HashSet<u8> = AgentAction::ALL.iter().map(|a| a.code()).collect();
        assert_eq!(codes.len(), AgentAction::ALL.len());
        assert!(!codes.contains(&9));
        for action in AgentAction::ALL {
            assert_eq!(action.name().parse::<AgentAction>().unwrap(), action);
        }
    }

    #[test]
    fn test_known_codes() {
        assert_eq!("attack".parse::<AgentAction>().unwrap().code(), 1);
        assert_eq!("inspectItemCount".parse::<AgentAction>().unwrap().code(), 10);
        assert_eq!("turn".parse::<AgentAction>().unwrap().code(), 18);
    }

    #[test]
    fn test_unknown_action() {
        let err = "fly".parse::<AgentAction>().unwrap_err();
        assert_eq!(err, UnknownAction("fly".to_string()));
    }
}
