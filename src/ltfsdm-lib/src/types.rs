use serde::{Deserialize, Serialize};

/// Sentinel for numeric wire fields that carry no value.
pub const UNSET: i64 = -1;

/// Request operation. The discriminant order is the scheduling priority:
/// a smaller value pre-empts a larger one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum OpKind {
    Mount,
    Move,
    Unmount,
    Format,
    Check,
    TraRecall,
    SelRecall,
    Migration,
}

impl OpKind {
    pub fn priority(self) -> i32 {
        match self {
            OpKind::Mount => 0,
            OpKind::Move => 1,
            OpKind::Unmount => 2,
            OpKind::Format => 3,
            OpKind::Check => 4,
            OpKind::TraRecall => 5,
            OpKind::SelRecall => 6,
            OpKind::Migration => 7,
        }
    }

    pub fn is_tape_move(self) -> bool {
        matches!(self, OpKind::Mount | OpKind::Move | OpKind::Unmount)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OpKind::Mount => "mount",
            OpKind::Move => "move",
            OpKind::Unmount => "unmount",
            OpKind::Format => "format",
            OpKind::Check => "check",
            OpKind::TraRecall => "transparent recall",
            OpKind::SelRecall => "selective recall",
            OpKind::Migration => "migration",
        }
    }

    pub fn from_str(s: &str) -> Option<OpKind> {
        match s {
            "mount" => Some(OpKind::Mount),
            "move" => Some(OpKind::Move),
            "unmount" => Some(OpKind::Unmount),
            "format" => Some(OpKind::Format),
            "check" => Some(OpKind::Check),
            "transparent recall" => Some(OpKind::TraRecall),
            "selective recall" => Some(OpKind::SelRecall),
            "migration" => Some(OpKind::Migration),
            _ => None,
        }
    }
}

/// Request lifecycle. Advances monotonically.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReqState {
    New,
    InProgress,
    Completed,
}

impl ReqState {
    pub fn as_str(self) -> &'static str {
        match self {
            ReqState::New => "new",
            ReqState::InProgress => "in progress",
            ReqState::Completed => "completed",
        }
    }

    pub fn from_str(s: &str) -> Option<ReqState> {
        match s {
            "new" => Some(ReqState::New),
            "in progress" => Some(ReqState::InProgress),
            "completed" => Some(ReqState::Completed),
            _ => None,
        }
    }
}

/// Target state a data-moving request drives its files towards.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetState {
    Resident,
    Premigrated,
    Migrated,
}

impl TargetState {
    pub fn as_str(self) -> &'static str {
        match self {
            TargetState::Resident => "resident",
            TargetState::Premigrated => "premigrated",
            TargetState::Migrated => "migrated",
        }
    }

    pub fn from_str(s: &str) -> Option<TargetState> {
        match s {
            "resident" => Some(TargetState::Resident),
            "premigrated" => Some(TargetState::Premigrated),
            "migrated" => Some(TargetState::Migrated),
            _ => None,
        }
    }
}

/// Per-file migration state as tracked in the job queue and in the
/// attribute store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileState {
    Resident,
    InMigration,
    Premigrated,
    Stubbing,
    Migrated,
    InRecall,
    Failed,
}

impl FileState {
    pub fn as_str(self) -> &'static str {
        match self {
            FileState::Resident => "resident",
            FileState::InMigration => "in migration",
            FileState::Premigrated => "premigrated",
            FileState::Stubbing => "stubbing",
            FileState::Migrated => "migrated",
            FileState::InRecall => "in recall",
            FileState::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<FileState> {
        match s {
            "resident" => Some(FileState::Resident),
            "in migration" => Some(FileState::InMigration),
            "premigrated" => Some(FileState::Premigrated),
            "stubbing" => Some(FileState::Stubbing),
            "migrated" => Some(FileState::Migrated),
            "in recall" => Some(FileState::InRecall),
            "failed" => Some(FileState::Failed),
            _ => None,
        }
    }

    /// Terminal states are never touched again by a worker of the
    /// request that produced them.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            FileState::Premigrated | FileState::Migrated | FileState::Resident | FileState::Failed
        )
    }
}
