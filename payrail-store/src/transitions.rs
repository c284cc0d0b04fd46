//! Status machines held as data. Both the engines and the storage boundary
//! consult the same tables, so a transition rejected here is rejected
//! everywhere.

use serde::Deserialize;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstructionStatus {
    Created,
    Queued,
    Submitted,
    Accepted,
    Settled,
    Failed,
    Canceled,
    Returned,
    Reversed,
}

impl InstructionStatus {
    pub fn valid_transitions(self) -> &'static [InstructionStatus] {
        match self {
            InstructionStatus::Created => &[InstructionStatus::Queued],
            InstructionStatus::Queued => &[
                InstructionStatus::Submitted,
                InstructionStatus::Canceled,
            ],
            InstructionStatus::Submitted => &[
                InstructionStatus::Accepted,
                InstructionStatus::Failed,
                InstructionStatus::Canceled,
            ],
            InstructionStatus::Accepted => &[
                InstructionStatus::Settled,
                InstructionStatus::Failed,
                InstructionStatus::Returned,
                InstructionStatus::Reversed,
                InstructionStatus::Canceled,
            ],
            InstructionStatus::Settled => &[
                InstructionStatus::Returned,
                InstructionStatus::Reversed,
            ],
            InstructionStatus::Failed
            | InstructionStatus::Canceled
            | InstructionStatus::Returned
            | InstructionStatus::Reversed => &[],
        }
    }

    pub fn can_transition_to(self, next: InstructionStatus) -> bool {
        self.valid_transitions().contains(&next)
    }

    pub fn is_terminal(self) -> bool {
        self.valid_transitions().is_empty()
    }

    /// States from which a caller-initiated cancel is permitted.
    pub fn cancelable(self) -> bool {
        matches!(
            self,
            InstructionStatus::Queued
                | InstructionStatus::Submitted
                | InstructionStatus::Accepted
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementStatus {
    Pending,
    Submitted,
    Accepted,
    Settled,
    Failed,
    Returned,
    Rejected,
    Canceled,
    Reversed,
}

impl SettlementStatus {
    pub fn valid_transitions(self) -> &'static [SettlementStatus] {
        match self {
            SettlementStatus::Pending => &[
                SettlementStatus::Submitted,
                SettlementStatus::Canceled,
            ],
            SettlementStatus::Submitted => &[
                SettlementStatus::Accepted,
                SettlementStatus::Failed,
            ],
            SettlementStatus::Accepted => &[
                SettlementStatus::Settled,
                SettlementStatus::Returned,
                SettlementStatus::Rejected,
            ],
            SettlementStatus::Settled => &[
                SettlementStatus::Returned,
                SettlementStatus::Reversed,
            ],
            SettlementStatus::Failed
            | SettlementStatus::Returned
            | SettlementStatus::Rejected
            | SettlementStatus::Canceled
            | SettlementStatus::Reversed => &[],
        }
    }

    pub fn can_transition_to(self, next: SettlementStatus) -> bool {
        self.valid_transitions().contains(&next)
    }

    pub fn is_terminal(self) -> bool {
        self.valid_transitions().is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Active,
    Released,
    Consumed,
}

impl ReservationStatus {
    pub fn valid_transitions(self) -> &'static [ReservationStatus] {
        match self {
            ReservationStatus::Active => &[
                ReservationStatus::Released,
                ReservationStatus::Consumed,
            ],
            ReservationStatus::Released | ReservationStatus::Consumed => &[],
        }
    }

    pub fn can_transition_to(self, next: ReservationStatus) -> bool {
        self.valid_transitions().contains(&next)
    }

    pub fn is_terminal(self) -> bool {
        self.valid_transitions().is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FundingRequestStatus {
    Created,
    Submitted,
    Accepted,
    Settled,
    Failed,
    Returned,
    Canceled,
}

impl FundingRequestStatus {
    pub fn valid_transitions(self) -> &'static [FundingRequestStatus] {
        match self {
            FundingRequestStatus::Created => &[
                FundingRequestStatus::Submitted,
                FundingRequestStatus::Canceled,
            ],
            FundingRequestStatus::Submitted => &[
                FundingRequestStatus::Accepted,
                FundingRequestStatus::Failed,
                FundingRequestStatus::Canceled,
            ],
            FundingRequestStatus::Accepted => &[
                FundingRequestStatus::Settled,
                FundingRequestStatus::Failed,
                FundingRequestStatus::Returned,
            ],
            FundingRequestStatus::Settled => &[FundingRequestStatus::Returned],
            FundingRequestStatus::Failed
            | FundingRequestStatus::Returned
            | FundingRequestStatus::Canceled => &[],
        }
    }

    pub fn can_transition_to(self, next: FundingRequestStatus) -> bool {
        self.valid_transitions().contains(&next)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Submitted,
    Accepted,
    Failed,
}

impl AttemptStatus {
    pub fn valid_transitions(self) -> &'static [AttemptStatus] {
        match self {
            AttemptStatus::Submitted => &[AttemptStatus::Accepted, AttemptStatus::Failed],
            AttemptStatus::Accepted => &[AttemptStatus::Failed],
            AttemptStatus::Failed => &[],
        }
    }

    pub fn can_transition_to(self, next: AttemptStatus) -> bool {
        self.valid_transitions().contains(&next)
    }
}
