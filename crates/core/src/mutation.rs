use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::ids::{MutationId, WorkOrderId};
use crate::work_order::{DailyHoursEntry, GpsLocation, WorkOrderPatch, WorkOrderStatus};

/// Every action a technician can take against a work order while offline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MutationOp {
    CheckIn { location: Option<GpsLocation> },
    CheckOut { location: Option<GpsLocation> },
    AddComment { text: String },
    UpdateStatus { status: WorkOrderStatus },
    AddDailyHours { entry: DailyHoursEntry },
    Complete,
}

impl MutationOp {
    /// String name of the operation type for storage/indexing.
    pub fn op_type_name(&self) -> &'static str {
        match self {
            Self::CheckIn { .. } => "check_in",
            Self::CheckOut { .. } => "check_out",
            Self::AddComment { .. } => "add_comment",
            Self::UpdateStatus { .. } => "update_status",
            Self::AddDailyHours { .. } => "add_daily_hours",
            Self::Complete => "complete_work_order",
        }
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        match self {
            Self::AddComment { text } if text.trim().is_empty() => {
                Err(CoreError::InvalidOperation("comment text is empty".into()))
            }
            Self::AddDailyHours { entry } => entry.validate(),
            Self::CheckIn { location } | Self::CheckOut { location } => match location {
                Some(gps)
                    if !(-90.0..=90.0).contains(&gps.latitude)
                        || !(-180.0..=180.0).contains(&gps.longitude) =>
                {
                    Err(CoreError::InvalidOperation(format!(
                        "GPS fix out of range: {}, {}",
                        gps.latitude, gps.longitude
                    )))
                }
                _ => Ok(()),
            },
            _ => Ok(()),
        }
    }

    pub fn to_msgpack(&self) -> Result<Vec<u8>, CoreError> {
        rmp_serde::to_vec_named(self).map_err(|e| CoreError::Serialization(e.to_string()))
    }

    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, CoreError> {
        rmp_serde::from_slice(bytes).map_err(|e| CoreError::Serialization(e.to_string()))
    }
}

/// blake3 digest stored next to each queued payload.
pub fn payload_checksum(payload: &[u8]) -> [u8; 32] {
    *blake3::hash(payload).as_bytes()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MutationState {
    Pending,
    /// Failed too many times in a row; waits for the user instead of retrying.
    Stuck,
}

impl MutationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Stuck => "stuck",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "pending" => Ok(Self::Pending),
            "stuck" => Ok(Self::Stuck),
            _ => Err(CoreError::InvalidData(format!("unknown mutation state: {s}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingMutation {
    pub mutation_id: MutationId,
    /// Position in the durable queue. Strictly increasing, never reused.
    pub seq: i64,
    pub entity_id: WorkOrderId,
    pub op: MutationOp,
    pub author: String,
    pub created_at: u64,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub state: MutationState,
}

impl PendingMutation {
    pub fn patch(&self) -> WorkOrderPatch {
        WorkOrderPatch {
            mutation_id: self.mutation_id,
            author: self.author.clone(),
            at: self.created_at,
            op: self.op.clone(),
        }
    }

    pub fn is_stuck(&self) -> bool {
        matches!(self.state, MutationState::Stuck)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::UserId;

    #[test]
    fn hours_payload_survives_storage_encoding() {
        let op = MutationOp::AddDailyHours {
            entry: DailyHoursEntry {
                user_id: UserId::from("tech-1"),
                work_date: "2026-10-17".into(),
                hours_regular: 7.5,
                hours_overtime: 1.0,
                miles: 30.0,
                notes: Some("parts run".into()),
            },
        };
        let bytes = op.to_msgpack().unwrap();
        assert_eq!(MutationOp::from_msgpack(&bytes).unwrap(), op);
    }

    #[test]
    fn garbage_payload_is_serialization_error() {
        match MutationOp::from_msgpack(&[0xc1, 0x00, 0xff]) {
            Err(CoreError::Serialization(_)) => {}
            other => panic!("expected Serialization, got {other:?}"),
        }
    }

    #[test]
    fn validation() {
        assert!(MutationOp::AddComment { text: "  ".into() }.validate().is_err());
        assert!(
            MutationOp::CheckIn {
                location: Some(GpsLocation {
                    latitude: 91.0,
                    longitude: 0.0
                })
            }
            .validate()
            .is_err()
        );
        assert!(MutationOp::Complete.validate().is_ok());
    }

    #[test]
    fn checksum_detects_changes() {
        let a = MutationOp::AddComment { text: "a".into() }.to_msgpack().unwrap();
        let b = MutationOp::AddComment { text: "b".into() }.to_msgpack().unwrap();
        assert_ne!(payload_checksum(&a), payload_checksum(&b));
        assert_eq!(payload_checksum(&a), payload_checksum(&a));
    }
}
