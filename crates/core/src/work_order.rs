use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::ids::{MutationId, UserId, WorkOrderId};
use crate::mutation::MutationOp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkOrderStatus {
    Assigned,
    InProgress,
    Pending,
    NeedsReturn,
    ReturnTrip,
    Completed,
}

impl WorkOrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Assigned => "assigned",
            Self::InProgress => "in_progress",
            Self::Pending => "pending",
            Self::NeedsReturn => "needs_return",
            Self::ReturnTrip => "return_trip",
            Self::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "assigned" => Ok(Self::Assigned),
            "in_progress" => Ok(Self::InProgress),
            "pending" => Ok(Self::Pending),
            "needs_return" => Ok(Self::NeedsReturn),
            "return_trip" => Ok(Self::ReturnTrip),
            "completed" => Ok(Self::Completed),
            _ => Err(CoreError::InvalidData(format!("unknown work order status: {s}"))),
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

/// The technician the engine is running for. Names are stamped on notes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: UserId,
    pub first_name: String,
    pub last_name: String,
}

impl UserProfile {
    pub fn new(user_id: impl Into<UserId>, first_name: &str, last_name: &str) -> Self {
        Self {
            user_id: user_id.into(),
            first_name: first_name.to_string(),
            last_name: last_name.to_string(),
        }
    }

    pub fn display_name(&self) -> String {
        match (self.first_name.is_empty(), self.last_name.is_empty()) {
            (false, false) => format!("{} {}", self.first_name, self.last_name),
            (false, true) => self.first_name.clone(),
            (true, false) => self.last_name.clone(),
            (true, true) => self.user_id.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpsLocation {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoteKind {
    CheckIn,
    CheckOut,
    Comment,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkOrderNote {
    /// Set when the note was produced by a queued mutation.
    pub mutation_id: Option<MutationId>,
    pub author: String,
    pub kind: NoteKind,
    pub text: String,
    pub at: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyHoursEntry {
    pub user_id: UserId,
    /// Calendar day the hours were worked, `YYYY-MM-DD`.
    pub work_date: String,
    pub hours_regular: f64,
    pub hours_overtime: f64,
    pub miles: f64,
    pub notes: Option<String>,
}

impl DailyHoursEntry {
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.work_date.trim().is_empty() {
            return Err(CoreError::InvalidOperation("daily hours need a work date".into()));
        }
        for (label, value) in [
            ("hours_regular", self.hours_regular),
            ("hours_overtime", self.hours_overtime),
            ("miles", self.miles),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(CoreError::InvalidOperation(format!(
                    "{label} must be a non-negative number, got {value}"
                )));
            }
        }
        Ok(())
    }

    fn same_slot(&self, other: &DailyHoursEntry) -> bool {
        self.user_id == other.user_id && self.work_date == other.work_date
    }
}

/// Cached view of one work order.
///
/// The rendered snapshot is the last confirmed server state with every still
/// pending mutation for the same work order applied on top, in queue order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkOrderSnapshot {
    pub id: WorkOrderId,
    pub status: WorkOrderStatus,
    #[serde(default)]
    pub wo_number: Option<String>,
    #[serde(default)]
    pub building: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub lead_tech_id: Option<UserId>,
    #[serde(default)]
    pub time_in: Option<u64>,
    #[serde(default)]
    pub time_out: Option<u64>,
    #[serde(default)]
    pub date_completed: Option<u64>,
    #[serde(default)]
    pub notes: Vec<WorkOrderNote>,
    #[serde(default)]
    pub daily_hours: Vec<DailyHoursEntry>,
    #[serde(default)]
    pub locally_modified: bool,
    #[serde(default)]
    pub last_synced_at: Option<u64>,
}

impl WorkOrderSnapshot {
    pub fn new(id: impl Into<WorkOrderId>, status: WorkOrderStatus) -> Self {
        Self {
            id: id.into(),
            status,
            wo_number: None,
            building: None,
            description: None,
            priority: None,
            lead_tech_id: None,
            time_in: None,
            time_out: None,
            date_completed: None,
            notes: Vec::new(),
            daily_hours: Vec::new(),
            locally_modified: false,
            last_synced_at: None,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status.is_completed()
    }

    pub fn total_hours(&self) -> f64 {
        self.daily_hours
            .iter()
            .map(|e| e.hours_regular + e.hours_overtime)
            .sum()
    }

    pub fn total_miles(&self) -> f64 {
        self.daily_hours.iter().map(|e| e.miles).sum()
    }

    pub fn comments(&self) -> impl Iterator<Item = &WorkOrderNote> {
        self.notes.iter().filter(|n| n.kind == NoteKind::Comment)
    }

    /// Merge one mutation into the snapshot.
    ///
    /// Applying the same patch twice leaves the snapshot as if it had been
    /// applied once: notes are keyed by mutation id, hours by (user, day),
    /// and `time_in`/`time_out` keep the first value written.
    pub fn apply(&mut self, patch: &WorkOrderPatch) {
        match &patch.op {
            MutationOp::CheckIn { location } => {
                self.status = WorkOrderStatus::InProgress;
                self.time_in.get_or_insert(patch.at);
                self.push_note(patch, NoteKind::CheckIn, presence_text("CHECKED IN", location));
            }
            MutationOp::CheckOut { location } => {
                self.time_out.get_or_insert(patch.at);
                self.push_note(patch, NoteKind::CheckOut, presence_text("CHECKED OUT", location));
            }
            MutationOp::AddComment { text } => {
                self.push_note(patch, NoteKind::Comment, text.clone());
            }
            MutationOp::UpdateStatus { status } => {
                self.status = *status;
            }
            MutationOp::AddDailyHours { entry } => {
                match self.daily_hours.iter_mut().find(|e| e.same_slot(entry)) {
                    Some(existing) => *existing = entry.clone(),
                    None => self.daily_hours.push(entry.clone()),
                }
            }
            MutationOp::Complete => {
                self.status = WorkOrderStatus::Completed;
                self.date_completed = Some(patch.at);
                self.push_note(patch, NoteKind::Completed, "WORK ORDER COMPLETED".to_string());
            }
        }
    }

    fn push_note(&mut self, patch: &WorkOrderPatch, kind: NoteKind, text: String) {
        if self
            .notes
            .iter()
            .any(|n| n.mutation_id == Some(patch.mutation_id))
        {
            return;
        }
        self.notes.push(WorkOrderNote {
            mutation_id: Some(patch.mutation_id),
            author: patch.author.clone(),
            kind,
            text,
            at: patch.at,
        });
    }

    pub fn to_msgpack(&self) -> Result<Vec<u8>, CoreError> {
        rmp_serde::to_vec_named(self).map_err(|e| CoreError::Serialization(e.to_string()))
    }

    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, CoreError> {
        rmp_serde::from_slice(bytes).map_err(|e| CoreError::Serialization(e.to_string()))
    }
}

fn presence_text(label: &str, location: &Option<GpsLocation>) -> String {
    match location {
        Some(gps) => format!("{label} (GPS: {:.6}, {:.6})", gps.latitude, gps.longitude),
        None => label.to_string(),
    }
}

/// A mutation as it is merged into a snapshot: the operation plus the
/// metadata recorded when it was queued.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkOrderPatch {
    pub mutation_id: MutationId,
    pub author: String,
    pub at: u64,
    pub op: MutationOp,
}
