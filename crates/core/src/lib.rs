pub mod clock;
pub mod error;
pub mod ids;
pub mod mutation;
pub mod work_order;

pub use error::CoreError;
pub use ids::*;
pub use mutation::{MutationOp, MutationState, PendingMutation};
pub use work_order::{
    DailyHoursEntry, GpsLocation, NoteKind, UserProfile, WorkOrderNote, WorkOrderPatch,
    WorkOrderSnapshot, WorkOrderStatus,
};
