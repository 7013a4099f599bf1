pub mod backend;
pub mod device;
pub mod network;

pub use backend::{FakeBackend, PushOutcome, PushRecord};
pub use device::TestDevice;
pub use network::NetworkSwitch;

use fieldsync_core::{WorkOrderSnapshot, WorkOrderStatus};

/// Install a test subscriber honoring `RUST_LOG`. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_test_writer()
        .try_init();
}

/// `count` assigned work orders named `wo-1`, `wo-2`, ...
pub fn assigned_work_orders(count: usize) -> Vec<WorkOrderSnapshot> {
    (1..=count)
        .map(|n| {
            let mut wo = WorkOrderSnapshot::new(format!("wo-{n}"), WorkOrderStatus::Assigned);
            wo.wo_number = Some(format!("WO-{:05}", 1000 + n));
            wo.building = Some("Harbor Point Tower".to_string());
            wo
        })
        .collect()
}
