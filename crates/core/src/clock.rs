use std::time::{SystemTime, UNIX_EPOCH};

use crate::CoreError;

/// Returns the current wall-clock time as milliseconds since Unix epoch.
pub fn physical_now() -> Result<u64, CoreError> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .map_err(|_| CoreError::InvalidData("system clock before epoch".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_is_after_2020() {
        let now = physical_now().unwrap();
        assert!(now > 1_577_836_800_000, "clock reads {now}");
    }
}
