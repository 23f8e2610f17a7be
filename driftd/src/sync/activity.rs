use std::collections::HashMap;
use std::sync::Mutex;

use drift_core::DeviceId;

/// One peer that can serve a block, and whether it would serve it from
/// its in-progress temporary file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Availability {
    pub device: DeviceId,
    pub from_temporary: bool,
}

/// Running count of in-flight requests per peer, used to spread block
/// requests across the least busy devices.
#[derive(Debug, Default)]
pub struct DeviceActivity {
    in_flight: Mutex<HashMap<DeviceId, usize>>,
}

impl DeviceActivity {
    pub fn new() -> Self {
        Self::default()
    }

    /// The candidate with the lowest in-flight count. Ties go to the
    /// earliest candidate in the slice.
    pub fn least_busy(&self, candidates: &[Availability]) -> Option<Availability> {
        let map = self.in_flight.lock().expect("activity mutex poisoned");
        let mut best: Option<&Availability> = None;
        let mut low = usize::MAX;
        for candidate in candidates {
            let usage = map.get(&candidate.device).copied().unwrap_or(0);
            if usage < low {
                low = usage;
                best = Some(candidate);
            }
        }
        best.cloned()
    }

    pub fn using(&self, availability: &Availability) {
        let mut map = self.in_flight.lock().expect("activity mutex poisoned");
        *map.entry(availability.device.clone()).or_insert(0) += 1;
    }

    pub fn done(&self, availability: &Availability) {
        let mut map = self.in_flight.lock().expect("activity mutex poisoned");
        if let Some(count) = map.get_mut(&availability.device) {
            *count = count.saturating_sub(1);
        }
    }
}
