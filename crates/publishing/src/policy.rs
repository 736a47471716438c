//! Queue policy knobs.

/// Error codes recorded on jobs by the queue itself (as opposed to codes
/// reported by devices).
pub mod error_codes {
    /// The claiming device never called start within the claim timeout.
    pub const CLAIM_TIMEOUT: &str = "claim_timeout";
    /// The executing device never reported an outcome within the running
    /// timeout.
    pub const RUNNING_TIMEOUT: &str = "running_timeout";
}

/// Claim and retry policy for the queue.
#[derive(Debug, Clone, Copy)]
pub struct QueuePolicy {
    /// Global per-call cap on claimed jobs, regardless of the requested
    /// limit.
    pub claim_batch_cap: u32,
    /// Maximum CLAIMED+RUNNING jobs one device may hold at a time.
    pub device_active_cap: u32,
    /// Default attempt budget for new jobs.
    pub default_max_attempts: u32,
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self {
            claim_batch_cap: 10,
            device_active_cap: 5,
            default_max_attempts: 3,
        }
    }
}

impl QueuePolicy {
    pub fn with_claim_batch_cap(mut self, cap: u32) -> Self {
        self.claim_batch_cap = cap;
        self
    }

    pub fn with_device_active_cap(mut self, cap: u32) -> Self {
        self.device_active_cap = cap;
        self
    }

    pub fn with_default_max_attempts(mut self, max_attempts: u32) -> Self {
        self.default_max_attempts = max_attempts;
        self
    }

    /// Effective claim limit for one call: the requested limit clamped by
    /// the per-call cap and by the device's remaining active slots.
    pub fn effective_claim_limit(&self, requested: u32, device_active: u32) -> u32 {
        let remaining_slots = self.device_active_cap.saturating_sub(device_active);
        requested.min(self.claim_batch_cap).min(remaining_slots)
    }
}
