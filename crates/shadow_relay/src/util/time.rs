#![forbid(unsafe_code)]

use std::sync::Arc;

use shadow_domain::{Clock, SystemClock};

/// Shared clock handle used across the relay.
pub type SharedClock = Arc<dyn Clock>;

pub fn system_clock() -> SharedClock {
	Arc::new(SystemClock)
}
