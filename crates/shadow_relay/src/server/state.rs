#![forbid(unsafe_code)]

use std::sync::Arc;

use crate::server::gate::AuthorizationGate;
use crate::server::registry::SubscriptionRegistry;
use crate::server::router::BroadcastRouter;
use crate::util::time::SharedClock;

/// Process-wide relay state shared by every connection handler.
#[derive(Debug)]
pub struct RelayContext {
	pub gate: AuthorizationGate,
	pub router: BroadcastRouter,
	pub clock: SharedClock,
}

impl RelayContext {
	pub fn new(gate: AuthorizationGate, clock: SharedClock) -> Self {
		let registry = Arc::new(SubscriptionRegistry::new());
		Self {
			gate,
			router: BroadcastRouter::new(registry, Arc::clone(&clock)),
			clock,
		}
	}

	pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
		self.router.registry()
	}
}
