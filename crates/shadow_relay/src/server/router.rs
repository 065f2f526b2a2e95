#![forbid(unsafe_code)]

use std::sync::Arc;

use shadow_domain::{ChannelId, Message};
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;

use crate::server::registry::{OutboundItem, SubscriptionRegistry};
use crate::util::time::SharedClock;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RouteError {
	#[error("channel id is empty")]
	EmptyChannel,

	#[error("message expired before fan-out")]
	Expired,
}

/// Outcome of one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
	/// Subscribers in the snapshot.
	pub attempted: usize,
	pub delivered: usize,
	/// Queue full; counted toward the subscriber's next `channel-lagged` notice.
	pub dropped: usize,
	/// Connection already gone.
	pub unreachable: usize,
}

impl DeliveryReport {
	pub fn failed(&self) -> usize {
		self.dropped + self.unreachable
	}
}

/// Fans a published message out to a channel's current subscribers.
///
/// Reads registry snapshots only. Each subscriber is attempted independently
/// and a failure for one never affects the others.
#[derive(Debug, Clone)]
pub struct BroadcastRouter {
	registry: Arc<SubscriptionRegistry>,
	clock: SharedClock,
}

impl BroadcastRouter {
	pub fn new(registry: Arc<SubscriptionRegistry>, clock: SharedClock) -> Self {
		Self { registry, clock }
	}

	pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
		&self.registry
	}

	pub fn publish(&self, channel_id: &str, message: Message) -> Result<DeliveryReport, RouteError> {
		let channel = ChannelId::new(channel_id).map_err(|_| RouteError::EmptyChannel)?;
		self.publish_to(&channel, message)
	}

	pub fn publish_to(&self, channel: &ChannelId, message: Message) -> Result<DeliveryReport, RouteError> {
		if !message.is_live(self.clock.now_ms()) {
			metrics::counter!("shadow_relay_publish_expired_total").increment(1);
			return Err(RouteError::Expired);
		}

		let message = Arc::new(message);
		let subscribers = self.registry.active_subscribers(channel);
		let mut report = DeliveryReport {
			attempted: subscribers.len(),
			..DeliveryReport::default()
		};

		for sub in &subscribers {
			let Some(outbox) = sub.outbox() else {
				report.unreachable += 1;
				debug!(conn_id = %sub.conn_id, channel = %channel, "fan-out: subscriber connection gone");
				continue;
			};

			let item = OutboundItem::Message {
				channel: channel.clone(),
				message: Arc::clone(&message),
			};

			match outbox.try_send(item) {
				Ok(()) => {
					report.delivered += 1;

					let pending = sub.take_pending_lag();
					if pending > 0
						&& outbox
							.try_send(OutboundItem::Lagged {
								channel: channel.clone(),
								dropped: pending,
							})
							.is_err()
					{
						sub.restore_pending_lag(pending);
					}
				}
				Err(TrySendError::Full(_)) => {
					report.dropped += 1;
					sub.record_drop();
					debug!(conn_id = %sub.conn_id, channel = %channel, "fan-out: subscriber queue full");
				}
				Err(TrySendError::Closed(_)) => {
					report.unreachable += 1;
					debug!(conn_id = %sub.conn_id, channel = %channel, "fan-out: subscriber queue closed");
				}
			}
		}

		metrics::counter!("shadow_relay_fanout_attempted_total").increment(report.attempted as u64);
		metrics::counter!("shadow_relay_fanout_delivered_total").increment(report.delivered as u64);
		if report.failed() > 0 {
			metrics::counter!("shadow_relay_fanout_failed_total").increment(report.failed() as u64);
		}

		Ok(report)
	}
}
