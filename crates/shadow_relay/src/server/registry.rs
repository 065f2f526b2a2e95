#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use shadow_domain::{ChannelId, DisplayName, Message};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

/// Relay-assigned connection identifier, rendered as `conn-<n>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "conn-{}", self.0)
	}
}

/// Items queued for a connection's events stream.
#[derive(Debug, Clone)]
pub enum OutboundItem {
	Message { channel: ChannelId, message: Arc<Message> },
	/// Messages for this connection were dropped because its queue was full.
	Lagged { channel: ChannelId, dropped: u64 },
}

/// Transport-side handle for one live connection.
///
/// The outbound queue is held weakly: once the connection task drops its
/// sender, every copy of this handle stops accepting deliveries.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
	id: ConnectionId,
	outbox: mpsc::WeakSender<OutboundItem>,
	pending_lag: Arc<AtomicU64>,
	binding: Arc<Mutex<Option<ChannelId>>>,
}

impl ConnectionHandle {
	pub fn new(id: ConnectionId, outbox: &mpsc::Sender<OutboundItem>) -> Self {
		Self {
			id,
			outbox: outbox.downgrade(),
			pending_lag: Arc::new(AtomicU64::new(0)),
			binding: Arc::new(Mutex::new(None)),
		}
	}

	pub fn id(&self) -> ConnectionId {
		self.id
	}

	/// Channel this connection is currently subscribed to.
	pub fn current_channel(&self) -> Option<ChannelId> {
		self.binding.lock().clone()
	}
}

/// One member of a channel's subscriber set.
#[derive(Debug, Clone)]
pub struct Subscriber {
	pub conn_id: ConnectionId,
	pub display_name: DisplayName,
	pub joined_at_ms: i64,
	outbox: mpsc::WeakSender<OutboundItem>,
	pending_lag: Arc<AtomicU64>,
}

impl Subscriber {
	/// Live sender for this subscriber, or `None` once its connection is gone.
	pub(crate) fn outbox(&self) -> Option<mpsc::Sender<OutboundItem>> {
		self.outbox.upgrade()
	}

	pub(crate) fn record_drop(&self) {
		self.pending_lag.fetch_add(1, Ordering::Relaxed);
	}

	pub(crate) fn take_pending_lag(&self) -> u64 {
		self.pending_lag.swap(0, Ordering::Relaxed)
	}

	pub(crate) fn restore_pending_lag(&self, dropped: u64) {
		self.pending_lag.fetch_add(dropped, Ordering::Relaxed);
	}
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
	#[error("connection is already subscribed to {current}")]
	AlreadySubscribed { current: ChannelId },
}

/// Per-channel live subscriber sets.
///
/// Each channel's set has its own lock; the map lock is only write-held when a
/// channel appears or its last member leaves. A connection's own binding lock is
/// taken before any channel lock, so the one-channel-per-connection rule never
/// needs a global lock.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
	channels: RwLock<HashMap<ChannelId, Arc<ChannelSlot>>>,
}

#[derive(Debug, Default)]
struct ChannelSlot {
	members: Mutex<Members>,
}

#[derive(Debug, Default)]
struct Members {
	subscribers: Vec<Subscriber>,
	/// Set once the slot has been unlinked from the map.
	retired: bool,
}

impl SubscriptionRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Add `conn` to `channel`.
	///
	/// Re-subscribing to the channel the connection is already in is a no-op.
	pub fn subscribe(
		&self,
		channel: &ChannelId,
		conn: &ConnectionHandle,
		display_name: DisplayName,
		joined_at_ms: i64,
	) -> Result<(), RegistryError> {
		let mut binding = conn.binding.lock();
		match binding.as_ref() {
			Some(current) if current == channel => return Ok(()),
			Some(current) => {
				return Err(RegistryError::AlreadySubscribed {
					current: current.clone(),
				});
			}
			None => {}
		}

		let subscriber = Subscriber {
			conn_id: conn.id,
			display_name,
			joined_at_ms,
			outbox: conn.outbox.clone(),
			pending_lag: Arc::clone(&conn.pending_lag),
		};

		loop {
			let slot = self.slot_or_create(channel);
			let mut members = slot.members.lock();
			if members.retired {
				continue;
			}
			members.subscribers.push(subscriber);
			debug!(conn_id = %conn.id, channel = %channel, members = members.subscribers.len(), "registry: subscribed");
			break;
		}

		*binding = Some(channel.clone());
		metrics::gauge!("shadow_relay_subscriptions").increment(1.0);
		Ok(())
	}

	/// Remove `conn` from `channel`. Returns whether it was a member.
	///
	/// Unknown channels and non-members are a no-op.
	pub fn unsubscribe(&self, channel: &ChannelId, conn: &ConnectionHandle) -> bool {
		let mut binding = conn.binding.lock();
		if binding.as_ref() != Some(channel) {
			return false;
		}

		let removed = self.remove_member(channel, conn.id);
		*binding = None;
		removed
	}

	/// Drop whatever subscription `conn` holds. Used on disconnect.
	pub fn remove_connection(&self, conn: &ConnectionHandle) -> Option<ChannelId> {
		let mut binding = conn.binding.lock();
		let channel = binding.take()?;
		self.remove_member(&channel, conn.id);
		Some(channel)
	}

	/// Consistent copy of `channel`'s members at this instant.
	pub fn active_subscribers(&self, channel: &ChannelId) -> Vec<Subscriber> {
		let Some(slot) = self.channels.read().get(channel).cloned() else {
			return Vec::new();
		};
		slot.members.lock().subscribers.clone()
	}

	pub fn subscriber_count(&self, channel: &ChannelId) -> usize {
		self.channels
			.read()
			.get(channel)
			.map(|slot| slot.members.lock().subscribers.len())
			.unwrap_or(0)
	}

	pub fn channel_count(&self) -> usize {
		self.channels.read().len()
	}

	fn slot_or_create(&self, channel: &ChannelId) -> Arc<ChannelSlot> {
		if let Some(slot) = self.channels.read().get(channel) {
			return Arc::clone(slot);
		}

		let mut channels = self.channels.write();
		let slot = Arc::clone(channels.entry(channel.clone()).or_default());
		metrics::gauge!("shadow_relay_channels").set(channels.len() as f64);
		slot
	}

	fn remove_member(&self, channel: &ChannelId, conn_id: ConnectionId) -> bool {
		let Some(slot) = self.channels.read().get(channel).cloned() else {
			return false;
		};

		let now_empty = {
			let mut members = slot.members.lock();
			let before = members.subscribers.len();
			members.subscribers.retain(|s| s.conn_id != conn_id);
			if members.subscribers.len() == before {
				return false;
			}
			members.subscribers.is_empty()
		};

		metrics::gauge!("shadow_relay_subscriptions").decrement(1.0);
		debug!(conn_id = %conn_id, channel = %channel, "registry: unsubscribed");

		if now_empty {
			self.retire_if_empty(channel, &slot);
		}
		true
	}

	fn retire_if_empty(&self, channel: &ChannelId, slot: &Arc<ChannelSlot>) {
		let mut channels = self.channels.write();
		let Some(current) = channels.get(channel) else {
			return;
		};
		if !Arc::ptr_eq(current, slot) {
			return;
		}

		let mut members = slot.members.lock();
		if members.subscribers.is_empty() {
			members.retired = true;
			channels.remove(channel);
			metrics::gauge!("shadow_relay_channels").set(channels.len() as f64);
		}
	}
}
