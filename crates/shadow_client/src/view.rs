#![forbid(unsafe_code)]

//! Local, self-evicting list of chat messages for one channel.

use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use shadow_domain::{ChannelId, Clock, Message, MessageId};
use shadow_protocol::message_from_chat;
use shadow_protocol::pb::{self, event::Payload};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5);
pub const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(5);
pub const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// What [`MessageView::apply_event`] did with an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
	Inserted(MessageId),
	Duplicate,
	Expired,
	Lagged { dropped: u64 },
	Ignored,
}

/// Messages of one channel in arrival order, each shown only while live.
#[derive(Debug)]
pub struct MessageView {
	channel: ChannelId,
	messages: Vec<Message>,
	seen: HashSet<MessageId>,
	lagged: u64,
}

impl MessageView {
	pub fn new(channel: ChannelId) -> Self {
		Self {
			channel,
			messages: Vec::new(),
			seen: HashSet::new(),
			lagged: 0,
		}
	}

	pub fn channel(&self) -> &ChannelId {
		&self.channel
	}

	/// Feed one events-stream frame into the view. Frames for other channels are ignored.
	pub fn apply_event(&mut self, event: pb::Event, now_ms: i64) -> Applied {
		let ours = ChannelId::from_transport_name(&event.channel).is_ok_and(|c| c == self.channel);
		if !ours {
			trace!(channel = %event.channel, "event for another channel ignored");
			return Applied::Ignored;
		}

		match event.payload {
			Some(Payload::NewMessage(chat)) => match message_from_chat(chat) {
				Ok(message) => self.insert(message, now_ms),
				Err(e) => {
					warn!(channel = %event.channel, error = %e, "dropping malformed message event");
					Applied::Ignored
				}
			},
			Some(Payload::ChannelLagged(lag)) => {
				self.lagged += lag.dropped;
				debug!(channel = %event.channel, dropped = lag.dropped, "relay dropped messages for this view");
				Applied::Lagged { dropped: lag.dropped }
			}
			None => Applied::Ignored,
		}
	}

	/// Append `message` unless it is already expired or already present.
	pub fn insert(&mut self, message: Message, now_ms: i64) -> Applied {
		if !message.is_live(now_ms) || !message.has_valid_expiry() {
			return Applied::Expired;
		}
		if !self.seen.insert(message.id.clone()) {
			return Applied::Duplicate;
		}
		let id = message.id.clone();
		self.messages.push(message);
		Applied::Inserted(id)
	}

	/// Drop every message with `now >= expires_at`. Returns how many went.
	pub fn sweep(&mut self, now_ms: i64) -> usize {
		let before = self.messages.len();
		let seen = &mut self.seen;
		self.messages.retain(|m| {
			let keep = m.is_live(now_ms);
			if !keep {
				seen.remove(&m.id);
			}
			keep
		});
		before - self.messages.len()
	}

	/// Live messages, even if a sweep has not run yet.
	pub fn visible(&self, now_ms: i64) -> impl Iterator<Item = &Message> {
		self.messages.iter().filter(move |m| m.is_live(now_ms))
	}

	pub fn len(&self) -> usize {
		self.messages.len()
	}

	pub fn is_empty(&self) -> bool {
		self.messages.is_empty()
	}

	/// Total messages the relay reported as dropped for this view.
	pub fn lagged(&self) -> u64 {
		self.lagged
	}
}

/// Time left before `message` expires, as `"42s"` or `"4m 5s"`.
pub fn remaining(message: &Message, now_ms: i64) -> String {
	let secs = message.remaining_ms(now_ms) / 1000;
	if secs < 60 {
		format!("{secs}s")
	} else {
		format!("{}m {}s", secs / 60, secs % 60)
	}
}

/// Sweep `view` every `interval` (clamped to 5..=10 s) until the view is dropped.
pub fn spawn_sweeper(view: &Arc<Mutex<MessageView>>, clock: Arc<dyn Clock>, interval: Duration) -> JoinHandle<()> {
	let interval = interval.clamp(MIN_SWEEP_INTERVAL, MAX_SWEEP_INTERVAL);
	let view: Weak<Mutex<MessageView>> = Arc::downgrade(view);

	tokio::spawn(async move {
		let mut ticker = tokio::time::interval(interval);
		ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

		loop {
			ticker.tick().await;
			let Some(view) = view.upgrade() else {
				debug!("message view dropped; sweeper exiting");
				return;
			};
			let removed = view.lock().sweep(clock.now_ms());
			if removed > 0 {
				trace!(removed, "expired messages swept");
			}
		}
	})
}
