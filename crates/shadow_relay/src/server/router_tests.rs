#![forbid(unsafe_code)]

use std::sync::Arc;

use shadow_domain::{ChannelId, Clock, DisplayName, ManualClock, Message};
use tokio::sync::mpsc;

use crate::server::registry::{ConnectionHandle, ConnectionId, OutboundItem, SubscriptionRegistry};
use crate::server::router::{BroadcastRouter, DeliveryReport, RouteError};
use crate::util::time::SharedClock;

struct Harness {
	clock: Arc<ManualClock>,
	router: BroadcastRouter,
}

impl Harness {
	fn new(now_ms: i64) -> Self {
		let clock = Arc::new(ManualClock::new(now_ms));
		let shared: SharedClock = clock.clone();
		Self {
			clock,
			router: BroadcastRouter::new(Arc::new(SubscriptionRegistry::new()), shared),
		}
	}

	fn join(
		&self,
		channel: &ChannelId,
		id: u64,
		queue: usize,
	) -> (ConnectionHandle, mpsc::Sender<OutboundItem>, mpsc::Receiver<OutboundItem>) {
		let (tx, rx) = mpsc::channel(queue);
		let handle = ConnectionHandle::new(ConnectionId(id), &tx);
		self.router
			.registry()
			.subscribe(channel, &handle, raven(), self.clock.now_ms())
			.expect("subscribe");
		(handle, tx, rx)
	}
}

fn raven() -> DisplayName {
	DisplayName::new("Anonymous_Raven").expect("valid name")
}

fn alpha() -> ChannelId {
	ChannelId::new("alpha-7").expect("valid channel")
}

fn text_of(item: OutboundItem) -> String {
	match item {
		OutboundItem::Message { message, .. } => message.text.clone(),
		other => panic!("expected message, got {other:?}"),
	}
}

#[test]
fn zero_subscribers_is_not_an_error() {
	let h = Harness::new(1000);
	let report = h
		.router
		.publish("alpha-7", Message::stamp_at(&raven(), "hi", 1000))
		.expect("publish");
	assert_eq!(report, DeliveryReport::default());
}

#[test]
fn every_subscriber_including_the_sender_receives_the_message() {
	let h = Harness::new(1000);
	let ch = alpha();
	let (_sender, _tx_s, mut rx_sender) = h.join(&ch, 1, 8);
	let (_other, _tx_o, mut rx_other) = h.join(&ch, 2, 8);

	let report = h
		.router
		.publish_to(&ch, Message::stamp_at(&raven(), "hi", 1000))
		.expect("publish");

	assert_eq!(report.attempted, 2);
	assert_eq!(report.delivered, 2);
	assert_eq!(text_of(rx_sender.try_recv().expect("sender copy")), "hi");

	match rx_other.try_recv().expect("other copy") {
		OutboundItem::Message { channel, message } => {
			assert_eq!(channel, ch);
			assert_eq!(message.timestamp, 1000);
			assert_eq!(message.expires_at, 301_000);
		}
		other => panic!("unexpected item: {other:?}"),
	}
}

#[test]
fn channels_are_isolated() {
	let h = Harness::new(0);
	let beta = ChannelId::new("beta").expect("channel");
	let (_a, _tx_a, mut rx_alpha) = h.join(&alpha(), 1, 8);
	let (_b, _tx_b, mut rx_beta) = h.join(&beta, 2, 8);

	h.router
		.publish_to(&beta, Message::stamp_at(&raven(), "only beta", 0))
		.expect("publish");

	assert!(rx_alpha.try_recv().is_err());
	assert_eq!(text_of(rx_beta.try_recv().expect("beta")), "only beta");
}

#[test]
fn one_dead_subscriber_does_not_affect_the_others() {
	let h = Harness::new(0);
	let ch = alpha();
	let (_gone_rx_side, _tx_x, rx_x) = h.join(&ch, 1, 8);
	let (_gone_conn, tx_z, _rx_z) = h.join(&ch, 2, 8);
	let (_y, _tx_y, mut rx_y) = h.join(&ch, 3, 8);

	drop(rx_x);
	drop(tx_z);

	let report = h
		.router
		.publish_to(&ch, Message::stamp_at(&raven(), "still here", 0))
		.expect("publish");

	assert_eq!(report.attempted, 3);
	assert_eq!(report.delivered, 1);
	assert_eq!(report.unreachable, 2);
	assert_eq!(text_of(rx_y.try_recv().expect("y receives")), "still here");
}

#[test]
fn late_joiner_gets_no_replay() {
	let h = Harness::new(0);
	let ch = alpha();
	let (_a, _tx_a, _rx_a) = h.join(&ch, 1, 8);

	h.router
		.publish_to(&ch, Message::stamp_at(&raven(), "before", 0))
		.expect("publish");

	let (_late, _tx_l, mut rx_late) = h.join(&ch, 2, 8);
	assert!(rx_late.try_recv().is_err());

	h.router
		.publish_to(&ch, Message::stamp_at(&raven(), "after", 0))
		.expect("publish");
	assert_eq!(text_of(rx_late.try_recv().expect("after")), "after");
	assert!(rx_late.try_recv().is_err());
}

#[test]
fn messages_from_one_sender_arrive_in_publish_order() {
	let h = Harness::new(0);
	let ch = alpha();
	let (_a, _tx_a, mut rx_a) = h.join(&ch, 1, 16);
	let (_b, _tx_b, mut rx_b) = h.join(&ch, 2, 16);

	for i in 0..10 {
		h.router
			.publish_to(&ch, Message::stamp_at(&raven(), format!("m{i}"), i))
			.expect("publish");
	}

	for rx in [&mut rx_a, &mut rx_b] {
		let got: Vec<String> = (0..10).map(|_| text_of(rx.try_recv().expect("item"))).collect();
		let want: Vec<String> = (0..10).map(|i| format!("m{i}")).collect();
		assert_eq!(got, want);
	}
}

#[test]
fn full_queue_drops_and_reports_lag_on_next_delivery() {
	let h = Harness::new(0);
	let ch = alpha();
	let (_slow, _tx, mut rx) = h.join(&ch, 1, 2);

	for text in ["m1", "m2", "m3"] {
		h.router
			.publish_to(&ch, Message::stamp_at(&raven(), text, 0))
			.expect("publish");
	}

	assert_eq!(text_of(rx.try_recv().expect("m1")), "m1");
	assert_eq!(text_of(rx.try_recv().expect("m2")), "m2");
	assert!(rx.try_recv().is_err());

	let report = h
		.router
		.publish_to(&ch, Message::stamp_at(&raven(), "m4", 0))
		.expect("publish");
	assert_eq!(report.delivered, 1);

	assert_eq!(text_of(rx.try_recv().expect("m4")), "m4");
	match rx.try_recv().expect("lag notice") {
		OutboundItem::Lagged { channel, dropped } => {
			assert_eq!(channel, ch);
			assert_eq!(dropped, 1);
		}
		other => panic!("expected lag notice, got {other:?}"),
	}
}

#[test]
fn expired_message_is_rejected_before_fan_out() {
	let h = Harness::new(0);
	let ch = alpha();
	let (_a, _tx, mut rx) = h.join(&ch, 1, 8);

	h.clock.set(301_000);
	let err = h
		.router
		.publish_to(&ch, Message::stamp_at(&raven(), "late", 1000))
		.unwrap_err();
	assert_eq!(err, RouteError::Expired);
	assert!(rx.try_recv().is_err());

	h.clock.set(300_999);
	h.router
		.publish_to(&ch, Message::stamp_at(&raven(), "just in time", 1000))
		.expect("still live");
	assert_eq!(text_of(rx.try_recv().expect("live")), "just in time");
}

#[test]
fn blank_channel_id_is_rejected() {
	let h = Harness::new(0);
	let err = h.router.publish("  ", Message::stamp_at(&raven(), "x", 0)).unwrap_err();
	assert_eq!(err, RouteError::EmptyChannel);
}
