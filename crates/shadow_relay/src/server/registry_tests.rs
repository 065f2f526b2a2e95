#![forbid(unsafe_code)]

use std::sync::Arc;
use std::thread;

use shadow_domain::{ChannelId, DisplayName};
use tokio::sync::mpsc;

use crate::server::registry::{ConnectionHandle, ConnectionId, OutboundItem, RegistryError, SubscriptionRegistry};

fn channel(id: &str) -> ChannelId {
	ChannelId::new(id).expect("valid ChannelId")
}

fn name(n: &str) -> DisplayName {
	DisplayName::new(n).expect("valid DisplayName")
}

fn conn(id: u64) -> (ConnectionHandle, mpsc::Sender<OutboundItem>, mpsc::Receiver<OutboundItem>) {
	let (tx, rx) = mpsc::channel(8);
	(ConnectionHandle::new(ConnectionId(id), &tx), tx, rx)
}

#[test]
fn subscribe_then_snapshot_lists_members() {
	let reg = SubscriptionRegistry::new();
	let alpha = channel("alpha-7");
	let (a, _tx_a, _rx_a) = conn(1);
	let (b, _tx_b, _rx_b) = conn(2);

	reg.subscribe(&alpha, &a, name("Raven"), 10).expect("a subscribes");
	reg.subscribe(&alpha, &b, name("Heron"), 20).expect("b subscribes");

	let subs = reg.active_subscribers(&alpha);
	let ids: Vec<_> = subs.iter().map(|s| s.conn_id).collect();
	assert_eq!(ids, vec![ConnectionId(1), ConnectionId(2)]);
	assert_eq!(subs[1].display_name.as_str(), "Heron");
	assert_eq!(subs[1].joined_at_ms, 20);
	assert_eq!(a.current_channel(), Some(alpha.clone()));
	assert_eq!(reg.channel_count(), 1);
}

#[test]
fn resubscribing_same_channel_is_a_noop() {
	let reg = SubscriptionRegistry::new();
	let alpha = channel("alpha-7");
	let (a, _tx, _rx) = conn(1);

	reg.subscribe(&alpha, &a, name("Raven"), 10).expect("first");
	reg.subscribe(&alpha, &a, name("Raven"), 11).expect("second");

	assert_eq!(reg.subscriber_count(&alpha), 1);
}

#[test]
fn second_channel_requires_unsubscribe_first() {
	let reg = SubscriptionRegistry::new();
	let alpha = channel("alpha-7");
	let beta = channel("beta");
	let (a, _tx, _rx) = conn(1);

	reg.subscribe(&alpha, &a, name("Raven"), 0).expect("alpha");
	let err = reg.subscribe(&beta, &a, name("Raven"), 0).unwrap_err();
	assert_eq!(err, RegistryError::AlreadySubscribed { current: alpha.clone() });
	assert_eq!(reg.subscriber_count(&beta), 0);

	assert!(reg.unsubscribe(&alpha, &a));
	reg.subscribe(&beta, &a, name("Raven"), 0).expect("beta after leaving alpha");
	assert_eq!(a.current_channel(), Some(beta));
}

#[test]
fn unsubscribe_is_idempotent_and_ignores_unknown_channels() {
	let reg = SubscriptionRegistry::new();
	let alpha = channel("alpha-7");
	let (a, _tx, _rx) = conn(1);

	assert!(!reg.unsubscribe(&channel("nowhere"), &a));

	reg.subscribe(&alpha, &a, name("Raven"), 0).expect("subscribe");
	assert!(reg.unsubscribe(&alpha, &a));
	assert!(!reg.unsubscribe(&alpha, &a));
	assert_eq!(reg.subscriber_count(&alpha), 0);
}

#[test]
fn last_member_leaving_drops_the_channel() {
	let reg = SubscriptionRegistry::new();
	let alpha = channel("alpha-7");
	let (a, _tx_a, _rx_a) = conn(1);
	let (b, _tx_b, _rx_b) = conn(2);

	reg.subscribe(&alpha, &a, name("Raven"), 0).expect("a");
	reg.subscribe(&alpha, &b, name("Heron"), 0).expect("b");

	reg.unsubscribe(&alpha, &a);
	assert_eq!(reg.channel_count(), 1);

	assert_eq!(reg.remove_connection(&b), Some(alpha.clone()));
	assert_eq!(reg.channel_count(), 0);
	assert!(reg.active_subscribers(&alpha).is_empty());

	reg.subscribe(&alpha, &a, name("Raven"), 0).expect("channel re-created on demand");
	assert_eq!(reg.subscriber_count(&alpha), 1);
}

#[test]
fn remove_connection_without_subscription_is_none() {
	let reg = SubscriptionRegistry::new();
	let (a, _tx, _rx) = conn(1);
	assert_eq!(reg.remove_connection(&a), None);
}

#[test]
fn snapshot_is_not_affected_by_later_changes() {
	let reg = SubscriptionRegistry::new();
	let alpha = channel("alpha-7");
	let (a, _tx_a, _rx_a) = conn(1);
	let (b, _tx_b, _rx_b) = conn(2);

	reg.subscribe(&alpha, &a, name("Raven"), 0).expect("a");
	let snapshot = reg.active_subscribers(&alpha);

	reg.subscribe(&alpha, &b, name("Heron"), 0).expect("b");
	reg.unsubscribe(&alpha, &a);

	assert_eq!(snapshot.len(), 1);
	assert_eq!(snapshot[0].conn_id, ConnectionId(1));
	assert_eq!(reg.active_subscribers(&alpha)[0].conn_id, ConnectionId(2));
}

#[test]
fn concurrent_join_leave_across_channels_settles_cleanly() {
	let reg = Arc::new(SubscriptionRegistry::new());
	let mut workers = Vec::new();

	for t in 0..8u64 {
		let reg = Arc::clone(&reg);
		workers.push(thread::spawn(move || {
			let ch = channel(&format!("group-{}", t % 3));
			let (tx, _rx) = mpsc::channel::<OutboundItem>(1);
			let handle = ConnectionHandle::new(ConnectionId(t), &tx);
			for i in 0..200 {
				reg.subscribe(&ch, &handle, name("Worker"), i).expect("subscribe");
				assert!(reg.unsubscribe(&ch, &handle));
			}
			reg.subscribe(&ch, &handle, name("Worker"), 0).expect("final subscribe");
			(handle, tx)
		}));
	}

	let handles: Vec<_> = workers.into_iter().map(|w| w.join().expect("worker")).collect();

	let total: usize = (0..3).map(|i| reg.subscriber_count(&channel(&format!("group-{i}")))).sum();
	assert_eq!(total, 8);
	assert_eq!(reg.channel_count(), 3);

	for (handle, _tx) in &handles {
		assert!(reg.remove_connection(handle).is_some());
	}
	assert_eq!(reg.channel_count(), 0);
}
