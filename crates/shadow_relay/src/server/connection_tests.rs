#![forbid(unsafe_code)]

use std::time::Duration;

use shadow_protocol::pb::{self, envelope::Msg};
use shadow_protocol::{DEFAULT_MAX_FRAME_SIZE, encode_frame_default};
use tokio::io::AsyncWriteExt as _;
use tokio::sync::mpsc;

use crate::server::connection::read_control_frames;

fn ping_frames(count: i64) -> Vec<u8> {
	let mut out = Vec::new();
	for i in 0..count {
		let env = pb::Envelope::new(format!("req-{i}"), Msg::Ping(pb::Ping { client_time_unix_ms: i }));
		out.extend(encode_frame_default(&env).expect("encode"));
	}
	out
}

#[tokio::test]
async fn slow_control_loop_stops_the_reader() {
	let (mut peer, relay_side) = tokio::io::duplex(1024);
	let (tx, mut rx) = mpsc::channel(4);
	let reader = tokio::spawn(read_control_frames(relay_side, tx, DEFAULT_MAX_FRAME_SIZE));

	let frames = ping_frames(2000);
	let writer = tokio::spawn(async move {
		peer.write_all(&frames).await.expect("write");
		peer.shutdown().await.expect("shutdown");
	});

	tokio::time::sleep(Duration::from_millis(200)).await;
	assert!(!writer.is_finished(), "peer must be held back while nothing drains the queue");
	assert_eq!(rx.len(), 4);

	let mut seen = 0i64;
	while let Some(env) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
		.await
		.expect("frames keep flowing once drained")
	{
		match env.msg {
			Some(Msg::Ping(p)) => assert_eq!(p.client_time_unix_ms, seen),
			other => panic!("unexpected {other:?}"),
		}
		seen += 1;
	}
	assert_eq!(seen, 2000);

	writer.await.expect("writer task");
	reader.await.expect("reader task").expect("clean eof");
}

#[tokio::test]
async fn oversized_frame_ends_the_reader_with_an_error() {
	let (mut peer, relay_side) = tokio::io::duplex(1024);
	let (tx, _rx) = mpsc::channel(4);
	let reader = tokio::spawn(read_control_frames(relay_side, tx, 16));

	peer.write_all(&64u32.to_be_bytes()).await.expect("write");

	let result = tokio::time::timeout(Duration::from_secs(5), reader)
		.await
		.expect("reader finishes")
		.expect("join");
	assert!(result.is_err());
}
