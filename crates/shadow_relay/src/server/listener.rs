#![forbid(unsafe_code)]

use std::sync::Arc;

use tracing::{info, warn};

use crate::server::connection::{ConnectionSettings, handle_connection};
use crate::server::registry::ConnectionId;
use crate::server::state::RelayContext;

/// Accept QUIC connections until the endpoint closes, one task per connection.
pub async fn serve(endpoint: quinn::Endpoint, ctx: Arc<RelayContext>, settings: ConnectionSettings) {
	let mut next_conn_id: u64 = 1;

	while let Some(incoming) = endpoint.accept().await {
		let conn_id = ConnectionId(next_conn_id);
		next_conn_id += 1;
		metrics::counter!("shadow_relay_connections_total").increment(1);

		let ctx = Arc::clone(&ctx);
		let settings = settings.clone();
		tokio::spawn(async move {
			match incoming.await {
				Ok(connection) => {
					info!(conn_id = %conn_id, remote = %connection.remote_address(), "accepted connection");
					if let Err(e) = handle_connection(conn_id, connection, ctx, settings).await {
						warn!(conn_id = %conn_id, error = %e, "connection handler exited with error");
					}
				}
				Err(e) => {
					warn!(conn_id = %conn_id, error = %e, "failed to establish QUIC connection");
				}
			}
		});
	}

	info!("relay endpoint closed; accept loop finished");
}
