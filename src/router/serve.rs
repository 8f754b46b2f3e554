use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::Router;
use axum_server::{Handle as ServerHandle, bind};
use mxbridge_core::{Result, Server, debug_info, info};

/// Bind the router and serve until the bridge shuts down.
pub async fn serve(server: &Arc<Server>, router: Router) -> Result {
	let config = server.config.get();
	let addr = SocketAddr::new(config.address, config.port);

	let handle = ServerHandle::new();
	let shutdown = {
		let server = server.clone();
		let handle = handle.clone();
		async move {
			server.until_shutdown().await;
			handle.graceful_shutdown(Some(Duration::from_secs(15)));
		}
	};
	server.runtime().spawn(shutdown);

	info!("Listening on {addr}");

	let service = router.into_make_service_with_connect_info::<SocketAddr>();
	bind(addr).handle(handle).serve(service).await?;

	debug_info!("Stopped listening on {addr}");
	Ok(())
}
