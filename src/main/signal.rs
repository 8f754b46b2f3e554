use std::{path::PathBuf, sync::Arc};

use mxbridge_core::{debug, info, utils::LogErr, warn};

use crate::Bridge;

/// Install the process signal handlers: SIGTERM/SIGINT shut down, SIGHUP
/// reloads the configuration.
pub(crate) fn install(bridge: &Arc<Bridge>, config_path: Option<PathBuf>) {
	let bridge = bridge.clone();
	bridge
		.server
		.runtime()
		.clone()
		.spawn(listen(bridge, config_path));
}

#[cfg(unix)]
async fn listen(bridge: Arc<Bridge>, config_path: Option<PathBuf>) {
	use tokio::signal::unix::{SignalKind, signal};

	let Ok(mut terminate) = signal(SignalKind::terminate()) else {
		warn!("cannot install SIGTERM handler");
		return;
	};
	let Ok(mut interrupt) = signal(SignalKind::interrupt()) else {
		warn!("cannot install SIGINT handler");
		return;
	};
	let Ok(mut hangup) = signal(SignalKind::hangup()) else {
		warn!("cannot install SIGHUP handler");
		return;
	};

	loop {
		tokio::select! {
			_ = terminate.recv() => {
				info!("SIGTERM received, shutting down");
				bridge.shutdown().log_err().ok();
				break;
			},
			_ = interrupt.recv() => {
				info!("SIGINT received, shutting down");
				bridge.shutdown().log_err().ok();
				break;
			},
			_ = hangup.recv() => {
				info!("SIGHUP received, reloading configuration");
				bridge.server.reload().log_err().ok();
				bridge
					.reload_config(config_path.as_deref())
					.await
					.log_err()
					.ok();
			},
		}
	}

	debug!("signal listener finished");
}

#[cfg(not(unix))]
async fn listen(bridge: Arc<Bridge>, _config_path: Option<PathBuf>) {
	if tokio::signal::ctrl_c().await.is_ok() {
		info!("interrupt received, shutting down");
		bridge.shutdown().log_err().ok();
	}
}
