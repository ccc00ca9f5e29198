use log::{error, info};

use crate::core::shutdown::get_shutdown_manager;
use crate::core::triggers::get_triggers;

#[cfg(unix)]
async fn handle_unix_signals() -> Result<(), std::io::Error> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sighup = signal(SignalKind::hangup())?;

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, starting graceful shutdown");
                get_shutdown_manager().initiate_shutdown();
                get_triggers().run_trigger("shutdown").await;
            }
            _ = sigint.recv() => {
                info!("SIGINT received, starting graceful shutdown");
                get_shutdown_manager().initiate_shutdown();
                get_triggers().run_trigger("shutdown").await;
            }
            _ = sighup.recv() => {
                info!("SIGHUP received, running production reload check");
                get_triggers().run_trigger("reload_signal").await;
            }
        }
    }
}

#[cfg(windows)]
async fn handle_windows_signals() -> Result<(), std::io::Error> {
    loop {
        tokio::signal::ctrl_c().await?;
        info!("ctrl-c received, starting graceful shutdown");
        get_shutdown_manager().initiate_shutdown();
        get_triggers().run_trigger("shutdown").await;
    }
}

pub fn start_signal_handling() {
    #[cfg(unix)]
    tokio::spawn(async {
        if let Err(e) = handle_unix_signals().await {
            error!("error handling unix signals: {}", e);
        }
    });

    #[cfg(windows)]
    tokio::spawn(async {
        if let Err(e) = handle_windows_signals().await {
            error!("error handling windows signals: {}", e);
        }
    });
}
