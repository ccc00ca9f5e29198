use std::collections::HashMap;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use log::{error, info, LevelFilter};

use runway::cli::get_cli_args;
use runway::config::get_cached_config;
use runway::core::shutdown::get_shutdown_manager;
use runway::core::signals::start_signal_handling;
use runway::fastcgi::FastCgiPool;
use runway::port_pool::PortPool;
use runway::router::Router;
use runway::supervisor::Supervisor;
use runway::worker::registry::Registry;
use runway::{change_detector, discovery, health, logging, proxy};

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    let cli = get_cli_args();

    let level_override = cli.log_level.as_deref().and_then(|level| LevelFilter::from_str(level).ok());
    let bootstrap_config = get_cached_config().current().await.clone();
    if let Err(e) = logging::init_logging(cli.mode, &bootstrap_config.server.log_file, level_override) {
        eprintln!("failed to initialize logging: {}", e);
        std::process::exit(1);
    }

    info!("starting runway {} in {} mode", env!("CARGO_PKG_VERSION"), cli.mode);

    let workers = match discovery::discover_workers(&cli.workspace) {
        Ok(workers) => workers,
        Err(e) => {
            error!("worker discovery failed: {}", e);
            std::process::exit(1);
        }
    };
    info!("discovered {} worker(s) under {}", workers.len(), cli.workspace.display());

    let registry = Arc::new(Registry::new());
    let mut fcgi_pools: HashMap<String, Arc<FastCgiPool>> = HashMap::new();
    for worker in workers {
        let worker_dir = worker.source_dir.parent().unwrap_or(&worker.source_dir).to_path_buf();
        if worker.runtime == runway::worker::Runtime::ExternalFcgiBackend {
            match discovery::load_backend_config(&worker_dir) {
                Some(pool_config) => {
                    fcgi_pools.insert(worker.name.clone(), Arc::new(FastCgiPool::new(pool_config)));
                }
                None => {
                    error!("worker {} is external-fcgi-backend but declares no backend: section", worker.name);
                    std::process::exit(1);
                }
            }
        }
        registry.insert(worker).await;
    }
    let fcgi_pools = Arc::new(fcgi_pools);

    let (port_range_start, port_range_end, restart_delay_ms, shutdown_grace_period_ms) = {
        let config = get_cached_config().current().await;
        (
            config.workers.port_range_start,
            config.workers.port_range_end,
            config.workers.restart_delay_ms,
            config.workers.shutdown_grace_period_ms,
        )
    };
    let port_pool = Arc::new(PortPool::new(port_range_start, port_range_end));
    let router = Arc::new(Router::new());
    router.rebuild(&registry).await;

    let supervisor = Supervisor::new(
        registry.clone(),
        router.clone(),
        port_pool.clone(),
        std::time::Duration::from_millis(restart_delay_ms),
        std::time::Duration::from_millis(shutdown_grace_period_ms),
    );

    start_signal_handling();
    change_detector::start(cli.mode, registry.clone(), supervisor.restart_sender());
    tokio::spawn(health::run_health_loop(registry.clone(), supervisor.restart_sender()));
    supervisor.start(cli.mode).await;

    let addr = SocketAddr::from(([0, 0, 0, 0], bootstrap_config.server.port));
    let shutdown_token = get_shutdown_manager().token();

    let result = proxy::run(addr, router, registry, fcgi_pools, shutdown_token).await;

    supervisor.stop_all().await;

    match result {
        Ok(()) => info!("runway stopped cleanly"),
        Err(e) => {
            error!("proxy accept loop failed: {}", e);
            std::process::exit(1);
        }
    }
}
