use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::info;

use spot_scheduler::clock::SystemClock;
use spot_scheduler::config::Config;
use spot_scheduler::notify::{LogMailer, NotificationQueue};
use spot_scheduler::scheduler::Scheduler;
use spot_scheduler::store::{InMemoryStore, run_compactor};
use spot_scheduler::wire::{self, SpotFactory};
use spot_scheduler::observability;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    observability::init_tracing();

    let cfg = Config::from_env()?;
    observability::init_metrics(cfg.metrics_port)?;

    let tls_acceptor =
        spot_scheduler::tls::load_tls_acceptor(cfg.tls_cert.as_deref(), cfg.tls_key.as_deref())?;

    std::fs::create_dir_all(&cfg.data_dir)?;

    let store = InMemoryStore::open(cfg.wal_path())?;
    tokio::spawn(run_compactor(store.clone(), cfg.compact_threshold));

    let (notifications, delivery) =
        NotificationQueue::start(cfg.notify_queue_capacity, Arc::new(LogMailer), cfg.calendar);

    let scheduler = Arc::new(Scheduler::new(
        Arc::new(store),
        Arc::new(SystemClock),
        Arc::new(notifications),
        cfg.scheduler_settings(),
    ));
    let factory = Arc::new(SpotFactory::new(scheduler.clone(), cfg.password.clone()));
    let semaphore = Arc::new(Semaphore::new(cfg.max_connections));

    let addr = cfg.listen_addr();
    let listener = TcpListener::bind(&addr).await?;
    info!("spot-scheduler listening on {addr}");
    info!("  data_dir: {}", cfg.data_dir.display());
    info!("  timezone: {}", cfg.calendar.timezone());
    info!("  slot step: {} min", cfg.slot_step_min);
    info!("  max_connections: {}", cfg.max_connections);
    info!("  tls: {}", if tls_acceptor.is_some() { "enabled" } else { "disabled" });

    // Stop accepting on SIGTERM/ctrl-c, then drain in-flight connections
    let shutdown = shutdown_signal()?;
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (socket, peer) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::error!("accept error: {e}");
                        continue;
                    }
                };

                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        tracing::warn!("connection limit reached, rejecting {peer}");
                        metrics::counter!(observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
                        drop(socket);
                        continue;
                    }
                };

                info!("connection from {peer}");
                metrics::counter!(observability::CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(observability::CONNECTIONS_ACTIVE).increment(1.0);
                let factory = factory.clone();
                let tls = tls_acceptor.clone();

                tokio::spawn(async move {
                    let _permit = permit; // held until connection closes
                    if let Err(e) = wire::process_connection(socket, factory, tls).await {
                        tracing::error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(observability::CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    // Wait for in-flight connections to finish (up to 10s)
    info!("draining connections...");
    let drain_deadline = tokio::time::sleep(std::time::Duration::from_secs(10));
    tokio::pin!(drain_deadline);

    loop {
        if semaphore.available_permits() == cfg.max_connections {
            info!("all connections drained");
            break;
        }
        tokio::select! {
            _ = &mut drain_deadline => {
                let remaining = cfg.max_connections - semaphore.available_permits();
                tracing::warn!("drain timeout, {remaining} connections still open");
                break;
            }
            _ = tokio::time::sleep(std::time::Duration::from_millis(100)) => {}
        }
    }

    // The last queue handle lives in the scheduler; the worker flushes the backlog once it goes.
    drop(factory);
    drop(scheduler);
    if tokio::time::timeout(std::time::Duration::from_secs(5), delivery)
        .await
        .is_err()
    {
        tracing::warn!("notification backlog not drained before exit");
    }

    info!("spot-scheduler stopped");
    Ok(())
}

#[cfg(unix)]
fn shutdown_signal() -> std::io::Result<impl std::future::Future<Output = ()>> {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm = signal(SignalKind::terminate())?;
    Ok(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    })
}

#[cfg(not(unix))]
fn shutdown_signal() -> std::io::Result<impl std::future::Future<Output = ()>> {
    Ok(async {
        tokio::signal::ctrl_c().await.ok();
    })
}
