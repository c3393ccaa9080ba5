use chrono::Utc;
use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result};
use rust_decimal::Decimal;
use shkeeper_reconciler::application::checkout::Checkout;
use shkeeper_reconciler::application::locks::OrderLocks;
use shkeeper_reconciler::application::outbox::{Outbox, OutboxHandle};
use shkeeper_reconciler::application::reconciler::Reconciler;
use shkeeper_reconciler::application::sync::StatusSync;
use shkeeper_reconciler::config::Config;
use shkeeper_reconciler::domain::ports::{DownstreamRef, GatewayRef, OrderStoreRef};
use shkeeper_reconciler::infrastructure::downstream::{HttpDownstream, LogDownstream};
use shkeeper_reconciler::infrastructure::in_memory::InMemoryOrderStore;
#[cfg(feature = "storage-rocksdb")]
use shkeeper_reconciler::infrastructure::rocksdb::RocksDBStore;
use shkeeper_reconciler::interfaces::csv::order_writer::OrderWriter;
use shkeeper_reconciler::interfaces::http::orders::{ApiKey, OrdersApi};
use shkeeper_reconciler::interfaces::http::webhook::{self, AppState, WEBHOOK_PATH};
use shkeeper_reconciler::interfaces::shkeeper::ShkeeperClient;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing_subscriber::EnvFilter;

/// How long shutdown waits for queued side effects; undelivered ones stay
/// pending on their orders.
const OUTBOX_GRACE: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to persistent database (optional). Overrides DATABASE_URL and requires
    /// the `storage-rocksdb` feature.
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the webhook server and order API with the reservation sweeper and status sync.
    Serve {
        /// Listen port (overrides PORT).
        #[arg(long)]
        port: Option<u16>,
    },
    /// Reserve a new gateway-paid order.
    Reserve {
        code: String,
        amount: Decimal,
        #[arg(long, default_value = "USD")]
        currency: String,
        /// Minutes the reservation is held before it expires.
        #[arg(long, default_value_t = 30, allow_negative_numbers = true)]
        hold_minutes: i64,
    },
    /// Create the gateway invoice for a reserved order.
    Invoice { code: String, crypto: String },
    /// List the cryptocurrencies the gateway accepts.
    Cryptos,
    /// Poll the gateway once for every open invoice.
    Sync,
    /// Expire overdue reservations once and redeliver pending side effects.
    Sweep,
    /// Write all orders as CSV to stdout.
    Orders,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(Config::dev_mode_from_env());

    let mut config = Config::from_env().into_diagnostic()?;
    if let Some(db_path) = cli.db_path {
        config.db_path = Some(db_path);
    }

    let store = open_store(config.db_path.as_deref())?;

    match cli.command {
        Command::Serve { port } => {
            if let Some(port) = port {
                config.port = port;
            }
            serve(config, store).await
        }
        Command::Reserve {
            code,
            amount,
            currency,
            hold_minutes,
        } => {
            let checkout = Checkout::new(store, Arc::new(OrderLocks::new()), gateway(&config)?);
            let order = checkout
                .reserve(&code, amount, &currency, hold_minutes)
                .await
                .into_diagnostic()?;
            println!("{} reserved until {}", order.code, order.reserved_until.to_rfc3339());
            Ok(())
        }
        Command::Invoice { code, crypto } => {
            let checkout = Checkout::new(store, Arc::new(OrderLocks::new()), gateway(&config)?);
            let order = checkout
                .open_invoice(&code, &crypto, &config.callback_url(WEBHOOK_PATH))
                .await
                .into_diagnostic()?;
            if let Some(details) = &order.gateway {
                println!(
                    "{} invoice {}: pay {} {} to {}",
                    order.code,
                    details.invoice_id,
                    details.crypto_amount,
                    details.crypto,
                    details.address
                );
            }
            Ok(())
        }
        Command::Cryptos => {
            for crypto in gateway(&config)?.list_cryptos().await.into_diagnostic()? {
                println!("{crypto}");
            }
            Ok(())
        }
        Command::Sync => {
            let (reconciler, outbox) =
                reconciler(&config, store.clone(), Arc::new(OrderLocks::new()))?;
            let sync = StatusSync::new(store, gateway(&config)?, reconciler);
            let report = sync.run_once().await.into_diagnostic()?;
            drop(sync);
            drain(outbox).await;
            println!(
                "checked {} updated {} failed {}",
                report.checked, report.updated, report.failed
            );
            Ok(())
        }
        Command::Sweep => {
            let (reconciler, outbox) = reconciler(&config, store, Arc::new(OrderLocks::new()))?;
            let redelivered = reconciler.redeliver_pending().await.into_diagnostic()?;
            let expired = reconciler.expire_overdue(Utc::now()).await.into_diagnostic()?;
            drop(reconciler);
            drain(outbox).await;
            println!("expired {expired} redelivered {redelivered}");
            Ok(())
        }
        Command::Orders => {
            let orders = store.all_orders().await.into_diagnostic()?;
            let stdout = io::stdout();
            let mut writer = OrderWriter::new(stdout.lock());
            writer.write_orders(&orders).into_diagnostic()?;
            Ok(())
        }
    }
}

fn init_tracing(dev_mode: bool) {
    let default = if dev_mode { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_writer(io::stderr)
        .init();
}

#[cfg(feature = "storage-rocksdb")]
fn open_store(db_path: Option<&Path>) -> Result<OrderStoreRef> {
    match db_path {
        Some(path) => {
            tracing::info!(path = %path.display(), "using RocksDB order store");
            let store = RocksDBStore::open(path).into_diagnostic()?;
            Ok(Arc::new(store))
        }
        None => Ok(Arc::new(InMemoryOrderStore::new())),
    }
}

#[cfg(not(feature = "storage-rocksdb"))]
fn open_store(db_path: Option<&Path>) -> Result<OrderStoreRef> {
    if db_path.is_some() {
        eprintln!(
            "WARNING: Persistent storage requested via --db-path, but 'storage-rocksdb' feature is not enabled. Falling back to In-Memory storage."
        );
    }
    Ok(Arc::new(InMemoryOrderStore::new()))
}

fn gateway(config: &Config) -> Result<GatewayRef> {
    let client = ShkeeperClient::new(config.shkeeper.clone()).into_diagnostic()?;
    Ok(Arc::new(client))
}

fn downstream(config: &Config) -> Result<DownstreamRef> {
    match &config.bot_notify_url {
        Some(url) => {
            let downstream =
                HttpDownstream::new(url.clone(), config.notification_timeout).into_diagnostic()?;
            Ok(Arc::new(downstream))
        }
        None => Ok(Arc::new(LogDownstream)),
    }
}

fn reconciler(
    config: &Config,
    store: OrderStoreRef,
    locks: Arc<OrderLocks>,
) -> Result<(Arc<Reconciler>, OutboxHandle)> {
    let (outbox, handle) =
        Outbox::spawn(downstream(config)?, store.clone(), locks.clone(), config.retry);
    let reconciler = Reconciler::new(store, locks, outbox);
    Ok((Arc::new(reconciler), handle))
}

/// Waits for queued side effects once every reconciler is gone.
async fn drain(outbox: OutboxHandle) {
    match tokio::time::timeout(OUTBOX_GRACE, outbox.join()).await {
        Ok(stats) => {
            tracing::info!(
                delivered = stats.delivered,
                dropped = stats.dropped,
                "outbox drained"
            );
        }
        Err(_) => {
            tracing::warn!("outbox still busy at shutdown, undelivered side effects stay pending")
        }
    }
}

async fn serve(config: Config, store: OrderStoreRef) -> Result<()> {
    let verifier = config.verifier().into_diagnostic()?;
    if config.dev_mode {
        tracing::warn!("DEV_MODE is enabled: webhook signatures are not verified");
    }

    let locks = Arc::new(OrderLocks::new());
    let (reconciler, outbox) = reconciler(&config, store.clone(), locks.clone())?;
    let redelivered = reconciler.redeliver_pending().await.into_diagnostic()?;
    if redelivered > 0 {
        tracing::info!(redelivered, "pending side effects requeued");
    }

    let api_key = ApiKey::new(config.orders_api_key.as_deref(), config.dev_mode);
    if !api_key.is_enabled() {
        tracing::warn!("ORDERS_API_KEY is not set: the order API rejects every request");
    }
    let checkout = Checkout::new(store.clone(), locks, gateway(&config)?);
    let orders = OrdersApi::new(Arc::new(checkout), api_key, config.callback_url(WEBHOOK_PATH));

    let (stop_tx, stop_rx) = watch::channel(false);
    let mut workers = JoinSet::new();

    workers.spawn(run_sweeper(
        reconciler.clone(),
        config.sweep_interval,
        stop_rx.clone(),
    ));
    if let Some(every) = config.sync_interval {
        let sync = StatusSync::new(store, gateway(&config)?, reconciler.clone());
        workers.spawn(run_sync(sync, every, stop_rx.clone()));
    }

    let listener = TcpListener::bind(("0.0.0.0", config.port))
        .await
        .into_diagnostic()?;
    let state = AppState::new(reconciler, verifier).with_orders(orders);
    webhook::serve(listener, state, shutdown_signal())
        .await
        .into_diagnostic()?;

    let _ = stop_tx.send(true);
    while workers.join_next().await.is_some() {}
    drain(outbox).await;
    Ok(())
}

async fn run_sweeper(reconciler: Arc<Reconciler>, every: Duration, mut stop: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = reconciler.redeliver_pending().await {
                    tracing::error!(error = %e, "side effect redelivery failed");
                }
                match reconciler.expire_overdue(Utc::now()).await {
                    Ok(0) => {}
                    Ok(expired) => tracing::info!(expired, "reservation sweep finished"),
                    Err(e) => tracing::error!(error = %e, "reservation sweep failed"),
                }
            }
            _ = stop.changed() => break,
        }
    }
}

async fn run_sync(sync: StatusSync, every: Duration, mut stop: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match sync.run_once().await {
                    Ok(report) if report.updated > 0 || report.failed > 0 => tracing::info!(
                        checked = report.checked,
                        updated = report.updated,
                        failed = report.failed,
                        "status sync finished"
                    ),
                    Ok(_) => {}
                    Err(e) => tracing::error!(error = %e, "status sync failed"),
                }
            }
            _ = stop.changed() => break,
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown requested");
}
