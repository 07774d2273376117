use std::{fs, net::SocketAddr, path::PathBuf, sync::Arc, sync::RwLock, time::Duration};

use admin_ipc::{run_server, AdminRequest, AdminResponse, AdminStatus, DEFAULT_SOCKET_PATH};
use anyhow::{anyhow, bail};
use bigdecimal::ToPrimitive;
use chain::eth::EthChain;
use chain::Address;
use clap::Parser;
use metrics::MetricsHandle;
use snapshot::{RoundSnapshot, RoundSnapshotBuilder};
use storage::init_sqlite;
use tokio::task;
use tokio::time;
use tracing::{info, warn, Level};
use uuid::Uuid;

#[derive(Parser, Debug)]
struct Args {
    #[arg(long, env = "ETH_RPC_URL", default_value = "http://127.0.0.1:8545")]
    rpc_url: String,

    /// Address of the round registry (factory) contract.
    #[arg(long, env = "REGISTRY_ADDRESS")]
    registry_address: String,

    #[arg(long, env = "POLL_SECS", default_value_t = 30)]
    poll_secs: u64,

    #[arg(long, env = "SQLITE_PATH", default_value = "sqlite://rounds.db")]
    sqlite_path: String,

    #[arg(long, env = "ADMIN_SOCKET", default_value = DEFAULT_SOCKET_PATH)]
    admin_socket: String,

    #[arg(long, env = "METRICS_ADDR", default_value = "127.0.0.1:9109")]
    metrics_addr: SocketAddr,
}

#[derive(Default)]
struct WatchState {
    latest: Option<RoundSnapshot>,
    builds: u64,
    failures: u64,
}

fn parse_registry_address(raw: &str) -> anyhow::Result<Address> {
    raw.parse::<Address>()
        .map_err(|err| anyhow!("invalid registry address `{raw}`: {err}"))
}

fn ensure_sqlite_parent_dir(path: &str) -> anyhow::Result<()> {
    const MEMORY_PREFIX: &str = "sqlite::memory:";
    const URL_PREFIX: &str = "sqlite://";

    if path.starts_with(MEMORY_PREFIX) {
        return Ok(());
    }

    if let Some(rest) = path.strip_prefix(URL_PREFIX) {
        let path_part = rest.split_once('?').map(|(path, _)| path).unwrap_or(rest);
        let fs_path = PathBuf::from(path_part);
        if let Some(parent) = fs_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
    }

    Ok(())
}

fn validate_sqlite_path(path: &str) -> anyhow::Result<()> {
    const MEMORY_PREFIX: &str = "sqlite::memory:";
    const URL_PREFIX: &str = "sqlite://";

    if path.starts_with(MEMORY_PREFIX) {
        return Ok(());
    }

    if !path.starts_with(URL_PREFIX) {
        bail!("sqlite path must start with `sqlite://` or use `sqlite::memory:`");
    }

    let rest = path.trim_start_matches(URL_PREFIX);
    let (path_part, _) = rest.split_once('?').unwrap_or((rest, ""));
    if path_part.is_empty() {
        bail!("sqlite path is missing a filesystem component after `sqlite://`");
    }

    Ok(())
}

fn gauge_value(amount: &bigdecimal::BigDecimal) -> f64 {
    amount.to_f64().unwrap_or(f64::NAN)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let registry_address = parse_registry_address(&args.registry_address)?;
    validate_sqlite_path(&args.sqlite_path)?;
    ensure_sqlite_parent_dir(&args.sqlite_path)?;

    info!(
        rpc = %args.rpc_url,
        registry = ?registry_address,
        sqlite = %args.sqlite_path,
        socket = %args.admin_socket,
        "booting roundwatchd"
    );

    let run_id = Uuid::new_v4().to_string();
    let store = init_sqlite(&args.sqlite_path).await?;
    store.insert_run(&run_id).await?;

    let state = Arc::new(RwLock::new(WatchState::default()));

    let run_id_clone = run_id.clone();
    let state_clone = Arc::clone(&state);
    let socket_path = args.admin_socket.clone();
    task::spawn(async move {
        let handler = move |req: AdminRequest| -> anyhow::Result<AdminResponse> {
            let state = state_clone
                .read()
                .map_err(|_| anyhow!("watch state poisoned"))?;
            match req {
                AdminRequest::Status => Ok(AdminResponse::Status(AdminStatus {
                    run_id: run_id_clone.clone(),
                    builds: state.builds,
                    failures: state.failures,
                    last_status: state.latest.as_ref().map(|snap| snap.status.to_string()),
                })),
                AdminRequest::Snapshot => {
                    let value = match &state.latest {
                        Some(snap) => Some(serde_json::to_value(snap)?),
                        None => None,
                    };
                    Ok(AdminResponse::Snapshot(value))
                }
            }
        };
        if let Err(err) = run_server(&socket_path, handler).await {
            tracing::error!(error = ?err, "admin ipc server failed");
        }
    });

    let metrics = MetricsHandle::new()?;
    let metrics_addr = args.metrics_addr;
    let metrics_task = metrics.clone();
    task::spawn(async move {
        if let Err(err) = metrics_task.serve(metrics_addr).await {
            tracing::error!(error = ?err, "metrics server error");
        }
    });

    let eth = EthChain::connect(&args.rpc_url, registry_address)?;
    let builder = RoundSnapshotBuilder::new(eth);

    info!(
        run_id = %run_id,
        poll_secs = args.poll_secs,
        metrics_addr = %args.metrics_addr,
        "ready"
    );

    let mut ticker = time::interval(Duration::from_secs(args.poll_secs));
    loop {
        ticker.tick().await;
        match builder.build().await {
            Ok(Some(snap)) => {
                metrics.record_build();
                metrics.set_totals(
                    gauge_value(&snap.total_funds),
                    gauge_value(&snap.matching_pool),
                    gauge_value(&snap.contributions),
                );
                if let Err(err) = store.record_snapshot(&run_id, &snap).await {
                    warn!(error = ?err, "failed to record snapshot");
                }
                info!(
                    round = ?snap.round_address,
                    status = %snap.status,
                    total_funds = %snap.total_funds,
                    matching_pool = %snap.matching_pool,
                    contributions = %snap.contributions,
                    "snapshot built"
                );
                if let Ok(mut state) = state.write() {
                    state.latest = Some(snap);
                    state.builds += 1;
                }
            }
            Ok(None) => {
                metrics.record_build();
                info!("no active round");
                if let Ok(mut state) = state.write() {
                    state.latest = None;
                    state.builds += 1;
                }
            }
            Err(err) => {
                metrics.record_failure();
                warn!(error = %err, "snapshot build failed");
                if let Err(log_err) = store
                    .log_incident(&run_id, "warning", "build_failed", &err.to_string())
                    .await
                {
                    warn!(error = ?log_err, "failed to log build incident");
                }
                if let Ok(mut state) = state.write() {
                    state.failures += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hex_registry_address() {
        let addr = parse_registry_address("0x0000000000000000000000000000000000001234")
            .expect("address should parse");
        assert_eq!(addr, Address::from_low_u64_be(0x1234));
    }

    #[test]
    fn rejects_malformed_registry_address() {
        let err = parse_registry_address("not-an-address").expect_err("should reject");
        assert!(err.to_string().contains("invalid registry address"));
    }

    #[test]
    fn validates_memory_and_file_urls() {
        validate_sqlite_path("sqlite::memory:?cache=shared").expect("memory dsn should validate");
        validate_sqlite_path("sqlite://rounds.db").expect("relative file url should validate");
    }

    #[test]
    fn rejects_missing_or_invalid_urls() {
        let err = validate_sqlite_path("rounds.db").expect_err("should reject plain filename");
        assert!(err
            .to_string()
            .contains("must start with `sqlite://` or use `sqlite::memory:`"));

        let err = validate_sqlite_path("sqlite://").expect_err("should reject empty path");
        assert!(err
            .to_string()
            .contains("missing a filesystem component after `sqlite://`"));
    }

    #[test]
    fn creates_parent_directory_for_sqlite_url() {
        let tmp_dir = std::env::temp_dir().join(format!("roundwatchd_{}", Uuid::new_v4()));
        let url = format!("sqlite://{}/data/rounds.db", tmp_dir.display());

        ensure_sqlite_parent_dir(&url).expect("should create parent directories");
        assert!(tmp_dir.join("data").is_dir());

        let _ = fs::remove_dir_all(tmp_dir);
    }
}
