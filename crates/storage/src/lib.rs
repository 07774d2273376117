use anyhow::Result;
use chrono::Utc;
use snapshot::RoundSnapshot;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use tracing::info;

pub const INIT_SQL: &str = include_str!("../../../scripts/init_db.sql");

/// Sqlite-backed history of built snapshots plus run/incident bookkeeping.
/// Exact monetary values are stored as decimal strings.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn connect(path: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(path)
            .await?;
        run_init_sql(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn insert_run(&self, run_id: &str) -> Result<()> {
        let host = hostname::get()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string();
        let ts_ms = Utc::now().timestamp_millis();
        sqlx::query("INSERT OR REPLACE INTO runs (run_id, started_at_ms, host) VALUES (?1, ?2, ?3)")
            .bind(run_id)
            .bind(ts_ms)
            .bind(host)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn record_snapshot(&self, run_id: &str, snap: &RoundSnapshot) -> Result<()> {
        let ts_ms = Utc::now().timestamp_millis();
        sqlx::query(
            "INSERT INTO round_snapshots (run_id, ts_ms, round_address, status, token_symbol, token_decimals, total_funds, matching_pool, contributions) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(run_id)
        .bind(ts_ms)
        .bind(format!("{:?}", snap.round_address))
        .bind(snap.status.to_string())
        .bind(&snap.native_token_symbol)
        .bind(i64::from(snap.native_token_decimals))
        .bind(snap.total_funds.to_string())
        .bind(snap.matching_pool.to_string())
        .bind(snap.contributions.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn log_incident(
        &self,
        run_id: &str,
        severity: &str,
        kind: &str,
        message: &str,
    ) -> Result<()> {
        let ts_ms = Utc::now().timestamp_millis();
        sqlx::query(
            "INSERT INTO incidents (run_id, ts_ms, severity, kind, message) VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(run_id)
        .bind(ts_ms)
        .bind(severity)
        .bind(kind)
        .bind(message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

pub async fn init_sqlite(path: &str) -> Result<Store> {
    let store = Store::connect(path).await?;
    info!(path = path, "sqlite initialized");
    Ok(store)
}

async fn run_init_sql(pool: &SqlitePool) -> Result<()> {
    for statement in INIT_SQL.split(';') {
        let trimmed = statement.trim();
        if trimmed.is_empty() {
            continue;
        }
        sqlx::query(trimmed).execute(pool).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use bigdecimal::BigDecimal;
    use chrono::DateTime;
    use snapshot::{Address, CoordinatorPubKey, RoundSnapshot, RoundStatus, U256};

    use super::*;

    fn sample_snapshot() -> RoundSnapshot {
        RoundSnapshot {
            round_address: Address::from_low_u64_be(0x1234),
            coordinator_address: Address::from_low_u64_be(0xc0),
            coordinator_pub_key: CoordinatorPubKey {
                x: U256::from(1u64),
                y: U256::from(2u64),
            },
            native_token_address: Address::from_low_u64_be(0x70),
            native_token_symbol: "DAI".to_string(),
            native_token_decimals: 18,
            status: RoundStatus::Contributing,
            contribution_deadline: DateTime::from_timestamp(1_700_000_100, 0).expect("timestamp"),
            voting_deadline: DateTime::from_timestamp(1_700_000_200, 0).expect("timestamp"),
            total_funds: BigDecimal::from(850),
            matching_pool: BigDecimal::from(500),
            contributions: BigDecimal::from(350),
        }
    }

    #[tokio::test]
    async fn records_runs_snapshots_and_incidents() {
        let store = Store::connect("sqlite::memory:").await.expect("connect");
        store.insert_run("run-1").await.expect("insert run");
        store
            .record_snapshot("run-1", &sample_snapshot())
            .await
            .expect("record snapshot");
        store
            .log_incident("run-1", "warning", "build_failed", "transport failure")
            .await
            .expect("log incident");

        let snapshots: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM round_snapshots")
            .fetch_one(store.pool())
            .await
            .expect("count snapshots");
        assert_eq!(snapshots, 1);

        let (status, total_funds): (String, String) = sqlx::query_as(
            "SELECT status, total_funds FROM round_snapshots WHERE run_id = 'run-1'",
        )
        .fetch_one(store.pool())
        .await
        .expect("read snapshot row");
        assert_eq!(status, "Contributing");
        assert_eq!(total_funds, "850");

        let incidents: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM incidents")
            .fetch_one(store.pool())
            .await
            .expect("count incidents");
        assert_eq!(incidents, 1);
    }

    #[tokio::test]
    async fn init_sql_is_idempotent() {
        let store = Store::connect("sqlite::memory:").await.expect("connect");
        run_init_sql(store.pool()).await.expect("re-run init");
    }
}
