//! PostgreSQL persistence gateway

use crate::error::{Result, SyncError};
use crate::gateway::PersistenceGateway;
use crate::model::{
    day_bounds, Account, AccountId, DailyStat, DailyTotals, Deal, Order, OrderUpsert, Position,
    Snapshot,
};
use async_trait::async_trait;
use broker_client::{DealStatus, OrderStatus, TradeSide};
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};

/// Gateway over a shared, bounded connection pool
#[derive(Clone)]
pub struct PgGateway {
    pool: PgPool,
}

impl PgGateway {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to `database_url` and apply pending migrations
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new().max_connections(max_connections).connect(database_url).await?;

        // Run migrations
        sqlx::migrate!("./migrations").run(&pool).await?;

        tracing::info!(max_connections, "Connected to PostgreSQL");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn parse_side(value: &str) -> Result<TradeSide> {
    value.parse().map_err(|_| SyncError::Internal(format!("stored side '{}' is invalid", value)))
}

fn account_from_row(row: &PgRow) -> Result<Account> {
    Ok(Account {
        id: row.try_get("id")?,
        external_account_id: row.try_get("external_account_id")?,
        name: row.try_get("name")?,
        api_token: row.try_get("api_token")?,
        is_active: row.try_get("is_active")?,
        last_synced_at: row.try_get("last_synced_at")?,
    })
}

fn snapshot_from_row(row: &PgRow) -> Result<Snapshot> {
    Ok(Snapshot {
        id: row.try_get("id")?,
        account_id: row.try_get("account_id")?,
        balance: row.try_get("balance")?,
        equity: row.try_get("equity")?,
        margin: row.try_get("margin")?,
        free_margin: row.try_get("free_margin")?,
        unrealized_pl: row.try_get("unrealized_pl")?,
        captured_at: row.try_get("captured_at")?,
    })
}

fn order_from_row(row: &PgRow) -> Result<Order> {
    let side: String = row.try_get("side")?;
    let status: String = row.try_get("status")?;
    Ok(Order {
        account_id: row.try_get("account_id")?,
        id: row.try_get("id")?,
        ticker: row.try_get("ticker")?,
        side: parse_side(&side)?,
        order_type: row.try_get("order_type")?,
        volume: row.try_get("volume")?,
        price: row.try_get("price")?,
        status: OrderStatus::new(status),
        create_time: row.try_get("create_time")?,
        raw: row.try_get("raw")?,
        last_modified: row.try_get("last_modified")?,
    })
}

fn deal_from_row(row: &PgRow) -> Result<Deal> {
    let side: String = row.try_get("side")?;
    let status: String = row.try_get("status")?;
    Ok(Deal {
        account_id: row.try_get("account_id")?,
        id: row.try_get("id")?,
        ticker: row.try_get("ticker")?,
        side: parse_side(&side)?,
        volume: row.try_get("volume")?,
        open_price: row.try_get("open_price")?,
        close_price: row.try_get("close_price")?,
        open_time: row.try_get("open_time")?,
        close_time: row.try_get("close_time")?,
        profit: row.try_get("profit")?,
        status: DealStatus::parse(&status),
        raw: row.try_get("raw")?,
    })
}

fn position_from_row(row: &PgRow) -> Result<Position> {
    let side: String = row.try_get("side")?;
    Ok(Position {
        account_id: row.try_get("account_id")?,
        deal_id: row.try_get("deal_id")?,
        ticker: row.try_get("ticker")?,
        side: parse_side(&side)?,
        volume: row.try_get("volume")?,
        open_price: row.try_get("open_price")?,
        open_time: row.try_get("open_time")?,
        profit: row.try_get("profit")?,
    })
}

fn daily_stat_from_row(row: &PgRow) -> Result<DailyStat> {
    Ok(DailyStat {
        account_id: row.try_get("account_id")?,
        date: row.try_get("date")?,
        realized_pl: row.try_get("realized_pl")?,
        peak_equity: row.try_get("peak_equity")?,
        max_drawdown: row.try_get("max_drawdown")?,
    })
}

const ACCOUNT_COLUMNS: &str =
    "id, external_account_id, name, api_token, is_active, last_synced_at";

const SNAPSHOT_COLUMNS: &str =
    "id, account_id, balance, equity, margin, free_margin, unrealized_pl, captured_at";

#[async_trait]
impl PersistenceGateway for PgGateway {
    async fn active_accounts(&self) -> Result<Vec<Account>> {
        let sql = format!("SELECT {} FROM accounts WHERE is_active = TRUE ORDER BY id", ACCOUNT_COLUMNS);
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(account_from_row).collect()
    }

    async fn account(&self, account_id: AccountId) -> Result<Option<Account>> {
        let sql = format!("SELECT {} FROM accounts WHERE id = $1", ACCOUNT_COLUMNS);
        let row = sqlx::query(&sql).bind(account_id).fetch_optional(&self.pool).await?;
        row.as_ref().map(account_from_row).transpose()
    }

    async fn sync_cursor(&self, account_id: AccountId) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query("SELECT last_synced_at FROM accounts WHERE id = $1")
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(SyncError::AccountNotFound(account_id))?;
        Ok(row.try_get("last_synced_at")?)
    }

    async fn advance_sync_cursor(&self, account_id: AccountId, at: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query("UPDATE accounts SET last_synced_at = $2 WHERE id = $1")
            .bind(account_id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(SyncError::AccountNotFound(account_id));
        }
        Ok(())
    }

    async fn insert_snapshot(&self, snapshot: &Snapshot) -> Result<Snapshot> {
        let row = sqlx::query(
            "INSERT INTO account_snapshots
             (account_id, balance, equity, margin, free_margin, unrealized_pl, captured_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             RETURNING id",
        )
        .bind(snapshot.account_id)
        .bind(snapshot.balance)
        .bind(snapshot.equity)
        .bind(snapshot.margin)
        .bind(snapshot.free_margin)
        .bind(snapshot.unrealized_pl)
        .bind(snapshot.captured_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(Snapshot { id: row.try_get("id")?, ..snapshot.clone() })
    }

    async fn latest_snapshot(&self, account_id: AccountId) -> Result<Option<Snapshot>> {
        let sql = format!(
            "SELECT {} FROM account_snapshots WHERE account_id = $1
             ORDER BY captured_at DESC, id DESC LIMIT 1",
            SNAPSHOT_COLUMNS
        );
        let row = sqlx::query(&sql).bind(account_id).fetch_optional(&self.pool).await?;
        row.as_ref().map(snapshot_from_row).transpose()
    }

    async fn snapshots(&self, account_id: AccountId, limit: usize) -> Result<Vec<Snapshot>> {
        let sql = format!(
            "SELECT {} FROM account_snapshots WHERE account_id = $1
             ORDER BY captured_at DESC, id DESC LIMIT $2",
            SNAPSHOT_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(account_id)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(snapshot_from_row).collect()
    }

    async fn upsert_order(&self, order: &Order) -> Result<OrderUpsert> {
        // xmax is zero only for a freshly inserted tuple
        let row = sqlx::query(
            "INSERT INTO orders
             (account_id, id, ticker, side, order_type, volume, price, status, create_time, raw, last_modified)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
             ON CONFLICT (account_id, id) DO UPDATE SET
                 status = EXCLUDED.status,
                 volume = EXCLUDED.volume,
                 last_modified = EXCLUDED.last_modified
             RETURNING (xmax = 0) AS inserted",
        )
        .bind(order.account_id)
        .bind(&order.id)
        .bind(&order.ticker)
        .bind(order.side.as_str())
        .bind(&order.order_type)
        .bind(order.volume)
        .bind(order.price)
        .bind(order.status.as_str())
        .bind(order.create_time)
        .bind(&order.raw)
        .bind(order.last_modified)
        .fetch_one(&self.pool)
        .await?;

        let inserted: bool = row.try_get("inserted")?;
        Ok(if inserted { OrderUpsert::Inserted } else { OrderUpsert::Updated })
    }

    async fn orders(&self, account_id: AccountId) -> Result<Vec<Order>> {
        let rows = sqlx::query(
            "SELECT account_id, id, ticker, side, order_type, volume, price, status,
                    create_time, raw, last_modified
             FROM orders WHERE account_id = $1 ORDER BY id",
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(order_from_row).collect()
    }

    async fn insert_deal_if_absent(&self, deal: &Deal) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO deals
             (account_id, id, ticker, side, volume, open_price, close_price,
              open_time, close_time, profit, status, raw)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
             ON CONFLICT (account_id, id) DO NOTHING",
        )
        .bind(deal.account_id)
        .bind(&deal.id)
        .bind(&deal.ticker)
        .bind(deal.side.as_str())
        .bind(deal.volume)
        .bind(deal.open_price)
        .bind(deal.close_price)
        .bind(deal.open_time)
        .bind(deal.close_time)
        .bind(deal.profit)
        .bind(deal.status.as_str())
        .bind(&deal.raw)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn deals(&self, account_id: AccountId, limit: usize) -> Result<Vec<Deal>> {
        let rows = sqlx::query(
            "SELECT account_id, id, ticker, side, volume, open_price, close_price,
                    open_time, close_time, profit, status, raw
             FROM deals WHERE account_id = $1
             ORDER BY close_time DESC NULLS LAST, id DESC LIMIT $2",
        )
        .bind(account_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(deal_from_row).collect()
    }

    async fn replace_positions(&self, account_id: AccountId, positions: &[Position]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM positions WHERE account_id = $1")
            .bind(account_id)
            .execute(&mut *tx)
            .await?;

        for position in positions {
            sqlx::query(
                "INSERT INTO positions
                 (account_id, deal_id, ticker, side, volume, open_price, open_time, profit)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                 ON CONFLICT (account_id, deal_id) DO NOTHING",
            )
            .bind(account_id)
            .bind(&position.deal_id)
            .bind(&position.ticker)
            .bind(position.side.as_str())
            .bind(position.volume)
            .bind(position.open_price)
            .bind(position.open_time)
            .bind(position.profit)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn positions(&self, account_id: AccountId) -> Result<Vec<Position>> {
        let rows = sqlx::query(
            "SELECT account_id, deal_id, ticker, side, volume, open_price, open_time, profit
             FROM positions WHERE account_id = $1 ORDER BY open_time NULLS LAST, deal_id",
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(position_from_row).collect()
    }

    async fn daily_totals(&self, account_id: AccountId, date: NaiveDate) -> Result<DailyTotals> {
        let (start, end) = day_bounds(date);
        let row = sqlx::query(
            "SELECT
                 (SELECT COALESCE(SUM(profit), 0) FROM deals
                  WHERE account_id = $1 AND status = 'closed'
                    AND close_time >= $2 AND close_time < $3) AS realized_pl,
                 (SELECT MAX(equity) FROM account_snapshots
                  WHERE account_id = $1 AND captured_at >= $2 AND captured_at < $3) AS peak_equity,
                 (SELECT MIN(equity) FROM account_snapshots
                  WHERE account_id = $1 AND captured_at >= $2 AND captured_at < $3) AS trough_equity",
        )
        .bind(account_id)
        .bind(start)
        .bind(end)
        .fetch_one(&self.pool)
        .await?;

        Ok(DailyTotals {
            realized_pl: row.try_get("realized_pl")?,
            peak_equity: row.try_get("peak_equity")?,
            trough_equity: row.try_get("trough_equity")?,
        })
    }

    async fn upsert_daily_stat(&self, stat: &DailyStat) -> Result<()> {
        sqlx::query(
            "INSERT INTO daily_stats (account_id, date, realized_pl, peak_equity, max_drawdown)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (account_id, date) DO UPDATE SET
                 realized_pl = EXCLUDED.realized_pl,
                 peak_equity = EXCLUDED.peak_equity,
                 max_drawdown = EXCLUDED.max_drawdown,
                 updated_at = NOW()",
        )
        .bind(stat.account_id)
        .bind(stat.date)
        .bind(stat.realized_pl)
        .bind(stat.peak_equity)
        .bind(stat.max_drawdown)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn daily_stat(&self, account_id: AccountId, date: NaiveDate) -> Result<Option<DailyStat>> {
        let row = sqlx::query(
            "SELECT account_id, date, realized_pl, peak_equity, max_drawdown
             FROM daily_stats WHERE account_id = $1 AND date = $2",
        )
        .bind(account_id)
        .bind(date)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(daily_stat_from_row).transpose()
    }
}
