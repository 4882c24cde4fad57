//! SQLite-backed implementation of the state repository contract.
//!
//! Decimals are stored as text to avoid float drift; timestamps are RFC 3339
//! text. Every operation is a single atomic statement except the gate check,
//! which needs a read-check-write transaction (SQLite transactions are
//! serialisable, WAL keeps the single writer cheap).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::str::FromStr;
use std::time::Duration;

use crate::domain::errors::StoreError;
use crate::domain::repositories::{StateRepository, backoff_delay_seconds};
use crate::domain::types::{
    Bar, DrawdownLevel, DrawdownState, Fill, OrderIntent, OrderSide, OrderState, PositionTracking,
};
use crate::infrastructure::persistence::database::Database;

pub struct SqliteStateRepository {
    database: Database,
}

impl SqliteStateRepository {
    pub fn new(database: Database) -> Self {
        Self { database }
    }
}

fn parse_decimal(key: &str, raw: &str) -> Result<Decimal, StoreError> {
    Decimal::from_str(raw).map_err(|e| StoreError::Corrupt {
        key: key.to_string(),
        reason: format!("bad decimal {raw}: {e}"),
    })
}

fn parse_timestamp(key: &str, raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt {
            key: key.to_string(),
            reason: format!("bad timestamp {raw}: {e}"),
        })
}

fn parse_side(raw: &str) -> Result<OrderSide, StoreError> {
    match raw {
        "BUY" => Ok(OrderSide::Buy),
        "SELL" => Ok(OrderSide::Sell),
        other => Err(StoreError::Corrupt {
            key: "side".to_string(),
            reason: format!("unknown side {other}"),
        }),
    }
}

fn parse_state(raw: &str) -> Result<OrderState, StoreError> {
    raw.parse().map_err(|reason| StoreError::Corrupt {
        key: "state".to_string(),
        reason,
    })
}

type IntentRow = (
    String,         // client_order_id
    Option<String>, // broker_order_id
    String,         // symbol
    String,         // side
    String,         // quantity
    Option<String>, // limit_price
    String,         // state
    String,         // created_at
    Option<String>, // updated_at
);

fn intent_from_row(row: IntentRow) -> Result<OrderIntent, StoreError> {
    let (client_order_id, broker_order_id, symbol, side, quantity, limit_price, state, created, updated) =
        row;
    Ok(OrderIntent {
        quantity: parse_decimal("order_intents.quantity", &quantity)?,
        limit_price: limit_price
            .map(|p| parse_decimal("order_intents.limit_price", &p))
            .transpose()?,
        side: parse_side(&side)?,
        state: parse_state(&state)?,
        created_at: parse_timestamp("order_intents.created_at", &created)?,
        updated_at: updated
            .map(|u| parse_timestamp("order_intents.updated_at", &u))
            .transpose()?,
        client_order_id,
        broker_order_id,
        symbol,
    })
}

type PositionRow = (String, String, String, f64, String, String, i64);

fn position_from_row(row: PositionRow) -> Result<PositionTracking, StoreError> {
    let (symbol, quantity, entry_price, atr_value, trailing, last_update, pending) = row;
    Ok(PositionTracking {
        quantity: parse_decimal("position_tracking.quantity", &quantity)?,
        entry_price: parse_decimal("position_tracking.entry_price", &entry_price)?,
        trailing_stop_price: parse_decimal("position_tracking.trailing_stop_price", &trailing)?,
        last_update_at: parse_timestamp("position_tracking.last_update_at", &last_update)?,
        pending_exit: pending != 0,
        atr_value,
        symbol,
    })
}

#[async_trait]
impl StateRepository for SqliteStateRepository {
    async fn get_state(&self, key: &str) -> Result<Option<String>, StoreError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT value FROM bot_state WHERE key = $1")
                .bind(key)
                .fetch_optional(&self.database.pool)
                .await?;
        Ok(row.map(|(v,)| v))
    }

    async fn set_state(&self, key: &str, value: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO bot_state (key, value, updated_at)
            VALUES ($1, $2, $3)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.database.pool)
        .await?;
        Ok(())
    }

    async fn gate_try_accept(
        &self,
        gate: &str,
        bar_ts: DateTime<Utc>,
        now: DateTime<Utc>,
        cooldown: Duration,
    ) -> Result<bool, StoreError> {
        let mut tx = self.database.pool.begin().await?;

        let row: Option<(Option<String>, Option<String>)> = sqlx::query_as(
            "SELECT last_accepted_bar_ts, last_accepted_ts FROM signal_gates WHERE gate_name = $1",
        )
        .bind(gate)
        .fetch_optional(&mut *tx)
        .await?;

        let mut prev_accepted_ts: Option<DateTime<Utc>> = None;
        if let Some((last_bar, last_ts)) = row {
            if let Some(last_bar) = last_bar {
                let last_bar = parse_timestamp("signal_gates.last_accepted_bar_ts", &last_bar)?;
                if last_bar == bar_ts {
                    tx.rollback().await?;
                    return Ok(false);
                }
            }
            if let Some(last_ts) = last_ts {
                let last_ts = parse_timestamp("signal_gates.last_accepted_ts", &last_ts)?;
                if !cooldown.is_zero() {
                    let elapsed = now - last_ts;
                    if elapsed < chrono::Duration::from_std(cooldown).unwrap_or_default() {
                        tx.rollback().await?;
                        return Ok(false);
                    }
                }
                prev_accepted_ts = Some(last_ts);
            }
        }

        // last_accepted_ts never goes backwards, even with a skewed clock.
        let accepted_ts = match prev_accepted_ts {
            Some(prev) if prev > now => prev,
            _ => now,
        };

        sqlx::query(
            r#"
            INSERT INTO signal_gates (gate_name, last_accepted_bar_ts, last_accepted_ts, updated_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT(gate_name) DO UPDATE SET
                last_accepted_bar_ts = excluded.last_accepted_bar_ts,
                last_accepted_ts = excluded.last_accepted_ts,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(gate)
        .bind(bar_ts.to_rfc3339())
        .bind(accepted_ts.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn save_order_intent(&self, intent: &OrderIntent) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO order_intents
                (client_order_id, broker_order_id, symbol, side, quantity,
                 limit_price, state, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(&intent.client_order_id)
        .bind(&intent.broker_order_id)
        .bind(&intent.symbol)
        .bind(intent.side.to_string())
        .bind(intent.quantity.to_string())
        .bind(intent.limit_price.map(|p| p.to_string()))
        .bind(intent.state.to_string())
        .bind(intent.created_at.to_rfc3339())
        .bind(intent.updated_at.map(|u| u.to_rfc3339()))
        .execute(&self.database.pool)
        .await?;
        Ok(())
    }

    async fn get_order_intent(
        &self,
        client_order_id: &str,
    ) -> Result<Option<OrderIntent>, StoreError> {
        let row: Option<IntentRow> = sqlx::query_as(
            r#"
            SELECT client_order_id, broker_order_id, symbol, side, quantity,
                   limit_price, state, created_at, updated_at
            FROM order_intents WHERE client_order_id = $1
            "#,
        )
        .bind(client_order_id)
        .fetch_optional(&self.database.pool)
        .await?;
        row.map(intent_from_row).transpose()
    }

    async fn update_order_intent(
        &self,
        client_order_id: &str,
        broker_order_id: Option<&str>,
        state: OrderState,
        updated_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE order_intents SET
                broker_order_id = COALESCE($2, broker_order_id),
                state = $3,
                updated_at = $4
            WHERE client_order_id = $1
            "#,
        )
        .bind(client_order_id)
        .bind(broker_order_id)
        .bind(state.to_string())
        .bind(updated_at.to_rfc3339())
        .execute(&self.database.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::IntentNotFound(client_order_id.to_string()));
        }
        Ok(())
    }

    async fn open_order_intents(&self) -> Result<Vec<OrderIntent>, StoreError> {
        let rows: Vec<IntentRow> = sqlx::query_as(
            r#"
            SELECT client_order_id, broker_order_id, symbol, side, quantity,
                   limit_price, state, created_at, updated_at
            FROM order_intents
            WHERE state IN ('PendingNew', 'Accepted', 'PendingCancel', 'PendingReplace')
            ORDER BY created_at
            "#,
        )
        .fetch_all(&self.database.pool)
        .await?;
        rows.into_iter().map(intent_from_row).collect()
    }

    async fn symbol_has_order_intent(&self, symbol: &str) -> Result<bool, StoreError> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM order_intents WHERE symbol = $1 LIMIT 1")
                .bind(symbol)
                .fetch_optional(&self.database.pool)
                .await?;
        Ok(row.is_some())
    }

    async fn insert_fill(&self, fill: &Fill) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO fills
                (broker_order_id, client_order_id, filled_qty, filled_price,
                 dedupe_key, filled_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(&fill.broker_order_id)
        .bind(&fill.client_order_id)
        .bind(fill.filled_qty.to_string())
        .bind(fill.filled_price.to_string())
        .bind(&fill.dedupe_key)
        .bind(fill.filled_at.to_rfc3339())
        .execute(&self.database.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_position(&self, symbol: &str) -> Result<Option<PositionTracking>, StoreError> {
        let row: Option<PositionRow> = sqlx::query_as(
            r#"
            SELECT symbol, quantity, entry_price, atr_value, trailing_stop_price,
                   last_update_at, pending_exit
            FROM position_tracking WHERE symbol = $1
            "#,
        )
        .bind(symbol)
        .fetch_optional(&self.database.pool)
        .await?;
        row.map(position_from_row).transpose()
    }

    async fn all_positions(&self) -> Result<Vec<PositionTracking>, StoreError> {
        let rows: Vec<PositionRow> = sqlx::query_as(
            r#"
            SELECT symbol, quantity, entry_price, atr_value, trailing_stop_price,
                   last_update_at, pending_exit
            FROM position_tracking ORDER BY symbol
            "#,
        )
        .fetch_all(&self.database.pool)
        .await?;
        rows.into_iter().map(position_from_row).collect()
    }

    async fn upsert_position(&self, position: &PositionTracking) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO position_tracking
                (symbol, quantity, entry_price, atr_value, trailing_stop_price,
                 last_update_at, pending_exit)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT(symbol) DO UPDATE SET
                quantity = excluded.quantity,
                entry_price = excluded.entry_price,
                atr_value = excluded.atr_value,
                trailing_stop_price = excluded.trailing_stop_price,
                last_update_at = excluded.last_update_at,
                pending_exit = excluded.pending_exit
            "#,
        )
        .bind(&position.symbol)
        .bind(position.quantity.to_string())
        .bind(position.entry_price.to_string())
        .bind(position.atr_value)
        .bind(position.trailing_stop_price.to_string())
        .bind(position.last_update_at.to_rfc3339())
        .bind(position.pending_exit as i64)
        .execute(&self.database.pool)
        .await?;
        Ok(())
    }

    async fn delete_position(&self, symbol: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM position_tracking WHERE symbol = $1")
            .bind(symbol)
            .execute(&self.database.pool)
            .await?;
        Ok(())
    }

    async fn set_pending_exit(&self, symbol: &str, pending: bool) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE position_tracking SET pending_exit = $2, last_update_at = $3 WHERE symbol = $1",
        )
        .bind(symbol)
        .bind(pending as i64)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.database.pool)
        .await?;
        Ok(())
    }

    async fn record_exit_attempt(
        &self,
        symbol: &str,
        now: DateTime<Utc>,
        base_seconds: u64,
        max_seconds: u64,
    ) -> Result<u32, StoreError> {
        let mut tx = self.database.pool.begin().await?;

        let row: Option<(i64,)> =
            sqlx::query_as("SELECT attempt_count FROM exit_attempts WHERE symbol = $1")
                .bind(symbol)
                .fetch_optional(&mut *tx)
                .await?;
        let count = row.map(|(c,)| c as u32).unwrap_or(0) + 1;
        let delay = backoff_delay_seconds(count, base_seconds, max_seconds);
        let next_retry = now + chrono::Duration::seconds(delay as i64);

        sqlx::query(
            r#"
            INSERT INTO exit_attempts (symbol, attempt_count, last_attempt_at, next_retry_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT(symbol) DO UPDATE SET
                attempt_count = excluded.attempt_count,
                last_attempt_at = excluded.last_attempt_at,
                next_retry_at = excluded.next_retry_at
            "#,
        )
        .bind(symbol)
        .bind(count as i64)
        .bind(now.to_rfc3339())
        .bind(next_retry.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(count)
    }

    async fn exit_backoff_seconds(
        &self,
        symbol: &str,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT next_retry_at FROM exit_attempts WHERE symbol = $1")
                .bind(symbol)
                .fetch_optional(&self.database.pool)
                .await?;
        match row {
            None => Ok(0),
            Some((raw,)) => {
                let next_retry = parse_timestamp("exit_attempts.next_retry_at", &raw)?;
                Ok((next_retry - now).num_seconds().max(0) as u64)
            }
        }
    }

    async fn clear_exit_attempts(&self, symbol: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM exit_attempts WHERE symbol = $1")
            .bind(symbol)
            .execute(&self.database.pool)
            .await?;
        Ok(())
    }

    async fn circuit_breaker_count(&self) -> Result<u32, StoreError> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT count FROM circuit_breaker WHERE id = 1")
                .fetch_optional(&self.database.pool)
                .await?;
        Ok(row.map(|(c,)| c as u32).unwrap_or(0))
    }

    async fn save_circuit_breaker_count(&self, count: u32) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO circuit_breaker (id, count, last_reset_at)
            VALUES (1, $1, $2)
            ON CONFLICT(id) DO UPDATE SET
                count = excluded.count,
                last_reset_at = excluded.last_reset_at
            "#,
        )
        .bind(count as i64)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.database.pool)
        .await?;
        Ok(())
    }

    async fn drawdown_state(&self) -> Result<Option<DrawdownState>, StoreError> {
        let row: Option<(String, String, f64, String, String, i64)> = sqlx::query_as(
            r#"
            SELECT level, peak_equity, current_drawdown_pct, last_updated,
                   last_peak_reset_time, manual_recovery_requested
            FROM drawdown_state WHERE id = 1
            "#,
        )
        .fetch_optional(&self.database.pool)
        .await?;

        row.map(|(level, peak, pct, updated, reset, manual)| {
            Ok(DrawdownState {
                level: level.parse::<DrawdownLevel>().map_err(|reason| {
                    StoreError::Corrupt {
                        key: "drawdown_state.level".to_string(),
                        reason,
                    }
                })?,
                peak_equity: parse_decimal("drawdown_state.peak_equity", &peak)?,
                current_drawdown_pct: pct,
                last_updated: parse_timestamp("drawdown_state.last_updated", &updated)?,
                last_peak_reset_time: parse_timestamp(
                    "drawdown_state.last_peak_reset_time",
                    &reset,
                )?,
                manual_recovery_requested: manual != 0,
            })
        })
        .transpose()
    }

    async fn save_drawdown_state(&self, state: &DrawdownState) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO drawdown_state
                (id, level, peak_equity, current_drawdown_pct, last_updated,
                 last_peak_reset_time, manual_recovery_requested)
            VALUES (1, $1, $2, $3, $4, $5, $6)
            ON CONFLICT(id) DO UPDATE SET
                level = excluded.level,
                peak_equity = excluded.peak_equity,
                current_drawdown_pct = excluded.current_drawdown_pct,
                last_updated = excluded.last_updated,
                last_peak_reset_time = excluded.last_peak_reset_time,
                manual_recovery_requested = excluded.manual_recovery_requested
            "#,
        )
        .bind(state.level.to_string())
        .bind(state.peak_equity.to_string())
        .bind(state.current_drawdown_pct)
        .bind(state.last_updated.to_rfc3339())
        .bind(state.last_peak_reset_time.to_rfc3339())
        .bind(state.manual_recovery_requested as i64)
        .execute(&self.database.pool)
        .await?;
        Ok(())
    }

    async fn insert_equity_snapshot(
        &self,
        timestamp: DateTime<Utc>,
        equity: Decimal,
    ) -> Result<(), StoreError> {
        sqlx::query("INSERT OR IGNORE INTO equity_curve (timestamp, equity) VALUES ($1, $2)")
            .bind(timestamp.to_rfc3339())
            .bind(equity.to_string())
            .execute(&self.database.pool)
            .await?;
        Ok(())
    }

    async fn equity_curve_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<(DateTime<Utc>, Decimal)>, StoreError> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT timestamp, equity FROM equity_curve WHERE timestamp >= $1 ORDER BY timestamp",
        )
        .bind(since.to_rfc3339())
        .fetch_all(&self.database.pool)
        .await?;
        rows.into_iter()
            .map(|(ts, eq)| {
                Ok((
                    parse_timestamp("equity_curve.timestamp", &ts)?,
                    parse_decimal("equity_curve.equity", &eq)?,
                ))
            })
            .collect()
    }

    async fn insert_bar(&self, bar: &Bar) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO bars
                (symbol, timeframe, timestamp, open, high, low, close, volume)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(&bar.symbol)
        .bind(&bar.timeframe)
        .bind(bar.timestamp.to_rfc3339())
        .bind(bar.open.to_string())
        .bind(bar.high.to_string())
        .bind(bar.low.to_string())
        .bind(bar.close.to_string())
        .bind(bar.volume.to_string())
        .execute(&self.database.pool)
        .await?;
        Ok(())
    }

    async fn recent_bars(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: u32,
    ) -> Result<Vec<Bar>, StoreError> {
        let rows: Vec<(String, String, String, String, String, String)> = sqlx::query_as(
            r#"
            SELECT timestamp, open, high, low, close, volume
            FROM bars WHERE symbol = $1 AND timeframe = $2
            ORDER BY timestamp DESC LIMIT $3
            "#,
        )
        .bind(symbol)
        .bind(timeframe)
        .bind(limit as i64)
        .fetch_all(&self.database.pool)
        .await?;

        let mut bars = rows
            .into_iter()
            .map(|(ts, open, high, low, close, volume)| {
                Ok(Bar {
                    symbol: symbol.to_string(),
                    timeframe: timeframe.to_string(),
                    timestamp: parse_timestamp("bars.timestamp", &ts)?,
                    open: parse_decimal("bars.open", &open)?,
                    high: parse_decimal("bars.high", &high)?,
                    low: parse_decimal("bars.low", &low)?,
                    close: parse_decimal("bars.close", &close)?,
                    volume: parse_decimal("bars.volume", &volume)?,
                })
            })
            .collect::<Result<Vec<_>, StoreError>>()?;
        bars.reverse();
        Ok(bars)
    }

    async fn insert_reconciliation_report(
        &self,
        timestamp: DateTime<Utc>,
        report_json: &str,
    ) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO reconciliation_reports (timestamp, report_json) VALUES ($1, $2)")
            .bind(timestamp.to_rfc3339())
            .bind(report_json)
            .execute(&self.database.pool)
            .await?;
        Ok(())
    }
}
