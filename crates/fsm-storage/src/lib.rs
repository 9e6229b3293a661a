//! Persistence collaborators for FSM: the `ServiceStore` contract, a Postgres
//! implementation, and an in-memory store for tests.

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fsm_core::{Frequency, ServiceKind, ServiceOrder, ServiceSchedule};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres, Row};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

pub const CRATE_NAME: &str = "fsm-storage";

/// Advisory lock key for the dedup pass, shared by every process pointed at
/// the same database.
const DEDUP_PASS_LOCK_KEY: i64 = 0x46534d_0001;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable while {context}")]
    Unavailable {
        context: String,
        #[source]
        source: Option<sqlx::Error>,
    },
    #[error("backend returned an unusable row: {0}")]
    Backend(String),
}

impl StoreError {
    fn unavailable(context: impl Into<String>, source: sqlx::Error) -> Self {
        Self::Unavailable {
            context: context.into(),
            source: Some(source),
        }
    }

    /// Synthetic failure with no transport error behind it; used by the
    /// in-memory store's fault injection.
    pub fn injected(context: impl Into<String>) -> Self {
        Self::Unavailable {
            context: context.into(),
            source: None,
        }
    }
}

/// Persistence boundary of the maintenance logic. Handed to the pass by the
/// caller; the store owns its own connection lifecycle.
#[async_trait]
pub trait ServiceStore: Send + Sync {
    /// Every `Scheduled` order with an owning schedule, ordered by
    /// `(schedule_id, scheduled_for, created_at)` ascending. The ordering is
    /// part of the contract: the dedup pass keeps the first member of each
    /// slot group without re-sorting.
    async fn list_scheduled_orders(&self) -> Result<Vec<ServiceOrder>, StoreError>;

    async fn list_active_schedules(&self) -> Result<Vec<ServiceSchedule>, StoreError>;

    /// The schedule's `Scheduled` order with the greatest `scheduled_for`,
    /// if any.
    async fn latest_scheduled_order(
        &self,
        schedule_id: Uuid,
    ) -> Result<Option<ServiceOrder>, StoreError>;

    /// Delete one order. `Ok(false)` means the row was already gone, which is
    /// never a hard failure.
    async fn delete_order(&self, id: Uuid) -> Result<bool, StoreError>;

    async fn update_schedule_runs(
        &self,
        id: Uuid,
        last_run_at: DateTime<Utc>,
        next_run_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Cluster-wide mutual exclusion for the dedup pass. `Ok(false)` means
    /// another pass holds the lock.
    async fn try_acquire_pass_lock(&self) -> Result<bool, StoreError>;

    async fn release_pass_lock(&self) -> Result<(), StoreError>;
}

/// Postgres-backed store. The advisory lock pins one pooled connection for
/// the duration of the pass, since `pg_advisory_unlock` must run on the
/// session that took the lock.
pub struct PgServiceStore {
    pool: PgPool,
    lock_conn: tokio::sync::Mutex<Option<PoolConnection<Postgres>>>,
}

impl PgServiceStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(|err| StoreError::unavailable("connecting to postgres", err))?;
        Ok(Self {
            pool,
            lock_conn: tokio::sync::Mutex::new(None),
        })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        info!("applying embedded migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|err| StoreError::Backend(err.to_string()))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl ServiceStore for PgServiceStore {
    async fn list_scheduled_orders(&self) -> Result<Vec<ServiceOrder>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, schedule_id, scheduled_for, start_time, kind, created_at
              FROM service_orders
             WHERE kind = 'SCHEDULED'
               AND schedule_id IS NOT NULL
             ORDER BY schedule_id, scheduled_for, created_at
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|err| StoreError::unavailable("listing scheduled orders", err))?;
        rows.iter().map(order_from_row).collect()
    }

    async fn list_active_schedules(&self) -> Result<Vec<ServiceSchedule>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, frequency, custom_interval_days, day_of_month,
                   last_run_at, next_run_at, active
              FROM service_schedules
             WHERE active
             ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|err| StoreError::unavailable("listing active schedules", err))?;
        rows.iter().map(schedule_from_row).collect()
    }

    async fn latest_scheduled_order(
        &self,
        schedule_id: Uuid,
    ) -> Result<Option<ServiceOrder>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, schedule_id, scheduled_for, start_time, kind, created_at
              FROM service_orders
             WHERE schedule_id = $1
               AND kind = 'SCHEDULED'
             ORDER BY scheduled_for DESC, created_at DESC
             LIMIT 1
            "#,
        )
        .bind(schedule_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| StoreError::unavailable("finding latest scheduled order", err))?;
        row.as_ref().map(order_from_row).transpose()
    }

    async fn delete_order(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM service_orders WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|err| StoreError::unavailable("deleting service order", err))?;
        Ok(result.rows_affected() > 0)
    }

    async fn update_schedule_runs(
        &self,
        id: Uuid,
        last_run_at: DateTime<Utc>,
        next_run_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE service_schedules
               SET last_run_at = $2,
                   next_run_at = $3
             WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(last_run_at)
        .bind(next_run_at)
        .execute(&self.pool)
        .await
        .map_err(|err| StoreError::unavailable("updating schedule run window", err))?;
        Ok(())
    }

    async fn try_acquire_pass_lock(&self) -> Result<bool, StoreError> {
        let mut guard = self.lock_conn.lock().await;
        if guard.is_some() {
            return Ok(false);
        }
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|err| StoreError::unavailable("acquiring lock connection", err))?;
        let row = sqlx::query("SELECT pg_try_advisory_lock($1) AS acquired")
            .bind(DEDUP_PASS_LOCK_KEY)
            .fetch_one(&mut *conn)
            .await
            .map_err(|err| StoreError::unavailable("taking dedup advisory lock", err))?;
        let acquired: bool = row
            .try_get("acquired")
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        if acquired {
            *guard = Some(conn);
        }
        Ok(acquired)
    }

    async fn release_pass_lock(&self) -> Result<(), StoreError> {
        let mut guard = self.lock_conn.lock().await;
        if let Some(mut conn) = guard.take() {
            sqlx::query("SELECT pg_advisory_unlock($1)")
                .bind(DEDUP_PASS_LOCK_KEY)
                .execute(&mut *conn)
                .await
                .map_err(|err| StoreError::unavailable("releasing dedup advisory lock", err))?;
        }
        Ok(())
    }
}

fn order_from_row(row: &PgRow) -> Result<ServiceOrder, StoreError> {
    let kind_tag: String = get(row, "kind")?;
    let kind = ServiceKind::from_tag(&kind_tag)
        .ok_or_else(|| StoreError::Backend(format!("unknown service kind tag `{kind_tag}`")))?;
    Ok(ServiceOrder {
        id: get(row, "id")?,
        schedule_id: get(row, "schedule_id")?,
        scheduled_for: get(row, "scheduled_for")?,
        start_time: get(row, "start_time")?,
        kind,
        created_at: get(row, "created_at")?,
    })
}

fn schedule_from_row(row: &PgRow) -> Result<ServiceSchedule, StoreError> {
    let frequency_tag: String = get(row, "frequency")?;
    let frequency =
        Frequency::from_str(&frequency_tag).map_err(|err| StoreError::Backend(err.to_string()))?;
    Ok(ServiceSchedule {
        id: get(row, "id")?,
        frequency,
        custom_interval_days: opt_u32(get(row, "custom_interval_days")?, "custom_interval_days")?,
        day_of_month: opt_u32(get(row, "day_of_month")?, "day_of_month")?,
        last_run_at: get(row, "last_run_at")?,
        next_run_at: get(row, "next_run_at")?,
        active: get(row, "active")?,
    })
}

fn get<'r, T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>>(
    row: &'r PgRow,
    column: &str,
) -> Result<T, StoreError> {
    row.try_get(column)
        .map_err(|err| StoreError::Backend(format!("column `{column}`: {err}")))
}

fn opt_u32(value: Option<i32>, column: &str) -> Result<Option<u32>, StoreError> {
    value
        .map(|v| {
            u32::try_from(v)
                .map_err(|_| StoreError::Backend(format!("column `{column}`: negative value {v}")))
        })
        .transpose()
}

#[derive(Default)]
struct MemoryInner {
    schedules: Vec<ServiceSchedule>,
    orders: Vec<ServiceOrder>,
    failing_deletes: HashSet<Uuid>,
}

/// In-memory store for tests and local experiments. Sorts on read so it
/// honors the same ordering contract as the Postgres store, and can be told
/// to fail specific deletes to exercise the pass's isolation policy.
#[derive(Default)]
pub struct MemoryServiceStore {
    inner: Mutex<MemoryInner>,
    pass_lock: AtomicBool,
}

impl MemoryServiceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_schedule(&self, schedule: ServiceSchedule) {
        self.inner.lock().expect("store poisoned").schedules.push(schedule);
    }

    pub fn insert_order(&self, order: ServiceOrder) {
        self.inner.lock().expect("store poisoned").orders.push(order);
    }

    /// Make every future `delete_order(id)` fail with `StoreError::Unavailable`.
    pub fn fail_delete(&self, id: Uuid) {
        self.inner
            .lock()
            .expect("store poisoned")
            .failing_deletes
            .insert(id);
    }

    pub fn schedule(&self, id: Uuid) -> Option<ServiceSchedule> {
        self.inner
            .lock()
            .expect("store poisoned")
            .schedules
            .iter()
            .find(|s| s.id == id)
            .cloned()
    }

    pub fn orders(&self) -> Vec<ServiceOrder> {
        self.inner.lock().expect("store poisoned").orders.clone()
    }

    pub fn order_count(&self) -> usize {
        self.inner.lock().expect("store poisoned").orders.len()
    }
}

#[async_trait]
impl ServiceStore for MemoryServiceStore {
    async fn list_scheduled_orders(&self) -> Result<Vec<ServiceOrder>, StoreError> {
        let inner = self.inner.lock().expect("store poisoned");
        let mut orders: Vec<ServiceOrder> = inner
            .orders
            .iter()
            .filter(|o| o.kind == ServiceKind::Scheduled && o.schedule_id.is_some())
            .cloned()
            .collect();
        orders.sort_by_key(|o| (o.schedule_id, o.scheduled_for, o.created_at));
        Ok(orders)
    }

    async fn list_active_schedules(&self) -> Result<Vec<ServiceSchedule>, StoreError> {
        let inner = self.inner.lock().expect("store poisoned");
        Ok(inner
            .schedules
            .iter()
            .filter(|s| s.active)
            .cloned()
            .collect())
    }

    async fn latest_scheduled_order(
        &self,
        schedule_id: Uuid,
    ) -> Result<Option<ServiceOrder>, StoreError> {
        let inner = self.inner.lock().expect("store poisoned");
        Ok(inner
            .orders
            .iter()
            .filter(|o| o.schedule_id == Some(schedule_id) && o.kind == ServiceKind::Scheduled)
            .max_by_key(|o| (o.scheduled_for, o.created_at))
            .cloned())
    }

    async fn delete_order(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().expect("store poisoned");
        if inner.failing_deletes.contains(&id) {
            return Err(StoreError::injected("deleting service order"));
        }
        let before = inner.orders.len();
        inner.orders.retain(|o| o.id != id);
        Ok(inner.orders.len() < before)
    }

    async fn update_schedule_runs(
        &self,
        id: Uuid,
        last_run_at: DateTime<Utc>,
        next_run_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store poisoned");
        if let Some(schedule) = inner.schedules.iter_mut().find(|s| s.id == id) {
            schedule.last_run_at = Some(last_run_at);
            schedule.next_run_at = Some(next_run_at);
        }
        Ok(())
    }

    async fn try_acquire_pass_lock(&self) -> Result<bool, StoreError> {
        Ok(self
            .pass_lock
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok())
    }

    async fn release_pass_lock(&self) -> Result<(), StoreError> {
        self.pass_lock.store(false, Ordering::Release);
        Ok(())
    }
}
