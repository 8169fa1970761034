use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use diesel::prelude::*;
use diesel_async::{pooled_connection::bb8::Pool, AsyncPgConnection, RunQueryDsl};
use tokio::sync::Mutex;

use crate::models::{NewOrder, Order};
use crate::schema::orders;

type DbPool = Pool<AsyncPgConnection>;

#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn get(&self, id: i32) -> Result<Option<Order>>;

    async fn save(&self, order: NewOrder) -> Result<Order>;

    /// Up to `limit` orders, lowest id first.
    async fn list(&self, limit: i64) -> Result<Vec<Order>>;
}

pub struct PgOrderStore {
    pool: DbPool,
}

impl PgOrderStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OrderStore for PgOrderStore {
    async fn get(&self, id: i32) -> Result<Option<Order>> {
        let mut conn = self.pool.get().await?;
        let order = orders::table
            .find(id)
            .select(Order::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        Ok(order)
    }

    async fn save(&self, order: NewOrder) -> Result<Order> {
        let mut conn = self.pool.get().await?;
        let saved = diesel::insert_into(orders::table)
            .values(&order)
            .returning(Order::as_returning())
            .get_result(&mut conn)
            .await?;
        Ok(saved)
    }

    async fn list(&self, limit: i64) -> Result<Vec<Order>> {
        let mut conn = self.pool.get().await?;
        let orders = orders::table
            .order(orders::id.asc())
            .limit(limit)
            .select(Order::as_select())
            .load(&mut conn)
            .await?;
        Ok(orders)
    }
}

/// In-memory order store. `fail_saves(true)` makes every save error out,
/// which is how tests reach the persist-failure branch of the saga.
#[derive(Debug, Clone, Default)]
pub struct InMemoryOrderStore {
    orders: Arc<Mutex<Vec<Order>>>,
    failing: Arc<AtomicBool>,
}

impl InMemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_saves(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub async fn all(&self) -> Vec<Order> {
        self.orders.lock().await.clone()
    }
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    async fn get(&self, id: i32) -> Result<Option<Order>> {
        Ok(self.orders.lock().await.iter().find(|o| o.id == id).cloned())
    }

    async fn save(&self, order: NewOrder) -> Result<Order> {
        if AtomicBool::load(&self.failing, Ordering::SeqCst) {
            anyhow::bail!("order store unavailable");
        }
        let mut orders = self.orders.lock().await;
        let saved = Order {
            id: orders.len() as i32 + 1,
            user_id: order.user_id,
            product_id: order.product_id,
            quantity: order.quantity,
            status: order.status,
            created_at: Utc::now(),
        };
        orders.push(saved.clone());
        Ok(saved)
    }

    async fn list(&self, limit: i64) -> Result<Vec<Order>> {
        let orders = self.orders.lock().await;
        Ok(orders.iter().take(limit as usize).cloned().collect())
    }
}
