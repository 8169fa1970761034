//! Stock storage. The only shared mutable state in the system lives here,
//! so every reservation is a single check-and-decrement under a lock.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use diesel::prelude::*;
use diesel_async::{pooled_connection::bb8::Pool, AsyncConnection, AsyncPgConnection, RunQueryDsl};
use tokio::sync::Mutex;

use crate::models::{NewStockItem, StockRecord};
use crate::schema::inventory;

type DbPool = Pool<AsyncPgConnection>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    Reserved { remaining: i32 },
    NotFound,
    InsufficientStock { available: i32 },
}

#[async_trait]
pub trait StockStore: Send + Sync {
    async fn get(&self, product_id: i32) -> Result<Option<StockRecord>>;

    async fn save(&self, item: NewStockItem) -> Result<StockRecord>;

    /// Up to `limit` products, lowest id first.
    async fn list(&self, limit: i64) -> Result<Vec<StockRecord>>;

    /// Decrements stock by `quantity` only if at least that much is
    /// available; otherwise leaves the record untouched.
    async fn reserve(&self, product_id: i32, quantity: i32) -> Result<Reservation>;
}

pub struct PgStockStore {
    pool: DbPool,
}

impl PgStockStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StockStore for PgStockStore {
    async fn get(&self, product_id: i32) -> Result<Option<StockRecord>> {
        let mut conn = self.pool.get().await?;
        let record = inventory::table
            .find(product_id)
            .select(StockRecord::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        Ok(record)
    }

    async fn save(&self, item: NewStockItem) -> Result<StockRecord> {
        let mut conn = self.pool.get().await?;
        let record = diesel::insert_into(inventory::table)
            .values(&item)
            .returning(StockRecord::as_returning())
            .get_result(&mut conn)
            .await?;
        Ok(record)
    }

    async fn list(&self, limit: i64) -> Result<Vec<StockRecord>> {
        let mut conn = self.pool.get().await?;
        let records = inventory::table
            .order(inventory::id.asc())
            .limit(limit)
            .select(StockRecord::as_select())
            .load(&mut conn)
            .await?;
        Ok(records)
    }

    async fn reserve(&self, product_id: i32, quantity: i32) -> Result<Reservation> {
        let mut conn = self.pool.get().await?;

        let reservation = conn
            .transaction::<_, anyhow::Error, _>(|conn| {
                Box::pin(async move {
                    // FOR UPDATE keeps a concurrent reservation from reading
                    // the same pre-decrement quantity.
                    let record = inventory::table
                        .find(product_id)
                        .select(StockRecord::as_select())
                        .for_update()
                        .first(conn)
                        .await
                        .optional()?;

                    let Some(record) = record else {
                        return Ok(Reservation::NotFound);
                    };
                    if record.quantity_available < quantity {
                        return Ok(Reservation::InsufficientStock {
                            available: record.quantity_available,
                        });
                    }

                    let remaining = diesel::update(inventory::table.find(product_id))
                        .set(inventory::quantity.eq(inventory::quantity - quantity))
                        .returning(inventory::quantity)
                        .get_result::<i32>(conn)
                        .await?;
                    Ok(Reservation::Reserved { remaining })
                })
            })
            .await?;

        Ok(reservation)
    }
}

#[derive(Debug, Default)]
struct InMemoryStock {
    items: BTreeMap<i32, StockRecord>,
    next_id: i32,
}

/// In-memory stock store for tests and local runs.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStockStore {
    state: Arc<Mutex<InMemoryStock>>,
}

impl InMemoryStockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a product with `quantity` in stock and returns its id.
    pub async fn stock(&self, quantity: i32) -> i32 {
        let mut state = self.state.lock().await;
        Self::insert(&mut state, quantity, None).product_id
    }

    pub async fn quantity(&self, product_id: i32) -> Option<i32> {
        self.state
            .lock()
            .await
            .items
            .get(&product_id)
            .map(|record| record.quantity_available)
    }

    fn insert(state: &mut InMemoryStock, quantity: i32, description: Option<String>) -> StockRecord {
        state.next_id += 1;
        let record = StockRecord {
            product_id: state.next_id,
            quantity_available: quantity,
            description,
            created_at: Utc::now(),
        };
        state.items.insert(record.product_id, record.clone());
        record
    }
}

#[async_trait]
impl StockStore for InMemoryStockStore {
    async fn get(&self, product_id: i32) -> Result<Option<StockRecord>> {
        Ok(self.state.lock().await.items.get(&product_id).cloned())
    }

    async fn save(&self, item: NewStockItem) -> Result<StockRecord> {
        let mut state = self.state.lock().await;
        Ok(Self::insert(&mut state, item.quantity, item.description))
    }

    async fn list(&self, limit: i64) -> Result<Vec<StockRecord>> {
        let state = self.state.lock().await;
        Ok(state.items.values().take(limit as usize).cloned().collect())
    }

    async fn reserve(&self, product_id: i32, quantity: i32) -> Result<Reservation> {
        let mut state = self.state.lock().await;
        let Some(record) = state.items.get_mut(&product_id) else {
            return Ok(Reservation::NotFound);
        };
        if record.quantity_available < quantity {
            return Ok(Reservation::InsufficientStock {
                available: record.quantity_available,
            });
        }
        record.quantity_available -= quantity;
        Ok(Reservation::Reserved {
            remaining: record.quantity_available,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reserve_then_insufficient() {
        let store = InMemoryStockStore::new();
        let p1 = store.stock(10).await;

        assert_eq!(
            store.reserve(p1, 5).await.unwrap(),
            Reservation::Reserved { remaining: 5 }
        );
        assert_eq!(store.quantity(p1).await, Some(5));

        assert_eq!(
            store.reserve(p1, 6).await.unwrap(),
            Reservation::InsufficientStock { available: 5 }
        );
        assert_eq!(store.quantity(p1).await, Some(5));
    }

    #[tokio::test]
    async fn test_unknown_product() {
        let store = InMemoryStockStore::new();
        assert_eq!(store.reserve(99, 1).await.unwrap(), Reservation::NotFound);
        assert!(store.get(99).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_exact_quantity_drains_stock() {
        let store = InMemoryStockStore::new();
        let p = store.stock(4).await;
        assert_eq!(
            store.reserve(p, 4).await.unwrap(),
            Reservation::Reserved { remaining: 0 }
        );
        assert_eq!(
            store.reserve(p, 1).await.unwrap(),
            Reservation::InsufficientStock { available: 0 }
        );
    }

    #[tokio::test]
    async fn test_save_assigns_sequential_ids() {
        let store = InMemoryStockStore::new();
        let a = store
            .save(NewStockItem {
                quantity: 3,
                description: Some("bolts".into()),
            })
            .await
            .unwrap();
        let b = store
            .save(NewStockItem {
                quantity: 1,
                description: None,
            })
            .await
            .unwrap();
        assert_eq!((a.product_id, b.product_id), (1, 2));
        assert_eq!(store.get(a.product_id).await.unwrap(), Some(a));
    }

    #[tokio::test]
    async fn test_list_in_id_order() {
        let store = InMemoryStockStore::new();
        let first = store.stock(1).await;
        let second = store.stock(2).await;
        store.stock(3).await;

        let listed = store.list(2).await.unwrap();
        let ids: Vec<i32> = listed.iter().map(|r| r.product_id).collect();
        assert_eq!(ids, vec![first, second]);
    }
}
