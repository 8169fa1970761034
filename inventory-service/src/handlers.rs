use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use shared::{
    respond, Connection, InventoryItemReply, Message, MessageHandler, NewInventoryItem, Query,
    ReservationResult, ValidateOrder,
};
use tracing::{debug, info, warn};

use crate::models::NewStockItem;
use crate::store::{Reservation, StockStore};

/// Serves `order_validate`: reserves stock for one order and replies with the
/// outcome.
pub struct OrderValidateHandler {
    store: Arc<dyn StockStore>,
}

impl OrderValidateHandler {
    pub fn new(store: Arc<dyn StockStore>) -> Self {
        Self { store }
    }

    pub async fn validate(&self, request: &ValidateOrder) -> Result<ReservationResult> {
        if request.quantity <= 0 {
            return Ok(ReservationResult::rejected(
                request.order_id,
                "Quantity must be positive",
            ));
        }

        let result = match self
            .store
            .reserve(request.product_id, request.quantity)
            .await?
        {
            Reservation::Reserved { remaining } => {
                info!(
                    "Reserved {} of product {} for order {}, {} left",
                    request.quantity, request.product_id, request.order_id, remaining
                );
                ReservationResult::reserved(request.order_id, remaining)
            }
            Reservation::NotFound => {
                warn!("Product {} not found for order {}", request.product_id, request.order_id);
                ReservationResult::rejected(request.order_id, "Product not found")
            }
            Reservation::InsufficientStock { available } => {
                warn!(
                    "Not enough inventory for order {}: requested {}, available {}",
                    request.order_id, request.quantity, available
                );
                ReservationResult::rejected(request.order_id, "Not enough inventory")
            }
        };
        Ok(result)
    }
}

#[async_trait]
impl MessageHandler for OrderValidateHandler {
    async fn handle(&self, message: Message, channel: Arc<dyn Connection>) -> Result<()> {
        let request: ValidateOrder =
            serde_json::from_slice(&message.body).context("Malformed order_validate payload")?;
        info!("Validating order {}", request.order_id);

        let result = self.validate(&request).await?;
        if !respond(channel.as_ref(), &message, &result).await? {
            warn!("order_validate for {} had no reply address, result dropped", request.order_id);
        }
        Ok(())
    }
}

/// Serves `inventory_new_item`: stores a new product and replies with the
/// stored record.
pub struct NewItemHandler {
    store: Arc<dyn StockStore>,
}

impl NewItemHandler {
    pub fn new(store: Arc<dyn StockStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl MessageHandler for NewItemHandler {
    async fn handle(&self, message: Message, channel: Arc<dyn Connection>) -> Result<()> {
        let item: NewInventoryItem =
            serde_json::from_slice(&message.body).context("Malformed inventory_new_item payload")?;
        anyhow::ensure!(item.quantity >= 0, "Quantity must not be negative");

        let record = self
            .store
            .save(NewStockItem {
                quantity: item.quantity,
                description: item.description,
            })
            .await?;
        info!("Stored product {} with quantity {}", record.product_id, record.quantity_available);

        let reply = InventoryItemReply::from(record);
        if !respond(channel.as_ref(), &message, &reply).await? {
            warn!("inventory_new_item for product {} had no reply address", reply.id);
        }
        Ok(())
    }
}

/// Serves `inventory_query`: product lookups for the gateway's read routes.
pub struct InventoryQueryHandler {
    store: Arc<dyn StockStore>,
}

impl InventoryQueryHandler {
    pub fn new(store: Arc<dyn StockStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl MessageHandler for InventoryQueryHandler {
    async fn handle(&self, message: Message, channel: Arc<dyn Connection>) -> Result<()> {
        let query: Query =
            serde_json::from_slice(&message.body).context("Malformed inventory_query payload")?;
        debug!("Inventory query: {:?}", query);

        match query {
            Query::Get { id } => {
                let item: Option<InventoryItemReply> = self.store.get(id).await?.map(Into::into);
                respond(channel.as_ref(), &message, &item).await?;
            }
            Query::List { limit } => {
                let items: Vec<InventoryItemReply> = self
                    .store
                    .list(Query::list_limit(limit))
                    .await?
                    .into_iter()
                    .map(Into::into)
                    .collect();
                respond(channel.as_ref(), &message, &items).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStockStore;
    use uuid::Uuid;

    fn request(product_id: i32, quantity: i32) -> ValidateOrder {
        ValidateOrder {
            order_id: Uuid::new_v4(),
            product_id,
            quantity,
        }
    }

    #[tokio::test]
    async fn test_validate_messages() {
        let store = InMemoryStockStore::new();
        let product = store.stock(2).await;
        let handler = OrderValidateHandler::new(Arc::new(store.clone()));

        let missing = handler.validate(&request(product + 1, 1)).await.unwrap();
        assert!(!missing.success);
        assert_eq!(missing.message, "Product not found");

        let short = handler.validate(&request(product, 3)).await.unwrap();
        assert!(!short.success);
        assert_eq!(short.message, "Not enough inventory");

        let ok = request(product, 2);
        let reserved = handler.validate(&ok).await.unwrap();
        assert!(reserved.success);
        assert_eq!(reserved.order_id, ok.order_id);
        assert_eq!(store.quantity(product).await, Some(0));
    }

    #[tokio::test]
    async fn test_non_positive_quantity_leaves_stock_alone() {
        let store = InMemoryStockStore::new();
        let product = store.stock(5).await;
        let handler = OrderValidateHandler::new(Arc::new(store.clone()));

        let result = handler.validate(&request(product, -3)).await.unwrap();
        assert!(!result.success);
        assert_eq!(store.quantity(product).await, Some(5));
    }
}
