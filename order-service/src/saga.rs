//! The order validation saga: reserve stock through the inventory service,
//! then persist the order. There is no compensating step; a failed persist
//! after a successful reservation is reported as a compensation gap.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use shared::{queues, OrderOutcome, OrderReply, OrderRequest, ReservationResult, RpcError, SharedRpcClient, ValidateOrder};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::models::NewOrder;
use crate::store::OrderStore;

pub const VALIDATION_UNKNOWN_MESSAGE: &str =
    "Inventory validation is still processing, order outcome unknown";
pub const PERSIST_FAILED_MESSAGE: &str = "Order could not be saved";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SagaState {
    Received,
    Reserving,
    Reserved,
    ReservationFailed,
    ValidationUnknown,
    Persisting,
    PersistFailed,
    Confirmed,
    Rejected,
    RejectedCompensationGap,
}

impl fmt::Display for SagaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Saga outcomes that leave the system in a state needing an operator.
#[derive(Debug, Error)]
pub enum SagaError {
    #[error("inventory validation {validation_id} did not complete: {source}")]
    ValidationUnknown {
        validation_id: Uuid,
        #[source]
        source: RpcError,
    },

    #[error(
        "reserved {quantity} of product {product_id} (validation {validation_id}) but the order was not saved: {source}"
    )]
    CompensationGap {
        validation_id: Uuid,
        product_id: i32,
        quantity: i32,
        #[source]
        source: anyhow::Error,
    },
}

/// The inventory side of the saga.
#[async_trait]
pub trait StockReserver: Send + Sync {
    async fn reserve(&self, request: &ValidateOrder) -> Result<ReservationResult, RpcError>;
}

/// Reserves stock by calling `order_validate` over the broker.
pub struct RpcInventory {
    rpc: Arc<SharedRpcClient>,
    timeout: Duration,
}

impl RpcInventory {
    pub fn new(rpc: Arc<SharedRpcClient>, timeout: Duration) -> Self {
        Self { rpc, timeout }
    }
}

#[async_trait]
impl StockReserver for RpcInventory {
    async fn reserve(&self, request: &ValidateOrder) -> Result<ReservationResult, RpcError> {
        self.rpc
            .call_json(queues::ORDER_VALIDATE, request, self.timeout)
            .await
    }
}

#[derive(Debug)]
pub struct SagaOutcome {
    pub state: SagaState,
    pub reply: OrderReply,
    /// Set when the inbound message must be dead-lettered after replying.
    pub failure: Option<SagaError>,
}

struct SagaRun {
    validation_id: Uuid,
    state: SagaState,
}

impl SagaRun {
    fn advance(&mut self, next: SagaState) {
        debug!(validation_id = %self.validation_id, from = %self.state, to = %next, "Saga transition");
        self.state = next;
    }

    fn finish(mut self, last: SagaState, reply: OrderReply, failure: Option<SagaError>) -> SagaOutcome {
        self.advance(last);
        SagaOutcome {
            state: self.state,
            reply,
            failure,
        }
    }
}

pub struct OrderSaga {
    inventory: Arc<dyn StockReserver>,
    orders: Arc<dyn OrderStore>,
}

impl OrderSaga {
    pub fn new(inventory: Arc<dyn StockReserver>, orders: Arc<dyn OrderStore>) -> Self {
        Self { inventory, orders }
    }

    pub async fn execute(&self, request: &OrderRequest) -> SagaOutcome {
        let mut run = SagaRun {
            validation_id: Uuid::new_v4(),
            state: SagaState::Received,
        };

        if request.quantity <= 0 {
            return run.finish(
                SagaState::Rejected,
                OrderReply::rejected("Quantity must be positive"),
                None,
            );
        }

        run.advance(SagaState::Reserving);
        let validate = ValidateOrder {
            order_id: run.validation_id,
            product_id: request.product_id,
            quantity: request.quantity,
        };
        let reservation = match self.inventory.reserve(&validate).await {
            Ok(reservation) => reservation,
            Err(e) => {
                warn!(
                    "Inventory validation {} for product {} failed: {}",
                    run.validation_id, request.product_id, e
                );
                let failure = SagaError::ValidationUnknown {
                    validation_id: run.validation_id,
                    source: e,
                };
                return run.finish(
                    SagaState::ValidationUnknown,
                    OrderReply::unknown(VALIDATION_UNKNOWN_MESSAGE),
                    Some(failure),
                );
            }
        };

        if !reservation.success {
            run.advance(SagaState::ReservationFailed);
            info!(
                "Order for product {} rejected: {}",
                request.product_id, reservation.message
            );
            return run.finish(
                SagaState::Rejected,
                OrderReply::rejected(reservation.message),
                None,
            );
        }

        run.advance(SagaState::Reserved);
        run.advance(SagaState::Persisting);
        let order = NewOrder::confirmed(request.user_id, request.product_id, request.quantity);
        match self.orders.save(order).await {
            Ok(order) => {
                info!("Order {} confirmed for user {}", order.id, order.user_id);
                run.finish(
                    SagaState::Confirmed,
                    OrderReply::confirmed(order.id, order.created_at),
                    None,
                )
            }
            Err(e) => {
                run.advance(SagaState::PersistFailed);
                error!(
                    target: "compensation_gap",
                    validation_id = %run.validation_id,
                    product_id = request.product_id,
                    quantity = request.quantity,
                    user_id = request.user_id,
                    "Stock reserved but order not saved: {e:#}"
                );
                let failure = SagaError::CompensationGap {
                    validation_id: run.validation_id,
                    product_id: request.product_id,
                    quantity: request.quantity,
                    source: e,
                };
                run.finish(
                    SagaState::RejectedCompensationGap,
                    OrderReply::failed(PERSIST_FAILED_MESSAGE),
                    Some(failure),
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryOrderStore;
    use std::sync::Mutex;

    /// Replies from a fixed script and remembers what it was asked.
    struct Scripted {
        reply: fn(&ValidateOrder) -> Result<ReservationResult, RpcError>,
        seen: Mutex<Vec<ValidateOrder>>,
    }

    #[async_trait]
    impl StockReserver for Scripted {
        async fn reserve(&self, request: &ValidateOrder) -> Result<ReservationResult, RpcError> {
            self.seen.lock().unwrap().push(request.clone());
            (self.reply)(request)
        }
    }

    fn saga(
        reply: fn(&ValidateOrder) -> Result<ReservationResult, RpcError>,
    ) -> (OrderSaga, Arc<Scripted>, InMemoryOrderStore) {
        let inventory = Arc::new(Scripted {
            reply,
            seen: Mutex::new(Vec::new()),
        });
        let orders = InMemoryOrderStore::new();
        let saga = OrderSaga::new(inventory.clone(), Arc::new(orders.clone()));
        (saga, inventory, orders)
    }

    fn order(quantity: i32) -> OrderRequest {
        OrderRequest {
            user_id: 1,
            product_id: 9,
            quantity,
        }
    }

    #[tokio::test]
    async fn test_each_run_uses_a_fresh_validation_id() {
        let (saga, inventory, _) = saga(|r| Ok(ReservationResult::reserved(r.order_id, 1)));
        saga.execute(&order(1)).await;
        saga.execute(&order(1)).await;

        let seen = inventory.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_ne!(seen[0].order_id, seen[1].order_id);
    }

    #[tokio::test]
    async fn test_timeout_is_validation_unknown() {
        let (saga, _, orders) = saga(|_| Err(RpcError::TimedOut(Duration::from_secs(10))));
        let outcome = saga.execute(&order(2)).await;

        assert_eq!(outcome.state, SagaState::ValidationUnknown);
        assert_eq!(outcome.reply.status, OrderOutcome::Unknown);
        assert_eq!(outcome.reply.message, VALIDATION_UNKNOWN_MESSAGE);
        assert!(matches!(
            outcome.failure,
            Some(SagaError::ValidationUnknown { .. })
        ));
        assert!(orders.all().await.is_empty());
    }

    #[tokio::test]
    async fn test_rejection_carries_inventory_message() {
        let (saga, _, orders) =
            saga(|r| Ok(ReservationResult::rejected(r.order_id, "Product not found")));
        let outcome = saga.execute(&order(2)).await;

        assert_eq!(outcome.state, SagaState::Rejected);
        assert!(!outcome.reply.success);
        assert_eq!(outcome.reply.status, OrderOutcome::Rejected);
        assert_eq!(outcome.reply.message, "Product not found");
        assert!(outcome.failure.is_none());
        assert!(orders.all().await.is_empty());
    }

    #[tokio::test]
    async fn test_persist_failure_is_compensation_gap() {
        let (saga, _, orders) = saga(|r| Ok(ReservationResult::reserved(r.order_id, 0)));
        orders.fail_saves(true);
        let outcome = saga.execute(&order(2)).await;

        assert_eq!(outcome.state, SagaState::RejectedCompensationGap);
        assert_eq!(outcome.reply.status, OrderOutcome::Failed);
        assert_eq!(outcome.reply.message, PERSIST_FAILED_MESSAGE);
        match outcome.failure {
            Some(SagaError::CompensationGap {
                product_id,
                quantity,
                ..
            }) => assert_eq!((product_id, quantity), (9, 2)),
            other => panic!("expected compensation gap, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_non_positive_quantity_never_reserves() {
        let (saga, inventory, _) = saga(|r| Ok(ReservationResult::reserved(r.order_id, 0)));
        let outcome = saga.execute(&order(0)).await;

        assert_eq!(outcome.state, SagaState::Rejected);
        assert!(inventory.seen.lock().unwrap().is_empty());
    }
}
