use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use shared::{
    respond, Connection, Message, MessageHandler, OrderReply, OrderRequest, OrderSummary, Query,
};
use tracing::{debug, info};

use crate::saga::OrderSaga;
use crate::store::OrderStore;

/// Serves `order_created`. Replies whenever the request carries a reply
/// address, then fails the delivery for outcomes an operator has to look at.
pub struct OrderCreatedHandler {
    saga: OrderSaga,
}

impl OrderCreatedHandler {
    pub fn new(saga: OrderSaga) -> Self {
        Self { saga }
    }
}

#[async_trait]
impl MessageHandler for OrderCreatedHandler {
    async fn handle(&self, message: Message, channel: Arc<dyn Connection>) -> Result<()> {
        let request: OrderRequest = match serde_json::from_slice(&message.body) {
            Ok(request) => request,
            Err(e) => {
                respond(channel.as_ref(), &message, &OrderReply::rejected("Invalid order request"))
                    .await?;
                return Err(anyhow::Error::new(e).context("Malformed order_created payload"));
            }
        };
        info!(
            "Received order from user {} for {} of product {}",
            request.user_id, request.quantity, request.product_id
        );

        let outcome = self.saga.execute(&request).await;
        info!("Order saga for user {} ended in {}", request.user_id, outcome.state);

        // Fire-and-forget orders carry no reply address.
        if !respond(channel.as_ref(), &message, &outcome.reply).await? {
            debug!("order_created had no reply address, outcome not reported to caller");
        }

        match outcome.failure {
            Some(failure) => Err(failure.into()),
            None => Ok(()),
        }
    }
}

/// Serves `order_query`: order lookups for the gateway's read routes.
pub struct OrderQueryHandler {
    store: Arc<dyn OrderStore>,
}

impl OrderQueryHandler {
    pub fn new(store: Arc<dyn OrderStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl MessageHandler for OrderQueryHandler {
    async fn handle(&self, message: Message, channel: Arc<dyn Connection>) -> Result<()> {
        let query: Query =
            serde_json::from_slice(&message.body).context("Malformed order_query payload")?;
        debug!("Order query: {:?}", query);

        match query {
            Query::Get { id } => {
                let order: Option<OrderSummary> = self.store.get(id).await?.map(Into::into);
                respond(channel.as_ref(), &message, &order).await?;
            }
            Query::List { limit } => {
                let orders: Vec<OrderSummary> = self
                    .store
                    .list(Query::list_limit(limit))
                    .await?
                    .into_iter()
                    .map(Into::into)
                    .collect();
                respond(channel.as_ref(), &message, &orders).await?;
            }
        }
        Ok(())
    }
}
