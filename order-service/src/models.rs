use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use shared::OrderSummary;

pub const STATUS_CONFIRMED: &str = "confirmed";

#[derive(Debug, Clone, PartialEq, Eq, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::orders)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Order {
    pub id: i32,
    pub user_id: i32,
    pub product_id: i32,
    pub quantity: i32,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

impl Order {
    pub fn is_confirmed(&self) -> bool {
        self.status == STATUS_CONFIRMED
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::orders)]
pub struct NewOrder {
    pub user_id: i32,
    pub product_id: i32,
    pub quantity: i32,
    pub status: String,
}

impl NewOrder {
    pub fn confirmed(user_id: i32, product_id: i32, quantity: i32) -> Self {
        Self {
            user_id,
            product_id,
            quantity,
            status: STATUS_CONFIRMED.to_string(),
        }
    }
}

impl From<Order> for OrderSummary {
    fn from(order: Order) -> Self {
        Self {
            id: order.id,
            user_id: order.user_id,
            product_id: order.product_id,
            quantity: order.quantity,
            status: order.status,
            created_at: order.created_at,
        }
    }
}
