//! Wire payloads exchanged between the gateway and the services.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod queues {
    pub const ORDER_CREATED: &str = "order_created";
    pub const ORDER_VALIDATE: &str = "order_validate";
    pub const USER_REGISTER: &str = "user_register";
    pub const INVENTORY_NEW_ITEM: &str = "inventory_new_item";
    pub const INVENTORY_QUERY: &str = "inventory_query";
    pub const USER_QUERY: &str = "user_query";
    pub const ORDER_QUERY: &str = "order_query";
}

pub const DEFAULT_LIST_LIMIT: i64 = 100;
pub const MAX_LIST_LIMIT: i64 = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub user_id: i32,
    pub product_id: i32,
    pub quantity: i32,
}

/// Reservation request sent by the order saga. `order_id` is the saga's own
/// validation token, never the gateway's correlation id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidateOrder {
    pub order_id: Uuid,
    pub product_id: i32,
    pub quantity: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationResult {
    pub order_id: Uuid,
    pub success: bool,
    pub message: String,
}

impl ReservationResult {
    pub fn reserved(order_id: Uuid, remaining: i32) -> Self {
        Self {
            order_id,
            success: true,
            message: format!("Inventory updated, {remaining} remaining"),
        }
    }

    pub fn rejected(order_id: Uuid, message: impl Into<String>) -> Self {
        Self {
            order_id,
            success: false,
            message: message.into(),
        }
    }
}

/// How an order request ended, as far as the order service knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderOutcome {
    Confirmed,
    /// Business rejection: bad input, unknown product or not enough stock.
    Rejected,
    /// Inventory never answered; stock may or may not have been reserved.
    Unknown,
    /// Stock was reserved but the order could not be stored.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderReply {
    pub success: bool,
    pub status: OrderOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    pub message: String,
}

impl OrderReply {
    pub fn confirmed(order_id: i32, created_at: DateTime<Utc>) -> Self {
        Self {
            success: true,
            status: OrderOutcome::Confirmed,
            order_id: Some(order_id),
            created_at: Some(created_at),
            message: "Order confirmed".to_string(),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::unsuccessful(OrderOutcome::Rejected, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::unsuccessful(OrderOutcome::Unknown, message)
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::unsuccessful(OrderOutcome::Failed, message)
    }

    fn unsuccessful(status: OrderOutcome, message: impl Into<String>) -> Self {
        Self {
            success: false,
            status,
            order_id: None,
            created_at: None,
            message: message.into(),
        }
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRegister {
    pub username: String,
    pub email: String,
    pub password: String,
}

impl fmt::Debug for UserRegister {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserRegister")
            .field("username", &self.username)
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRegisterReply {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Set when the email is already registered, as opposed to invalid input.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub conflict: bool,
}

impl UserRegisterReply {
    pub fn registered(user_id: i32) -> Self {
        Self {
            success: true,
            user_id: Some(user_id),
            error: None,
            conflict: false,
        }
    }

    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            success: false,
            user_id: None,
            error: Some(error.into()),
            conflict: false,
        }
    }

    pub fn conflict(error: impl Into<String>) -> Self {
        Self {
            conflict: true,
            ..Self::rejected(error)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewInventoryItem {
    pub quantity: i32,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryItemReply {
    pub id: i32,
    pub quantity: i32,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Read request served on the `*_query` queues. `Get` replies with the
/// record or `null`; `List` replies with an array ordered by id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Query {
    Get {
        id: i32,
    },
    List {
        #[serde(default)]
        limit: Option<i64>,
    },
}

impl Query {
    /// Clamps a requested list size to `1..=MAX_LIST_LIMIT`.
    pub fn list_limit(limit: Option<i64>) -> i64 {
        limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSummary {
    pub id: i32,
    pub username: String,
    pub email: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderSummary {
    pub id: i32,
    pub user_id: i32,
    pub product_id: i32,
    pub quantity: i32,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejected_order_reply_omits_identifiers() {
        let json = serde_json::to_value(OrderReply::rejected("Not enough inventory")).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "success": false,
                "status": "rejected",
                "message": "Not enough inventory"
            })
        );
    }

    #[test]
    fn test_query_wire_format() {
        let get: Query = serde_json::from_str(r#"{"op": "get", "id": 3}"#).unwrap();
        assert_eq!(get, Query::Get { id: 3 });
        let list: Query = serde_json::from_str(r#"{"op": "list"}"#).unwrap();
        assert_eq!(list, Query::List { limit: None });
    }

    #[test]
    fn test_list_limit_is_clamped() {
        assert_eq!(Query::list_limit(None), DEFAULT_LIST_LIMIT);
        assert_eq!(Query::list_limit(Some(0)), 1);
        assert_eq!(Query::list_limit(Some(5_000)), MAX_LIST_LIMIT);
    }

    #[test]
    fn test_user_register_debug_hides_password() {
        let request = UserRegister {
            username: "ada".into(),
            email: "ada@example.com".into(),
            password: "hunter2".into(),
        };
        let printed = format!("{request:?}");
        assert!(!printed.contains("hunter2"));
        assert!(printed.contains("ada@example.com"));
    }

    #[test]
    fn test_new_item_description_is_optional() {
        let item: NewInventoryItem = serde_json::from_str(r#"{"quantity": 4}"#).unwrap();
        assert_eq!(item.quantity, 4);
        assert_eq!(item.description, None);
    }
}
