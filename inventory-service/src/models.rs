use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use shared::InventoryItemReply;

#[derive(Debug, Clone, PartialEq, Eq, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::inventory)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct StockRecord {
    #[diesel(column_name = id)]
    pub product_id: i32,
    #[diesel(column_name = quantity)]
    pub quantity_available: i32,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::inventory)]
pub struct NewStockItem {
    pub quantity: i32,
    pub description: Option<String>,
}

impl From<StockRecord> for InventoryItemReply {
    fn from(record: StockRecord) -> Self {
        Self {
            id: record.product_id,
            quantity: record.quantity_available,
            description: record.description,
            created_at: record.created_at,
        }
    }
}
