pub mod handlers;
pub mod models;
pub mod schema;
pub mod store;

pub use handlers::{InventoryQueryHandler, NewItemHandler, OrderValidateHandler};
pub use store::{InMemoryStockStore, PgStockStore, Reservation, StockStore};
