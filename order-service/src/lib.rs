pub mod handlers;
pub mod models;
pub mod saga;
pub mod schema;
pub mod store;

pub use handlers::{OrderCreatedHandler, OrderQueryHandler};
pub use saga::{OrderSaga, RpcInventory, SagaError, SagaOutcome, SagaState, StockReserver};
pub use store::{InMemoryOrderStore, OrderStore, PgOrderStore};
