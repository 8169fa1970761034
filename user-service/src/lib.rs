pub mod handlers;
pub mod models;
pub mod password;
pub mod schema;
pub mod store;

pub use handlers::{RegisterUserHandler, RegistrationError, UserQueryHandler};
pub use store::{InMemoryUserStore, PgUserStore, UserStore};
