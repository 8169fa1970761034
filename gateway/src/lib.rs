pub mod api;

pub use api::{create_router, AppState};
