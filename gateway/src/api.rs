use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query as Params, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use shared::{
    queues, InventoryItemReply, NewInventoryItem, OrderOutcome, OrderReply, OrderRequest,
    OrderSummary, Publisher, Query, SharedRpcClient, UserRegister, UserRegisterReply, UserSummary,
};
use tracing::{error, info, warn};

pub const STILL_PROCESSING: &str = "Request is still processing, check back later";

#[derive(Clone)]
pub struct AppState {
    pub rpc: Arc<SharedRpcClient>,
    pub publisher: Arc<Publisher>,
    pub rpc_timeout: Duration,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PublishedResponse {
    pub status: String,
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub limit: Option<i64>,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
        }),
    )
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/main/orders", post(place_order))
        .route("/orders", post(publish_order).get(list_orders))
        .route("/orders/:id", get(get_order))
        .route("/inventory", get(list_inventory))
        .route("/inventory/new", post(add_inventory_item))
        .route("/inventory/:id", get(get_inventory_item))
        .route("/users", get(list_users))
        .route("/users/register", post(register_user))
        .route("/users/:id", get(get_user))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}

async fn call<Req, Resp>(state: &AppState, queue: &str, request: &Req) -> Result<Resp, ApiError>
where
    Req: Serialize,
    Resp: DeserializeOwned,
{
    match state.rpc.call_json(queue, request, state.rpc_timeout).await {
        Ok(reply) => Ok(reply),
        Err(e) if e.is_timeout() => {
            warn!("No reply on {} within {:?}", queue, state.rpc_timeout);
            Err(api_error(StatusCode::GATEWAY_TIMEOUT, STILL_PROCESSING))
        }
        Err(e) => {
            error!("RPC on {} failed: {}", queue, e);
            Err(api_error(
                StatusCode::SERVICE_UNAVAILABLE,
                format!("Service unavailable: {}", e),
            ))
        }
    }
}

fn validate_order(request: &OrderRequest) -> Result<(), ApiError> {
    if request.quantity <= 0 {
        return Err(api_error(
            StatusCode::UNPROCESSABLE_ENTITY,
            "quantity must be greater than zero",
        ));
    }
    Ok(())
}

pub async fn place_order(
    State(state): State<AppState>,
    Json(request): Json<OrderRequest>,
) -> Result<(StatusCode, Json<OrderReply>), ApiError> {
    validate_order(&request)?;

    let reply: OrderReply = call(&state, queues::ORDER_CREATED, &request).await?;
    let status = match reply.status {
        OrderOutcome::Confirmed => {
            info!("Order {:?} confirmed for user {}", reply.order_id, request.user_id);
            StatusCode::OK
        }
        OrderOutcome::Rejected => StatusCode::CONFLICT,
        OrderOutcome::Unknown => {
            warn!("Order for user {} has an unknown outcome", request.user_id);
            return Err(api_error(StatusCode::GATEWAY_TIMEOUT, STILL_PROCESSING));
        }
        OrderOutcome::Failed => {
            error!("Order for user {} failed: {}", request.user_id, reply.message);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    Ok((status, Json(reply)))
}

/// Accepts the order for asynchronous processing; the outcome is never
/// reported back to this caller.
pub async fn publish_order(
    State(state): State<AppState>,
    Json(request): Json<OrderRequest>,
) -> Result<(StatusCode, Json<PublishedResponse>), ApiError> {
    validate_order(&request)?;

    if let Err(e) = state
        .publisher
        .publish_json(queues::ORDER_CREATED, &request)
        .await
    {
        error!("Failed to publish order event: {:#}", e);
        return Err(api_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "Failed to publish order event",
        ));
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(PublishedResponse {
            status: "Order event published".to_string(),
        }),
    ))
}

pub async fn add_inventory_item(
    State(state): State<AppState>,
    Json(request): Json<NewInventoryItem>,
) -> Result<Json<InventoryItemReply>, ApiError> {
    if request.quantity < 0 {
        return Err(api_error(
            StatusCode::UNPROCESSABLE_ENTITY,
            "quantity must not be negative",
        ));
    }

    let item: InventoryItemReply = call(&state, queues::INVENTORY_NEW_ITEM, &request).await?;
    info!("Inventory item {} created", item.id);
    Ok(Json(item))
}

pub async fn register_user(
    State(state): State<AppState>,
    Json(request): Json<UserRegister>,
) -> Result<(StatusCode, Json<UserRegisterReply>), ApiError> {
    if request.username.trim().is_empty()
        || request.email.trim().is_empty()
        || request.password.is_empty()
    {
        return Err(api_error(
            StatusCode::UNPROCESSABLE_ENTITY,
            "username, email and password are required",
        ));
    }
    if !request.email.contains('@') {
        return Err(api_error(StatusCode::UNPROCESSABLE_ENTITY, "email is not valid"));
    }

    let reply: UserRegisterReply = call(&state, queues::USER_REGISTER, &request).await?;
    let status = if reply.success {
        StatusCode::OK
    } else if reply.conflict {
        StatusCode::CONFLICT
    } else {
        StatusCode::UNPROCESSABLE_ENTITY
    };
    Ok((status, Json(reply)))
}

async fn lookup<T: DeserializeOwned>(
    state: &AppState,
    queue: &str,
    id: i32,
    what: &str,
) -> Result<Json<T>, ApiError> {
    let found: Option<T> = call(state, queue, &Query::Get { id }).await?;
    found
        .map(Json)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("{what} {id} not found")))
}

async fn listing<T: DeserializeOwned>(
    state: &AppState,
    queue: &str,
    params: ListParams,
) -> Result<Json<Vec<T>>, ApiError> {
    let items: Vec<T> = call(state, queue, &Query::List { limit: params.limit }).await?;
    Ok(Json(items))
}

pub async fn get_inventory_item(
    State(state): State<AppState>,
    Path(id): Path<i32>,
) -> Result<Json<InventoryItemReply>, ApiError> {
    lookup(&state, queues::INVENTORY_QUERY, id, "Product").await
}

pub async fn list_inventory(
    State(state): State<AppState>,
    Params(params): Params<ListParams>,
) -> Result<Json<Vec<InventoryItemReply>>, ApiError> {
    listing(&state, queues::INVENTORY_QUERY, params).await
}

pub async fn get_user(
    State(state): State<AppState>,
    Path(id): Path<i32>,
) -> Result<Json<UserSummary>, ApiError> {
    lookup(&state, queues::USER_QUERY, id, "User").await
}

pub async fn list_users(
    State(state): State<AppState>,
    Params(params): Params<ListParams>,
) -> Result<Json<Vec<UserSummary>>, ApiError> {
    listing(&state, queues::USER_QUERY, params).await
}

pub async fn get_order(
    State(state): State<AppState>,
    Path(id): Path<i32>,
) -> Result<Json<OrderSummary>, ApiError> {
    lookup(&state, queues::ORDER_QUERY, id, "Order").await
}

pub async fn list_orders(
    State(state): State<AppState>,
    Params(params): Params<ListParams>,
) -> Result<Json<Vec<OrderSummary>>, ApiError> {
    listing(&state, queues::ORDER_QUERY, params).await
}

pub async fn health_check() -> &'static str {
    "OK"
}
