use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use shared::{
    respond, Connection, Message, MessageHandler, Query, UserRegister, UserRegisterReply,
    UserSummary,
};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::models::{NewUser, User};
use crate::password::hash_password;
use crate::store::UserStore;

#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("Email already exists")]
    EmailTaken,

    #[error("{0}")]
    Invalid(&'static str),

    #[error("failed to hash password: {0}")]
    Hash(argon2::password_hash::Error),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl RegistrationError {
    /// Rejections the caller gets told about; everything else fails the
    /// delivery.
    pub fn is_rejection(&self) -> bool {
        matches!(self, RegistrationError::EmailTaken | RegistrationError::Invalid(_))
    }
}

pub struct RegisterUserHandler {
    store: Arc<dyn UserStore>,
}

impl RegisterUserHandler {
    pub fn new(store: Arc<dyn UserStore>) -> Self {
        Self { store }
    }

    pub async fn register(&self, request: UserRegister) -> Result<User, RegistrationError> {
        let username = request.username.trim();
        let email = request.email.trim().to_lowercase();
        if username.is_empty() {
            return Err(RegistrationError::Invalid("Username must not be empty"));
        }
        if !email.contains('@') {
            return Err(RegistrationError::Invalid("Email is not valid"));
        }
        if request.password.is_empty() {
            return Err(RegistrationError::Invalid("Password must not be empty"));
        }

        if self.store.find_by_email(&email).await?.is_some() {
            return Err(RegistrationError::EmailTaken);
        }

        let password_hash = hash_password(&request.password).map_err(RegistrationError::Hash)?;
        self.store
            .insert(NewUser {
                username: username.to_string(),
                email,
                password_hash,
            })
            .await?
            .ok_or(RegistrationError::EmailTaken)
    }
}

#[async_trait]
impl MessageHandler for RegisterUserHandler {
    async fn handle(&self, message: Message, channel: Arc<dyn Connection>) -> Result<()> {
        let request: UserRegister =
            serde_json::from_slice(&message.body).context("Malformed user_register payload")?;
        info!("Registering user: {}", request.username);

        let reply = match self.register(request).await {
            Ok(user) => {
                info!("User registered with ID: {}", user.id);
                UserRegisterReply::registered(user.id)
            }
            Err(RegistrationError::EmailTaken) => {
                warn!("Registration rejected: email already exists");
                UserRegisterReply::conflict(RegistrationError::EmailTaken.to_string())
            }
            Err(e) if e.is_rejection() => {
                warn!("Registration rejected: {}", e);
                UserRegisterReply::rejected(e.to_string())
            }
            Err(e) => return Err(e.into()),
        };

        if !respond(channel.as_ref(), &message, &reply).await? {
            warn!("user_register had no reply address, result dropped");
        }
        Ok(())
    }
}

/// Serves `user_query`: user lookups for the gateway's read routes.
pub struct UserQueryHandler {
    store: Arc<dyn UserStore>,
}

impl UserQueryHandler {
    pub fn new(store: Arc<dyn UserStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl MessageHandler for UserQueryHandler {
    async fn handle(&self, message: Message, channel: Arc<dyn Connection>) -> Result<()> {
        let query: Query =
            serde_json::from_slice(&message.body).context("Malformed user_query payload")?;
        debug!("User query: {:?}", query);

        match query {
            Query::Get { id } => {
                let user: Option<UserSummary> = self.store.get(id).await?.map(Into::into);
                respond(channel.as_ref(), &message, &user).await?;
            }
            Query::List { limit } => {
                let users: Vec<UserSummary> = self
                    .store
                    .list(Query::list_limit(limit))
                    .await?
                    .into_iter()
                    .map(Into::into)
                    .collect();
                respond(channel.as_ref(), &message, &users).await?;
            }
        }
        Ok(())
    }
}
