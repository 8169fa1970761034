use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use diesel::prelude::*;
use diesel_async::{pooled_connection::bb8::Pool, AsyncPgConnection, RunQueryDsl};
use tokio::sync::Mutex;

use crate::models::{NewUser, User};
use crate::schema::users;

type DbPool = Pool<AsyncPgConnection>;

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_by_email(&self, email: &str) -> Result<Option<User>>;

    async fn get(&self, id: i32) -> Result<Option<User>>;

    /// Up to `limit` users, lowest id first.
    async fn list(&self, limit: i64) -> Result<Vec<User>>;

    /// Returns `None` when the email is already taken.
    async fn insert(&self, user: NewUser) -> Result<Option<User>>;
}

pub struct PgUserStore {
    pool: DbPool,
}

impl PgUserStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserStore for PgUserStore {
    async fn find_by_email(&self, email: &str) -> Result<Option<User>> {
        let mut conn = self.pool.get().await?;
        let user = users::table
            .filter(users::email.eq(email))
            .select(User::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        Ok(user)
    }

    async fn get(&self, id: i32) -> Result<Option<User>> {
        let mut conn = self.pool.get().await?;
        let user = users::table
            .find(id)
            .select(User::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        Ok(user)
    }

    async fn list(&self, limit: i64) -> Result<Vec<User>> {
        let mut conn = self.pool.get().await?;
        let users = users::table
            .order(users::id.asc())
            .limit(limit)
            .select(User::as_select())
            .load(&mut conn)
            .await?;
        Ok(users)
    }

    async fn insert(&self, user: NewUser) -> Result<Option<User>> {
        let mut conn = self.pool.get().await?;
        // The unique index settles races between two registrations that both
        // passed the lookup.
        let user = diesel::insert_into(users::table)
            .values(&user)
            .on_conflict(users::email)
            .do_nothing()
            .returning(User::as_returning())
            .get_result(&mut conn)
            .await
            .optional()?;
        Ok(user)
    }
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryUserStore {
    users: Arc<Mutex<Vec<User>>>,
}

impl InMemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn count(&self) -> usize {
        self.users.lock().await.len()
    }
}

#[async_trait]
impl UserStore for InMemoryUserStore {
    async fn find_by_email(&self, email: &str) -> Result<Option<User>> {
        Ok(self
            .users
            .lock()
            .await
            .iter()
            .find(|u| u.email == email)
            .cloned())
    }

    async fn get(&self, id: i32) -> Result<Option<User>> {
        Ok(self.users.lock().await.iter().find(|u| u.id == id).cloned())
    }

    async fn list(&self, limit: i64) -> Result<Vec<User>> {
        let users = self.users.lock().await;
        Ok(users.iter().take(limit as usize).cloned().collect())
    }

    async fn insert(&self, user: NewUser) -> Result<Option<User>> {
        let mut users = self.users.lock().await;
        if users.iter().any(|u| u.email == user.email) {
            return Ok(None);
        }
        let stored = User {
            id: users.len() as i32 + 1,
            username: user.username,
            email: user.email,
            password_hash: user.password_hash,
            created_at: Utc::now(),
        };
        users.push(stored.clone());
        Ok(Some(stored))
    }
}
