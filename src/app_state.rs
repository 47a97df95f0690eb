use sqlx::PgPool;
use std::sync::Arc;

use crate::routes::auth::JwtVerifier;
use crate::services::queue::RedisJobQueue;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub queue: Arc<RedisJobQueue>,
    pub auth: Arc<JwtVerifier>,
}

impl AppState {
    pub fn new(db: PgPool, queue: RedisJobQueue, auth: JwtVerifier) -> Self {
        Self {
            db,
            queue: Arc::new(queue),
            auth: Arc::new(auth),
        }
    }
}
