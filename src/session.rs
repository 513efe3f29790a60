use sqlx::SqlitePool;
use tower_sessions::Session;

use crate::AppResult;

pub const USER_ID: &str = "user_id";

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Principal {
    pub id: i64,
    pub display_name: String,
    pub is_admin: bool,
}

/// Resolve the connecting principal from the shared session cookie. The
/// identity collaborator writes `user_id` at login; this module only reads
/// it. A missing key or a dangling user id both mean unauthenticated.
pub async fn current_principal(
    session: &Session,
    db_pool: &SqlitePool,
) -> AppResult<Option<Principal>> {
    let Some(user_id) = session.get::<i64>(USER_ID).await? else {
        return Ok(None);
    };

    let principal =
        sqlx::query_as::<_, Principal>("SELECT id,display_name,is_admin FROM users WHERE id=?")
            .bind(user_id)
            .fetch_optional(db_pool)
            .await?;

    Ok(principal)
}
