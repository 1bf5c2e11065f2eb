use sqlx::{FromRow, PgConnection, PgPool};
use time::OffsetDateTime;

use crate::error::ApiError;

/// User record in the database.
#[derive(Debug, Clone, FromRow)]
pub struct User {
    pub user_id: i64,
    pub username: String,
    pub password_hash: String, // Argon2 PHC string, never serialized
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub date_created: OffsetDateTime,
    pub last_login: Option<OffsetDateTime>,
}

/// Fields required to insert a new user.
pub struct NewUser<'a> {
    pub username: &'a str,
    pub password_hash: &'a str,
    pub email: &'a str,
    pub first_name: Option<&'a str>,
    pub last_name: Option<&'a str>,
}

/// Find a user by username.
pub async fn find_by_username(
    conn: &mut PgConnection,
    username: &str,
) -> Result<Option<User>, ApiError> {
    let user = sqlx::query_as::<_, User>(
        r#"
        SELECT user_id, username, password_hash, email, first_name, last_name,
               date_created, last_login
        FROM users
        WHERE username = $1
        "#,
    )
    .bind(username)
    .fetch_optional(conn)
    .await?;
    Ok(user)
}

/// Find a user by email.
pub async fn find_by_email(
    conn: &mut PgConnection,
    email: &str,
) -> Result<Option<User>, ApiError> {
    let user = sqlx::query_as::<_, User>(
        r#"
        SELECT user_id, username, password_hash, email, first_name, last_name,
               date_created, last_login
        FROM users
        WHERE email = $1
        "#,
    )
    .bind(email)
    .fetch_optional(conn)
    .await?;
    Ok(user)
}

/// Insert a new user. The unique constraints are the arbiter for duplicate
/// usernames and emails: two concurrent creates that both pass the handler
/// pre-checks still surface as the duplicate error kinds here.
pub async fn create(conn: &mut PgConnection, new_user: NewUser<'_>) -> Result<User, ApiError> {
    let result = sqlx::query_as::<_, User>(
        r#"
        INSERT INTO users (username, password_hash, email, first_name, last_name)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING user_id, username, password_hash, email, first_name, last_name,
                  date_created, last_login
        "#,
    )
    .bind(new_user.username)
    .bind(new_user.password_hash)
    .bind(new_user.email)
    .bind(new_user.first_name)
    .bind(new_user.last_name)
    .fetch_one(conn)
    .await;

    match result {
        Ok(user) => Ok(user),
        Err(sqlx::Error::Database(db)) if db.constraint() == Some("users_username_key") => {
            Err(ApiError::DuplicateUsername)
        }
        Err(sqlx::Error::Database(db)) if db.constraint() == Some("users_email_key") => {
            Err(ApiError::DuplicateEmail)
        }
        Err(other) => Err(other.into()),
    }
}

/// Set the last-login timestamp to now.
pub async fn touch_last_login(conn: &mut PgConnection, user_id: i64) -> Result<(), ApiError> {
    sqlx::query("UPDATE users SET last_login = now() WHERE user_id = $1")
        .bind(user_id)
        .execute(conn)
        .await?;
    Ok(())
}

/// Cheap reachability probe for the health endpoint.
pub async fn ping(db: &PgPool) -> Result<(), ApiError> {
    sqlx::query("SELECT 1")
        .execute(db)
        .await
        .map_err(|_| ApiError::StorageUnavailable)?;
    Ok(())
}
