use std::str::FromStr;

use async_trait::async_trait;
use bsky_publisher::{
    AuthScheme, CredentialStore, Error, Post, PostId, PostStatus, PostStore, User,
    UserCredential,
};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;

type Result<T> = std::result::Result<T, Error>;

fn storage(e: sqlx::Error) -> Error {
    Error::StorageError(e.to_string())
}

fn timestamp(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value
        .map(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| Error::StorageError(format!("bad timestamp {}: {}", s, e)))
        })
        .transpose()
}

fn required_timestamp(row: &SqliteRow, column: &str) -> Result<DateTime<Utc>> {
    let value: String = row.try_get(column).map_err(storage)?;
    timestamp(Some(value))?
        .ok_or_else(|| Error::StorageError(format!("missing {}", column)))
}

fn scheme_from_str(value: &str) -> AuthScheme {
    match value {
        "bearer" => AuthScheme::Bearer,
        _ => AuthScheme::Dpop,
    }
}

/// Opens the database and applies the schema.
///
/// In-memory databases are limited to one connection so every query sees the
/// same schema.
pub async fn init_db(db_url: &str) -> std::result::Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(db_url)?
        .create_if_missing(true)
        .foreign_keys(true);
    let max_connections = if db_url.contains(":memory:") { 1 } else { 5 };

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;

    let migration_sql = include_str!("../migrations/001_initial_schema.sql");
    sqlx::raw_sql(migration_sql).execute(&pool).await?;

    Ok(pool)
}

/// Users, their credentials and their posts in SQLite
#[derive(Clone)]
pub struct SqliteStore {
    db: SqlitePool,
}

impl SqliteStore {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    pub async fn upsert_user(&self, user: &User) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let credential = &user.credential;

        sqlx::query(
            r#"
            INSERT INTO users (did, handle, email, display_name, avatar_url, auth_scheme,
                               access_token, refresh_token, token_expires_at, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(did) DO UPDATE SET
                handle = excluded.handle,
                email = excluded.email,
                display_name = excluded.display_name,
                avatar_url = excluded.avatar_url,
                auth_scheme = excluded.auth_scheme,
                access_token = excluded.access_token,
                refresh_token = excluded.refresh_token,
                token_expires_at = excluded.token_expires_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&user.did)
        .bind(&user.handle)
        .bind(&user.email)
        .bind(&user.display_name)
        .bind(&user.avatar_url)
        .bind(credential.scheme.as_str())
        .bind(credential.access_token())
        .bind(credential.refresh_token())
        .bind(credential.token_expires_at.map(|t| t.to_rfc3339()))
        .bind(&now)
        .bind(&now)
        .execute(&self.db)
        .await
        .map_err(storage)?;

        Ok(())
    }

    pub async fn get_user(&self, did: &str) -> Result<Option<User>> {
        let row = sqlx::query(
            r#"
            SELECT did, handle, email, display_name, avatar_url, auth_scheme,
                   access_token, refresh_token, token_expires_at
            FROM users
            WHERE did = ?
            "#,
        )
        .bind(did)
        .fetch_optional(&self.db)
        .await
        .map_err(storage)?;

        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(User {
            did: row.try_get("did").map_err(storage)?,
            handle: row.try_get("handle").map_err(storage)?,
            email: row.try_get("email").map_err(storage)?,
            display_name: row.try_get("display_name").map_err(storage)?,
            avatar_url: row.try_get("avatar_url").map_err(storage)?,
            credential: credential_from_row(&row)?,
        }))
    }

    /// Inserts a new draft and returns it with its assigned id
    /// Removes the user; their posts go with them. `false` if there was no such user.
    pub async fn delete_user(&self, did: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM users WHERE did = ?")
            .bind(did)
            .execute(&self.db)
            .await
            .map_err(storage)?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn create_post(&self, user_did: &str, title: &str, content: &str) -> Result<Post> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            r#"
            INSERT INTO posts (user_did, title, content, status, created_at, updated_at)
            VALUES (?, ?, ?, 'draft', ?, ?)
            "#,
        )
        .bind(user_did)
        .bind(title)
        .bind(content)
        .bind(&now)
        .bind(&now)
        .execute(&self.db)
        .await
        .map_err(storage)?;

        let id = result.last_insert_rowid();
        self.get_post(id)
            .await?
            .ok_or_else(|| Error::StorageError(format!("post {} vanished after insert", id)))
    }

    pub async fn list_posts(&self, user_did: &str) -> Result<Vec<Post>> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_did, title, content, excerpt, status, published_at,
                   bluesky_uri, bluesky_cid, created_at, updated_at
            FROM posts
            WHERE user_did = ?
            ORDER BY created_at DESC
            "#,
        )
        .bind(user_did)
        .fetch_all(&self.db)
        .await
        .map_err(storage)?;

        rows.iter().map(post_from_row).collect()
    }
}

fn credential_from_row(row: &SqliteRow) -> Result<UserCredential> {
    let did: String = row.try_get("did").map_err(storage)?;
    let scheme: String = row.try_get("auth_scheme").map_err(storage)?;
    let expires_at: Option<String> = row.try_get("token_expires_at").map_err(storage)?;

    Ok(UserCredential::from_parts(
        did,
        scheme_from_str(&scheme),
        row.try_get("access_token").map_err(storage)?,
        row.try_get("refresh_token").map_err(storage)?,
        timestamp(expires_at)?,
    ))
}

fn post_from_row(row: &SqliteRow) -> Result<Post> {
    let status: String = row.try_get("status").map_err(storage)?;
    let published_at: Option<String> = row.try_get("published_at").map_err(storage)?;

    Ok(Post {
        id: row.try_get("id").map_err(storage)?,
        user_did: row.try_get("user_did").map_err(storage)?,
        title: row.try_get("title").map_err(storage)?,
        content: row.try_get("content").map_err(storage)?,
        status: PostStatus::from_str(&status)?,
        published_at: timestamp(published_at)?,
        bluesky_uri: row.try_get("bluesky_uri").map_err(storage)?,
        bluesky_cid: row.try_get("bluesky_cid").map_err(storage)?,
        excerpt: row.try_get("excerpt").map_err(storage)?,
        created_at: required_timestamp(row, "created_at")?,
        updated_at: required_timestamp(row, "updated_at")?,
    })
}

#[async_trait]
impl CredentialStore for SqliteStore {
    async fn load_credential(&self, did: &str) -> Result<Option<UserCredential>> {
        let row = sqlx::query(
            r#"
            SELECT did, auth_scheme, access_token, refresh_token, token_expires_at
            FROM users
            WHERE did = ?
            "#,
        )
        .bind(did)
        .fetch_optional(&self.db)
        .await
        .map_err(storage)?;

        row.as_ref().map(credential_from_row).transpose()
    }

    async fn save_credential(&self, credential: &UserCredential) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE users
            SET auth_scheme = ?, access_token = ?, refresh_token = ?, token_expires_at = ?, updated_at = ?
            WHERE did = ?
            "#,
        )
        .bind(credential.scheme.as_str())
        .bind(credential.access_token())
        .bind(credential.refresh_token())
        .bind(credential.token_expires_at.map(|t| t.to_rfc3339()))
        .bind(Utc::now().to_rfc3339())
        .bind(&credential.did)
        .execute(&self.db)
        .await
        .map_err(storage)?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("user {}", credential.did)));
        }
        Ok(())
    }
}

#[async_trait]
impl PostStore for SqliteStore {
    async fn get_post(&self, id: PostId) -> Result<Option<Post>> {
        let row = sqlx::query(
            r#"
            SELECT id, user_did, title, content, excerpt, status, published_at,
                   bluesky_uri, bluesky_cid, created_at, updated_at
            FROM posts
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.db)
        .await
        .map_err(storage)?;

        row.as_ref().map(post_from_row).transpose()
    }

    async fn save_post(&self, post: &Post) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO posts (id, user_did, title, content, excerpt, status, published_at,
                               bluesky_uri, bluesky_cid, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                title = excluded.title,
                content = excluded.content,
                excerpt = excluded.excerpt,
                status = excluded.status,
                published_at = excluded.published_at,
                bluesky_uri = excluded.bluesky_uri,
                bluesky_cid = excluded.bluesky_cid,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(post.id)
        .bind(&post.user_did)
        .bind(&post.title)
        .bind(&post.content)
        .bind(&post.excerpt)
        .bind(post.status.as_str())
        .bind(post.published_at.map(|t| t.to_rfc3339()))
        .bind(&post.bluesky_uri)
        .bind(&post.bluesky_cid)
        .bind(post.created_at.to_rfc3339())
        .bind(post.updated_at.to_rfc3339())
        .execute(&self.db)
        .await
        .map_err(storage)?;

        Ok(())
    }
}
