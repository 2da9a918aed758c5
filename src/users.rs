//! User records stored in SQLite, reached through the connection governor.

use argon2::password_hash::{
    Error as PasswordHashError, PasswordHash, PasswordHasher, PasswordVerifier, SaltString,
};
use argon2::Argon2;
use rusqlite::{params, ErrorCode, OptionalExtension, Row, Transaction};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::database::ConnectionGovernor;
use crate::error::{Error, Result};
use crate::validation::{CreateUserRequest, UpdateUserRequest};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        email TEXT NOT NULL UNIQUE,
        password_hash TEXT NOT NULL,
        created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
        updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
        is_active BOOLEAN DEFAULT 1
    );
";

const SEED_USERS: [(&str, &str, &str); 3] = [
    ("John Doe", "john@example.com", "password123"),
    ("Jane Smith", "jane@example.com", "secret456"),
    ("Bob Johnson", "bob@example.com", "qwerty789"),
];

const USER_COLUMNS: &str = "id, name, email, created_at";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub created_at: String,
}

impl User {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            email: row.get(2)?,
            created_at: row.get(3)?,
        })
    }
}

#[derive(Clone)]
pub struct UserStore {
    governor: ConnectionGovernor,
}

impl UserStore {
    pub fn new(governor: ConnectionGovernor) -> Self {
        Self { governor }
    }

    /// Create the schema and seed the demo accounts into an empty table
    pub async fn init(&self) -> Result<()> {
        let seeded = self
            .governor
            .run(|tx| {
                tx.execute_batch(SCHEMA)?;
                let existing: i64 = tx.query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0))?;
                if existing > 0 {
                    return Ok(0);
                }
                for (name, email, password) in SEED_USERS {
                    tx.execute(
                        "INSERT INTO users (name, email, password_hash) VALUES (?1, ?2, ?3)",
                        params![name, email, hash_password(password)?],
                    )?;
                }
                Ok(SEED_USERS.len())
            })
            .await?;

        if seeded > 0 {
            info!(count = seeded, "Seeded users table");
        }
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<User>> {
        self.governor
            .run(|tx| {
                let sql = format!("SELECT {} FROM users WHERE is_active = 1", USER_COLUMNS);
                let mut stmt = tx.prepare(&sql)?;
                let users = stmt
                    .query_map([], User::from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(users)
            })
            .await
    }

    pub async fn get(&self, id: i64) -> Result<Option<User>> {
        self.governor.run(move |tx| find_active(tx, id)).await
    }

    /// Insert a user; the email must not belong to any existing row
    pub async fn create(&self, request: CreateUserRequest) -> Result<User> {
        self.governor
            .run(move |tx| {
                let taken: Option<i64> = tx
                    .query_row(
                        "SELECT id FROM users WHERE email = ?1",
                        [&request.email],
                        |r| r.get(0),
                    )
                    .optional()?;
                if taken.is_some() {
                    return Err(email_conflict());
                }

                let hash = hash_password(&request.password)?;
                tx.execute(
                    "INSERT INTO users (name, email, password_hash) VALUES (?1, ?2, ?3)",
                    params![request.name, request.email, hash],
                )
                .map_err(map_unique_violation)?;

                find_active(tx, tx.last_insert_rowid())?
                    .ok_or_else(|| Error::Internal("inserted user not readable".to_string()))
            })
            .await
    }

    /// Apply a partial update. `Ok(None)` when no active user has `id`.
    pub async fn update(&self, id: i64, changes: UpdateUserRequest) -> Result<Option<User>> {
        self.governor
            .run(move |tx| {
                if find_active(tx, id)?.is_none() {
                    return Ok(None);
                }

                if let Some(email) = &changes.email {
                    let taken: Option<i64> = tx
                        .query_row(
                            "SELECT id FROM users WHERE email = ?1 AND id != ?2",
                            params![email, id],
                            |r| r.get(0),
                        )
                        .optional()?;
                    if taken.is_some() {
                        return Err(email_conflict());
                    }
                }

                tx.execute(
                    "UPDATE users SET
                        name = COALESCE(?1, name),
                        email = COALESCE(?2, email),
                        updated_at = CURRENT_TIMESTAMP
                     WHERE id = ?3",
                    params![changes.name, changes.email, id],
                )
                .map_err(map_unique_violation)?;

                find_active(tx, id)
            })
            .await
    }

    /// Soft delete. Returns false when no active user has `id`.
    pub async fn delete(&self, id: i64) -> Result<bool> {
        self.governor
            .run(move |tx| {
                let affected = tx.execute(
                    "UPDATE users SET is_active = 0 WHERE id = ?1 AND is_active = 1",
                    [id],
                )?;
                Ok(affected > 0)
            })
            .await
    }

    /// Case-insensitive substring match on name. `%` and `_` in `term` match
    /// literally.
    pub async fn search(&self, term: &str) -> Result<Vec<User>> {
        let pattern = format!("%{}%", escape_like(term));
        self.governor
            .run(move |tx| {
                let sql = format!(
                    "SELECT {} FROM users WHERE name LIKE ?1 ESCAPE '\\' AND is_active = 1",
                    USER_COLUMNS
                );
                let mut stmt = tx.prepare(&sql)?;
                let users = stmt
                    .query_map([&pattern], User::from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(users)
            })
            .await
    }

    /// Check credentials against an active account
    pub async fn authenticate(&self, email: &str, password: &str) -> Result<Option<User>> {
        let email = email.to_string();
        let password = password.to_string();
        self.governor
            .run(move |tx| {
                let found = tx
                    .query_row(
                        "SELECT id, name, email, created_at, password_hash
                         FROM users WHERE email = ?1 AND is_active = 1",
                        [&email],
                        |row| Ok((User::from_row(row)?, row.get::<_, String>(4)?)),
                    )
                    .optional()?;

                match found {
                    Some((user, hash)) if verify_password(&password, &hash)? => Ok(Some(user)),
                    _ => Ok(None),
                }
            })
            .await
    }
}

fn find_active(tx: &Transaction<'_>, id: i64) -> Result<Option<User>> {
    let sql = format!(
        "SELECT {} FROM users WHERE id = ?1 AND is_active = 1",
        USER_COLUMNS
    );
    Ok(tx.query_row(&sql, [id], User::from_row).optional()?)
}

fn email_conflict() -> Error {
    Error::Conflict("Email already exists".to_string())
}

fn map_unique_violation(err: rusqlite::Error) -> Error {
    match err.sqlite_error_code() {
        Some(ErrorCode::ConstraintViolation) => email_conflict(),
        _ => Error::Database(err),
    }
}

fn escape_like(term: &str) -> String {
    let mut escaped = String::with_capacity(term.len());
    for c in term.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::encode_b64(uuid::Uuid::new_v4().as_bytes())
        .map_err(|e| Error::Internal(format!("failed to build salt: {}", e)))?;
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| Error::Internal(format!("failed to hash password: {}", e)))
}

pub fn verify_password(password: &str, hash: &str) -> Result<bool> {
    let parsed = PasswordHash::new(hash)
        .map_err(|e| Error::Internal(format!("invalid stored hash: {}", e)))?;
    match Argon2::default().verify_password(password.as_bytes(), &parsed) {
        Ok(()) => Ok(true),
        Err(PasswordHashError::Password) => Ok(false),
        Err(e) => Err(Error::Internal(format!("failed to verify password: {}", e))),
    }
}
