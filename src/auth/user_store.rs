//! User Storage
//! Accounts behind `/auth/login` and `/auth/register`, kept in SQLite with
//! bcrypt password hashes.

use crate::auth::models::User;
use bcrypt::{hash, verify};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum UserStoreError {
    #[error("user already exists: {0}")]
    AlreadyExists(String),

    #[error("user database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("password hashing failed: {0}")]
    Hash(#[from] bcrypt::BcryptError),
}

pub type UserStoreResult<T> = Result<T, UserStoreError>;

/// Work-factor range bcrypt accepts.
pub const MIN_BCRYPT_COST: u32 = 4;
pub const MAX_BCRYPT_COST: u32 = 31;

/// Fields of a new account.
#[derive(Clone)]
pub struct NewUser<'a> {
    pub email: &'a str,
    pub password: &'a str,
    pub name: &'a str,
    pub roles: &'a [String],
    pub tenant_id: &'a str,
}

/// User storage with SQLite backend
pub struct UserStore {
    db_path: String,
    bcrypt_cost: u32,
}

const USER_COLUMNS: &str =
    "id, email, name, password_hash, roles, tenant_id, created_at, updated_at";

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    let id: String = row.get(0)?;
    let roles: String = row.get(4)?;
    Ok(User {
        id: Uuid::parse_str(&id).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })?,
        email: row.get(1)?,
        name: row.get(2)?,
        password_hash: row.get(3)?,
        roles: roles
            .split(',')
            .filter(|r| !r.is_empty())
            .map(str::to_string)
            .collect(),
        tenant_id: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

impl UserStore {
    /// Create a new user store and initialize database
    pub fn new(db_path: &str, bcrypt_cost: u32) -> UserStoreResult<Self> {
        let store = Self {
            db_path: db_path.to_string(),
            bcrypt_cost,
        };
        store.init_db()?;
        Ok(store)
    }

    fn connect(&self) -> rusqlite::Result<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(conn)
    }

    fn init_db(&self) -> UserStoreResult<()> {
        let conn = self.connect()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                email TEXT UNIQUE NOT NULL,
                name TEXT NOT NULL,
                password_hash TEXT NOT NULL,
                roles TEXT NOT NULL,
                tenant_id TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        Ok(())
    }

    pub fn get_user_by_email(&self, email: &str) -> UserStoreResult<Option<User>> {
        let conn = self.connect()?;
        let user = conn
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE email = ?1"),
                params![email],
                user_from_row,
            )
            .optional()?;
        Ok(user)
    }

    pub fn get_user_by_id(&self, id: &str) -> UserStoreResult<Option<User>> {
        let conn = self.connect()?;
        let user = conn
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
                params![id],
                user_from_row,
            )
            .optional()?;
        Ok(user)
    }

    /// Returns the user when `password` matches, `None` for an unknown
    /// email or a wrong password.
    pub fn verify_password(&self, email: &str, password: &str) -> UserStoreResult<Option<User>> {
        let Some(user) = self.get_user_by_email(email)? else {
            return Ok(None);
        };
        let valid = verify(password, &user.password_hash)?;
        Ok(valid.then_some(user))
    }

    /// Create a new user
    pub fn create_user(&self, new_user: NewUser<'_>) -> UserStoreResult<User> {
        let password_hash = hash(new_user.password, self.bcrypt_cost)?;
        let now = Utc::now().to_rfc3339();

        let user = User {
            id: Uuid::new_v4(),
            email: new_user.email.to_string(),
            name: new_user.name.to_string(),
            password_hash,
            roles: new_user.roles.to_vec(),
            tenant_id: new_user.tenant_id.to_string(),
            created_at: now.clone(),
            updated_at: now,
        };

        let conn = self.connect()?;
        let inserted = conn.execute(
            "INSERT INTO users (id, email, name, password_hash, roles, tenant_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(email) DO NOTHING",
            params![
                user.id.to_string(),
                user.email,
                user.name,
                user.password_hash,
                user.roles.join(","),
                user.tenant_id,
                user.created_at,
                user.updated_at,
            ],
        )?;

        if inserted == 0 {
            return Err(UserStoreError::AlreadyExists(user.email));
        }

        info!(user_id = %user.id, roles = %user.roles.join(","), "Created user");
        Ok(user)
    }

    /// Creates an administrator account unless one with `email` exists.
    /// Returns whether an account was created.
    pub fn ensure_admin(&self, email: &str, password: &str) -> UserStoreResult<bool> {
        if self.get_user_by_email(email)?.is_some() {
            return Ok(false);
        }

        let roles = ["admin".to_string(), "user".to_string()];
        match self.create_user(NewUser {
            email,
            password,
            name: "Administrator",
            roles: &roles,
            tenant_id: "",
        }) {
            Ok(_) => {
                warn!(email, "Bootstrap administrator created; rotate its password");
                Ok(true)
            }
            Err(UserStoreError::AlreadyExists(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}
