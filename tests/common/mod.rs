#![allow(dead_code)]

//! Scripted backend and sample models shared by the integration tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Once};

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use quarry::core::{BuiltSql, Model, Relation, Row, Value};
use quarry::error::DriverError;
use quarry::postgres::{
    Backend, BackendTransaction, ConnectionConfig, ConnectionRouter, Connector, DriverResult,
    PoolConfig, Role, RouterConfig,
};
use quarry::row;

// ==================== scripted backend ====================

/// One thing the backend saw.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Statement {
        conn: String,
        in_tx: bool,
        sql: String,
        params: Vec<Value>,
    },
    Begin(String),
    Commit(String),
    Rollback(String),
    Close(String),
}

enum Reply {
    Rows(Vec<Row>),
    Error(DriverError),
    Hang,
}

/// Shared script: replies are consumed in order across all connections;
/// a statement with nothing queued gets zero rows.
#[derive(Default)]
pub struct Script {
    replies: Mutex<VecDeque<Reply>>,
    events: Mutex<Vec<Event>>,
    connect_failures: AtomicU32,
    connect_attempts: AtomicU32,
    timezones: Mutex<Vec<String>>,
}

impl Script {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn rows(&self, rows: Vec<Row>) -> &Self {
        self.replies.lock().unwrap().push_back(Reply::Rows(rows));
        self
    }

    pub fn error(&self, err: DriverError) -> &Self {
        self.replies.lock().unwrap().push_back(Reply::Error(err));
        self
    }

    /// The next statement never completes.
    pub fn hang(&self) -> &Self {
        self.replies.lock().unwrap().push_back(Reply::Hang);
        self
    }

    /// Fails the next `n` connect attempts.
    pub fn fail_connects(&self, n: u32) {
        self.connect_failures.store(n, Ordering::SeqCst);
    }

    pub fn connect_attempts(&self) -> u32 {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    /// Session zone handed to every connect attempt.
    pub fn timezones(&self) -> Vec<String> {
        self.timezones.lock().unwrap().clone()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    /// Positional SQL of every statement, in order.
    pub fn statements(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Statement { sql, .. } => Some(sql),
                _ => None,
            })
            .collect()
    }

    /// Bound values of the `n`th statement.
    pub fn params(&self, n: usize) -> Vec<Value> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Statement { params, .. } => Some(params),
                _ => None,
            })
            .nth(n)
            .unwrap_or_default()
    }

    /// Connection name of every statement, in order.
    pub fn connections(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Statement { conn, .. } => Some(conn),
                _ => None,
            })
            .collect()
    }

    fn record(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }

    async fn reply(&self, conn: &str, in_tx: bool, sql: &BuiltSql) -> DriverResult<Vec<Row>> {
        self.record(Event::Statement {
            conn: conn.to_string(),
            in_tx,
            sql: sql.sql.clone(),
            params: sql.params.clone(),
        });
        let next = self.replies.lock().unwrap().pop_front();
        match next {
            Some(Reply::Rows(rows)) => Ok(rows),
            Some(Reply::Error(err)) => Err(err),
            Some(Reply::Hang) => std::future::pending().await,
            None => Ok(Vec::new()),
        }
    }
}

struct ScriptedBackend {
    name: String,
    script: Arc<Script>,
}

#[async_trait]
impl Backend for ScriptedBackend {
    async fn fetch_all(&self, sql: &BuiltSql) -> DriverResult<Vec<Row>> {
        self.script.reply(&self.name, false, sql).await
    }

    async fn begin(&self) -> DriverResult<Box<dyn BackendTransaction>> {
        self.script.record(Event::Begin(self.name.clone()));
        Ok(Box::new(ScriptedTransaction {
            name: self.name.clone(),
            script: Arc::clone(&self.script),
        }))
    }

    async fn close(&self) {
        self.script.record(Event::Close(self.name.clone()));
    }
}

struct ScriptedTransaction {
    name: String,
    script: Arc<Script>,
}

#[async_trait]
impl BackendTransaction for ScriptedTransaction {
    async fn fetch_all(&self, sql: &BuiltSql) -> DriverResult<Vec<Row>> {
        self.script.reply(&self.name, true, sql).await
    }

    async fn commit(self: Box<Self>) -> DriverResult<()> {
        self.script.record(Event::Commit(self.name.clone()));
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> DriverResult<()> {
        self.script.record(Event::Rollback(self.name.clone()));
        Ok(())
    }
}

pub struct ScriptedConnector {
    script: Arc<Script>,
}

impl ScriptedConnector {
    pub fn new(script: &Arc<Script>) -> Self {
        Self {
            script: Arc::clone(script),
        }
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(
        &self,
        name: &str,
        _config: &ConnectionConfig,
        _pool: &PoolConfig,
        timezone: &str,
    ) -> DriverResult<Arc<dyn Backend>> {
        self.script.connect_attempts.fetch_add(1, Ordering::SeqCst);
        self.script
            .timezones
            .lock()
            .unwrap()
            .push(timezone.to_string());
        let remaining = self.script.connect_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.script
                .connect_failures
                .store(remaining - 1, Ordering::SeqCst);
            return Err(DriverError::new("ConnectionRefused", "connection refused"));
        }
        Ok(Arc::new(ScriptedBackend {
            name: name.to_string(),
            script: Arc::clone(&self.script),
        }))
    }
}

// ==================== setup ====================

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// `primary` WRITE, `replica` READ.
pub fn config() -> RouterConfig {
    RouterConfig::new()
        .database("primary", ConnectionConfig::new(Role::Write, "app", "app"))
        .database(
            "replica",
            ConnectionConfig::new(Role::Read, "app", "app").host("replica", 5432),
        )
        .query_logger("TEST", true)
}

/// A connected router over `script`.
pub async fn router(script: &Arc<Script>) -> ConnectionRouter {
    init_tracing();
    quarry::core::register::<(Profile, User, Post)>().expect("valid models");
    let router = ConnectionRouter::with_connector(config(), ScriptedConnector::new(script))
        .expect("valid config");
    router.connect().await.expect("scripted connect");
    router
}

// ==================== models ====================

#[derive(Debug, Clone, PartialEq)]
pub struct Profile {
    pub id: Option<i64>,
    pub bio: String,
}

impl Model for Profile {
    const NAME: &'static str = "Profile";
    const TABLE: &'static str = "profiles";
    const PRIMARY_KEY: &'static str = "id";
    const FIELDS: &'static [&'static str] = &["id", "bio"];
    const AUTO_GENERATED: &'static [&'static str] = &["id"];

    fn from_row(mut row: Row) -> quarry::Result<Self> {
        Ok(Self {
            id: row.take_as("id")?,
            bio: row.take_as("bio")?,
        })
    }

    fn to_row(&self) -> Row {
        row! { "id" => self.id, "bio" => self.bio.as_str() }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub id: Option<i64>,
    pub name: String,
    pub email: Option<String>,
    pub age: Option<i64>,
    pub profile_id: Option<i64>,
    pub created_at: Option<DateTime<FixedOffset>>,
    pub updated_at: Option<DateTime<FixedOffset>>,
    pub profile: Option<Profile>,
    pub posts: Vec<Post>,
}

impl User {
    pub fn named(name: &str) -> Self {
        Self {
            id: None,
            name: name.to_string(),
            email: None,
            age: None,
            profile_id: None,
            created_at: None,
            updated_at: None,
            profile: None,
            posts: Vec::new(),
        }
    }
}

impl Model for User {
    const NAME: &'static str = "User";
    const TABLE: &'static str = "users";
    const PRIMARY_KEY: &'static str = "id";
    const FIELDS: &'static [&'static str] = &[
        "id",
        "name",
        "email",
        "age",
        "profile_id",
        "created_at",
        "updated_at",
    ];
    const AUTO_GENERATED: &'static [&'static str] = &["id"];
    const AUTO_NOW_ADD: &'static [&'static str] = &["created_at"];
    const AUTO_NOW: &'static [&'static str] = &["updated_at"];

    fn relations() -> Vec<Relation> {
        vec![Relation::to::<Profile>("profile_id")]
    }

    fn from_row(mut row: Row) -> quarry::Result<Self> {
        Ok(Self {
            id: row.take_as("id")?,
            name: row.take_as("name")?,
            email: row.take_as("email")?,
            age: row.take_as("age")?,
            profile_id: row.take_as("profile_id")?,
            created_at: row.take_as("created_at")?,
            updated_at: row.take_as("updated_at")?,
            profile: row.related("profile")?,
            posts: row.prefetched("posts")?,
        })
    }

    fn to_row(&self) -> Row {
        row! {
            "id" => self.id,
            "name" => self.name.as_str(),
            "email" => self.email.clone(),
            "age" => self.age,
            "profile_id" => self.profile_id,
            "created_at" => self.created_at,
            "updated_at" => self.updated_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Post {
    pub id: Option<i64>,
    pub user_id: i64,
    pub title: String,
}

impl Model for Post {
    const NAME: &'static str = "Post";
    const TABLE: &'static str = "posts";
    const PRIMARY_KEY: &'static str = "id";
    const FIELDS: &'static [&'static str] = &["id", "user_id", "title"];
    const AUTO_GENERATED: &'static [&'static str] = &["id"];

    fn relations() -> Vec<Relation> {
        vec![Relation::to::<User>("user_id").named("author")]
    }

    fn from_row(mut row: Row) -> quarry::Result<Self> {
        Ok(Self {
            id: row.take_as("id")?,
            user_id: row.take_as("user_id")?,
            title: row.take_as("title")?,
        })
    }

    fn to_row(&self) -> Row {
        row! { "id" => self.id, "user_id" => self.user_id, "title" => self.title.as_str() }
    }
}

/// A raw `users` row as the replica would return it.
pub fn user_row(id: i64, name: &str, age: i64) -> Row {
    row! {
        "id" => id,
        "name" => name,
        "email" => Value::Null,
        "age" => age,
        "profile_id" => Value::Null,
        "created_at" => Value::Null,
        "updated_at" => Value::Null,
    }
}
