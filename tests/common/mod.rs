#![allow(dead_code)]

use async_trait::async_trait;
use rusqlite::{params, Connection};
use sqlpilot::config::{FeedbackConfig, ValidatorMode};
use sqlpilot::error::{CopilotError, Result};
use sqlpilot::execution::sqlite_engine::SqliteDatabase;
use sqlpilot::execution::{DatabaseCapability, Executor, SqlDialect};
use sqlpilot::execution_loop::FeedbackLoop;
use sqlpilot::generator::QueryGenerator;
use sqlpilot::judge::Validator;
use sqlpilot::llm::{GenerationContext, LanguageModel};
use sqlpilot::metadata::SchemaIndex;
use sqlpilot::schema_rag::{EmbeddingCache, EmbeddingModel, HashedEmbedder, SemanticMatcher};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

pub const TOP5_SQL: &str = "SELECT customer_id, SUM(revenue) AS total_revenue\nFROM sales\nGROUP BY customer_id\nORDER BY total_revenue DESC\nLIMIT 5";

/// Demo `sales` table: 8 customers, 20 orders over Jan-Mar 2024.
pub fn create_sales_db(dir: &Path) -> std::result::Result<PathBuf, Box<dyn std::error::Error>> {
    let path = dir.join("sales_demo.db");
    let conn = Connection::open(&path)?;
    conn.execute_batch(
        "CREATE TABLE sales (
            order_id INTEGER PRIMARY KEY,
            date TEXT NOT NULL,
            customer_id TEXT NOT NULL,
            product_category TEXT NOT NULL,
            revenue REAL NOT NULL
        );",
    )?;

    let categories = ["Electronics", "Home", "Toys", "Books"];
    for i in 0..20u32 {
        let customer = format!("C{:03}", (i % 8) + 1);
        let date = format!("2024-{:02}-{:02}", (i % 3) + 1, (i % 27) + 1);
        let revenue = 50.0 + f64::from(i) * 12.5;
        conn.execute(
            "INSERT INTO sales (order_id, date, customer_id, product_category, revenue) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![i + 1, date, customer, categories[(i % 4) as usize], revenue],
        )?;
    }
    Ok(path)
}

pub fn row_count(path: &Path) -> i64 {
    let conn = Connection::open(path).unwrap();
    conn.query_row("SELECT COUNT(*) FROM sales", [], |row| row.get(0))
        .unwrap()
}

/// Deterministic language model: replays scripted replies in order and records every
/// prompt it was given.
pub struct ScriptedModel {
    replies: Mutex<VecDeque<Result<String>>>,
    prompts: Mutex<Vec<String>>,
    delay: Option<Duration>,
}

impl ScriptedModel {
    pub fn new(replies: Vec<Result<String>>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            prompts: Mutex::new(Vec::new()),
            delay: None,
        })
    }

    pub fn sql(replies: &[&str]) -> Arc<Self> {
        Self::new(replies.iter().map(|s| Ok(s.to_string())).collect())
    }

    /// Never answers within `delay`.
    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(VecDeque::new()),
            prompts: Mutex::new(Vec::new()),
            delay: Some(delay),
        })
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, prompt: &str, _context: &GenerationContext) -> Result<String> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(CopilotError::GenerationUnavailable("script exhausted".to_string())))
    }
}

pub struct FailingEmbedder;

#[async_trait]
impl EmbeddingModel for FailingEmbedder {
    fn name(&self) -> &str {
        "failing"
    }

    async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        Err(CopilotError::EmbeddingUnavailable("connection refused".to_string()))
    }
}

pub struct Fixture {
    pub dir: TempDir,
    pub db_path: PathBuf,
    pub db: Arc<dyn DatabaseCapability>,
    pub schema: Arc<SchemaIndex>,
    pub cache: Arc<EmbeddingCache>,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let db_path = create_sales_db(dir.path()).unwrap();
        let db: Arc<dyn DatabaseCapability> = Arc::new(SqliteDatabase::open(&db_path).unwrap());
        let schema = Arc::new(SchemaIndex::new(db.clone()));
        Self {
            dir,
            db_path,
            db,
            schema,
            cache: Arc::new(EmbeddingCache::new()),
        }
    }

    pub fn matcher(&self) -> Arc<SemanticMatcher> {
        self.matcher_with(Arc::new(HashedEmbedder::new(384)))
    }

    pub fn matcher_with(&self, embedder: Arc<dyn EmbeddingModel>) -> Arc<SemanticMatcher> {
        let policy = FeedbackConfig::default();
        Arc::new(SemanticMatcher::new(
            embedder,
            self.cache.clone(),
            policy.similarity_floor,
            policy.top_k,
        ))
    }

    pub fn executor(&self) -> Arc<Executor> {
        Arc::new(Executor::new(self.db.clone(), Duration::from_secs(5), 1000))
    }

    /// Controller without a judge.
    pub fn controller(&self, model: Arc<ScriptedModel>, max_attempts: u32) -> FeedbackLoop {
        self.controller_with(model, self.matcher(), policy(max_attempts, ValidatorMode::Disabled))
    }

    pub fn controller_with(
        &self,
        model: Arc<ScriptedModel>,
        matcher: Arc<SemanticMatcher>,
        policy: FeedbackConfig,
    ) -> FeedbackLoop {
        let generator = Arc::new(QueryGenerator::new(model, SqlDialect::Sqlite, Duration::from_secs(5)));
        FeedbackLoop::new(self.schema.clone(), matcher, generator, self.executor(), policy)
    }

    pub fn judged_controller(
        &self,
        model: Arc<ScriptedModel>,
        judge: Arc<ScriptedModel>,
        max_attempts: u32,
        mode: ValidatorMode,
    ) -> FeedbackLoop {
        self.controller_with(model, self.matcher(), policy(max_attempts, mode))
            .with_validator(Arc::new(Validator::new(judge, Duration::from_secs(5))))
    }
}

pub fn policy(max_attempts: u32, validator: ValidatorMode) -> FeedbackConfig {
    FeedbackConfig {
        max_attempts,
        validator,
        ..FeedbackConfig::default()
    }
}
