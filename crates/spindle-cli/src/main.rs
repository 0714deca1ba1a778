use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::{Duration, Instant, sleep};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use spindle_core::app::{EngineBuilder, EngineConfig, StepOptions, WorkflowContext};
use spindle_core::domain::{ErrorInfo, TaskStatus};
use spindle_core::impls::{PgStore, RedisLockStore};
use spindle_core::typed::{Workflow, WorkflowError};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

const WAIT_LIMIT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct HelloInput {
    name: Option<String>,
}

#[derive(Debug, Serialize)]
struct HelloOutput {
    message: String,
}

struct HelloWorld;

#[async_trait]
impl Workflow for HelloWorld {
    const NAME: &'static str = "hello-world";
    type Input = HelloInput;
    type Output = HelloOutput;

    async fn run(&self, ctx: WorkflowContext<HelloInput>) -> Result<HelloOutput, WorkflowError> {
        let name = ctx.input.name.clone().unwrap_or_else(|| "World".to_string());
        let message = ctx
            .step
            .run(
                "greet",
                || async move { Ok::<_, ErrorInfo>(format!("Hello, {name}!")) },
                StepOptions::new(),
            )
            .await?;
        Ok(HelloOutput { message })
    }
}

/// JSON logs by default; `SPINDLE_LOG_FORMAT=pretty` for a terminal.
fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let pretty = std::env::var("SPINDLE_LOG_FORMAT").is_ok_and(|v| v == "pretty");
    if pretty {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().pretty())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    init_logging();

    // (A) 設定とストア: DATABASE_URL / REDIS_URL が無ければ in-memory
    let config = EngineConfig::from_env()?;
    let mut builder = EngineBuilder::new()
        .with_config(config)
        .register(HelloWorld)?
        .expect_workflows(&[HelloWorld::NAME]);

    if let Ok(url) = std::env::var("DATABASE_URL") {
        let store = PgStore::connect(&url, 10).await?;
        store.migrate().await?;
        info!("using postgres store");
        builder = builder.with_store(Arc::new(store));
    } else {
        warn!("DATABASE_URL not set, using in-memory store");
    }
    if let Ok(url) = std::env::var("REDIS_URL") {
        builder = builder.with_lock_store(Arc::new(RedisLockStore::connect(&url).await?));
        info!("using redis leader lock");
    }

    // (B) エンジン起動
    let engine = builder.build()?;
    engine.start().await?;

    // (C) タスク投入
    let name = std::env::args().nth(1);
    let task_id = engine
        .submit(HelloWorld::NAME, json!({ "name": name }))
        .await?;
    info!(%task_id, "submitted hello-world");

    // (D) 終了状態まで待つ
    let deadline = Instant::now() + WAIT_LIMIT;
    let outcome = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break None,
            _ = sleep(Duration::from_millis(100)) => {}
        }
        let Some(task) = engine.status(task_id).await? else {
            break None;
        };
        if task.status.is_terminal() || Instant::now() >= deadline {
            break Some(task);
        }
    };

    match outcome {
        Some(task) if task.status == TaskStatus::Completed => {
            println!("{}", task.output.unwrap_or_default());
        }
        Some(task) => {
            warn!(%task_id, status = %task.status, error = ?task.error_info(), "task did not complete");
        }
        None => warn!(%task_id, "interrupted"),
    }

    // (E) 後片付け
    engine.shutdown().await;
    Ok(())
}
