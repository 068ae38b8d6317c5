use sqlrefine::config::HarnessConfig;
use sqlrefine::dialect::Dialect;
use sqlrefine::execution::snowflake_engine::run_worker_stdio;
use sqlrefine::execution::EngineFactory;
use sqlrefine::linking::{LinkingOptions, SchemaLinker};
use sqlrefine::llm::{LanguageModel, ModelRoles, OpenAiClient};
use sqlrefine::refine::{RefinementSession, SessionOptions};
use sqlrefine::schema::{Level, SchemaAccessor, SchemaFilter};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sqlrefine")]
#[command(about = "Multi-database NL-to-SQL refinement harness")]
#[command(version)]
struct Args {
    /// Registry file listing database locations and credential files
    #[arg(long, global = true)]
    registry: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Answer a question with the refinement loop
    Ask {
        /// Database id (also used to detect the backend when --dialect is absent)
        db_id: String,

        /// The question in natural language
        question: String,

        #[arg(long)]
        dialect: Option<Dialect>,

        /// Narrow the schema with schema linking first
        #[arg(long)]
        link: bool,

        /// Run exploratory queries before the first step
        #[arg(long)]
        explore: bool,

        /// External knowledge to include in every prompt
        #[arg(long)]
        evidence: Option<String>,

        /// Compress the evidence before use
        #[arg(long)]
        compress_evidence: bool,

        #[arg(long, default_value_t = 10)]
        steps: usize,
    },
    /// Run schema linking only and print the linked tables and columns
    Link {
        db_id: String,
        question: String,

        #[arg(long)]
        dialect: Option<Dialect>,

        /// Token budget for the schema text
        #[arg(long, default_value_t = 50_000)]
        budget: usize,

        #[arg(long)]
        use_single_table: bool,
    },
    /// Execute one SQL statement and print `(status, payload)`
    Exec {
        /// Database id, or a SQLite file path
        target: String,
        sql: String,

        #[arg(long)]
        dialect: Option<Dialect>,

        /// Commit without fetching rows
        #[arg(long)]
        no_fetch: bool,
    },
    /// Render a schema description
    Schema {
        db_id: String,

        #[arg(long)]
        dialect: Option<Dialect>,

        /// Render the DDL form instead
        #[arg(long)]
        ddl: bool,

        /// Comma-separated table filter
        #[arg(long, value_delimiter = ',')]
        tables: Vec<String>,
    },
    /// Warehouse worker process: job JSON on stdin, report JSON on stdout
    #[command(hide = true)]
    WarehouseWorker,
}

fn resolve_dialect(explicit: Option<Dialect>, db_id: &str) -> Result<Dialect> {
    match explicit {
        Some(d) => Ok(d),
        None => Dialect::detect(db_id).context("pass --dialect explicitly"),
    }
}

fn language_model() -> Result<Arc<dyn LanguageModel>> {
    let client = OpenAiClient::from_env().context("LLM client is not configured")?;
    Ok(Arc::new(client))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    // stdout is reserved for results (and for worker reports)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    if let Commands::WarehouseWorker = args.command {
        return run_worker_stdio().await.context("warehouse worker failed");
    }

    let config = Arc::new(HarnessConfig::load(args.registry.as_deref())?);
    let schema = Arc::new(SchemaAccessor::new(Arc::clone(&config)));

    match args.command {
        Commands::Ask { db_id, question, dialect, link, explore, evidence, compress_evidence, steps } => {
            let dialect = resolve_dialect(dialect, &db_id)?;
            let llm = language_model()?;
            let roles = ModelRoles::from_env();
            let factory = Arc::new(EngineFactory::new(Arc::clone(&config)));

            let options = SessionOptions {
                step_budget: steps,
                evidence,
                compress_evidence,
                explore_first: explore,
                ..SessionOptions::default()
            };
            let mut session = RefinementSession::new(Arc::clone(&llm), roles.clone(), factory, Arc::clone(&schema), dialect)
                .with_options(options);
            if link {
                session = session.with_linker(SchemaLinker::new(llm, roles, schema));
            }

            let outcome = session.run(&question, &db_id).await?;
            info!("Trace has {} entries", outcome.trace.len());
            let (status, payload) = outcome.as_pair();
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "final_sql": outcome.final_sql,
                    "status": status,
                    "payload": payload,
                    "accepted": outcome.accepted,
                    "steps": outcome.steps,
                }))?
            );
        }
        Commands::Link { db_id, question, dialect, budget, use_single_table } => {
            let dialect = resolve_dialect(dialect, &db_id)?;
            let linker = SchemaLinker::new(language_model()?, ModelRoles::from_env(), schema).with_options(LinkingOptions {
                budget,
                use_single_table,
                ..LinkingOptions::default()
            });
            let outcome = linker.link(&question, &db_id, dialect).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Commands::Exec { target, sql, dialect, no_fetch } => {
            let dialect = resolve_dialect(dialect, &target)?;
            let factory = EngineFactory::new(Arc::clone(&config));
            let result = factory.execute(dialect, &sql, &target, !no_fetch).await;
            println!("{}", result.status.code());
            if let Some(payload) = result.payload {
                println!("{}", payload);
            }
        }
        Commands::Schema { db_id, dialect, ddl, tables } => {
            let dialect = resolve_dialect(dialect, &db_id)?;
            let filter = (!tables.is_empty()).then_some(tables);
            let text = if ddl {
                schema.render_ddl(&db_id, filter.as_deref(), dialect)?
            } else {
                let filter = filter.map(SchemaFilter::Tables);
                schema.render(&db_id, filter.as_ref(), Level::Table, dialect)?
            };
            println!("{}", text);
        }
        Commands::WarehouseWorker => unreachable!("handled before configuration is loaded"),
    }

    Ok(())
}
