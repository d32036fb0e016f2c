mod config;
mod serve_cmd;
mod tasks_cmd;

use clap::{Parser, Subcommand};

use foreman_db::pool;

use config::ForemanConfig;

#[derive(Parser)]
#[command(name = "foreman", about = "Durable asynchronous task manager")]
struct Cli {
    /// Database URL (overrides FOREMAN_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a foreman config file (no database required)
    Init {
        /// PostgreSQL connection URL for the task store
        #[arg(long, default_value = "postgresql://localhost:5432/foreman")]
        db_url: String,
        /// Maintenance URL of the backend cluster used by provisioning tasks
        #[arg(long, default_value = "postgresql://localhost:5432/postgres")]
        admin_url: String,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Initialize the foreman database (requires config file or env vars)
    DbInit,
    /// Run the task manager and its HTTP API
    Serve {
        /// Address to bind
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,
        /// Port to listen on
        #[arg(long, default_value_t = 8780)]
        port: u16,
    },
    /// List recent tasks
    Tasks {
        /// Maximum number of tasks to show
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
    /// Show one task record as JSON
    Task {
        /// Task ID to show
        task_id: String,
    },
}

/// Execute the `foreman init` command: write config file.
fn cmd_init(db_url: &str, admin_url: &str, force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let cfg = config::ConfigFile {
        database: config::DatabaseSection {
            url: db_url.to_string(),
        },
        provision: foreman_core::config::ProvisionConfig {
            admin_url: admin_url.to_string(),
        },
        ..config::ConfigFile::default()
    };

    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  database.url = {db_url}");
    println!("  provision.admin_url = {admin_url}");
    println!();
    println!("Next: run `foreman db-init` to create and migrate the database.");

    Ok(())
}

/// Execute the `foreman db-init` command: create database and run migrations.
async fn cmd_db_init(cli_db_url: Option<&str>) -> anyhow::Result<()> {
    let resolved = ForemanConfig::resolve(cli_db_url)?;

    println!("Initializing foreman database...");

    // 1. Create the database if it does not exist.
    pool::ensure_database_exists(&resolved.db_config).await?;

    // 2. Connect to the target database.
    let db_pool = pool::create_pool(&resolved.db_config).await?;

    // 3. Run migrations.
    pool::run_migrations(&db_pool).await?;

    // 4. Print what the store is now running.
    let applied = pool::applied_migrations(&db_pool).await?;
    println!("Database ready. Applied migrations:");
    for migration in &applied {
        println!("  {:04} {}", migration.version, migration.description);
    }
    let counts = foreman_db::queries::tasks::count_tasks_by_state(&db_pool).await?;
    println!("Task store holds {} task(s).", counts.total);

    // 5. Clean shutdown.
    db_pool.close().await;

    println!("foreman db-init complete.");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init {
            db_url,
            admin_url,
            force,
        } => {
            cmd_init(&db_url, &admin_url, force)?;
        }
        Commands::DbInit => {
            cmd_db_init(cli.database_url.as_deref()).await?;
        }
        Commands::Serve { bind, port } => {
            let resolved = ForemanConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result =
                serve_cmd::run_serve(db_pool.clone(), resolved.core_config, &bind, port).await;
            db_pool.close().await;
            result?;
        }
        Commands::Tasks { limit } => {
            let resolved = ForemanConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = tasks_cmd::run_tasks(&db_pool, limit).await;
            db_pool.close().await;
            result?;
        }
        Commands::Task { task_id } => {
            let resolved = ForemanConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = tasks_cmd::run_task_show(&db_pool, &task_id).await;
            db_pool.close().await;
            result?;
        }
    }

    Ok(())
}
