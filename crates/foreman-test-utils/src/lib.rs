//! Shared PostgreSQL scaffolding for foreman integration tests.
//!
//! One server is shared per test binary; every test gets its own database
//! on it, wrapped in a [`TestDb`] guard. The server comes from
//! `FOREMAN_TEST_PG_URL` when set (external container, e.g. a nextest
//! setup script), otherwise a testcontainers instance is started lazily and
//! kept alive for the binary's lifetime. A single admin pool on the
//! server's `postgres` database issues all CREATE/DROP DATABASE statements.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool};
use testcontainers::ContainerAsync;
use testcontainers::ImageExt;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

use foreman_db::pool;

/// Per-binary shared server state.
struct SharedPg {
    /// Server root URL, no database name appended.
    server_url: String,
    /// Admin pool on the `postgres` database, reused for every
    /// CREATE/DROP DATABASE.
    admin: PgPool,
    /// Held to keep the container alive. `None` when using an external URL.
    _container: Option<ContainerAsync<Postgres>>,
}

static SHARED_PG: OnceCell<SharedPg> = OnceCell::const_new();

/// Database names are process-unique: pid plus a per-binary counter.
static NEXT_DB_ID: AtomicU32 = AtomicU32::new(0);

async fn admin_pool(server_url: &str) -> PgPool {
    PgPoolOptions::new()
        .max_connections(2)
        .acquire_timeout(Duration::from_secs(30))
        .connect(&format!("{server_url}/postgres"))
        .await
        .expect("failed to connect to the test server's postgres database")
}

async fn init_shared_pg() -> SharedPg {
    if let Ok(server_url) = std::env::var("FOREMAN_TEST_PG_URL") {
        let admin = admin_pool(&server_url).await;
        return SharedPg {
            server_url,
            admin,
            _container: None,
        };
    }

    let container = Postgres::default()
        .with_tag("18")
        .start()
        .await
        .expect("failed to start PostgreSQL container");
    let host = container.get_host().await.expect("failed to get host");
    let port = container
        .get_host_port_ipv4(5432)
        .await
        .expect("failed to get mapped port");

    let server_url = format!("postgresql://postgres:postgres@{host}:{port}");
    let admin = admin_pool(&server_url).await;

    SharedPg {
        server_url,
        admin,
        _container: Some(container),
    }
}

/// A migrated, uniquely-named database on the shared server.
///
/// Call [`TestDb::teardown`] at the end of the test; the database is not
/// dropped implicitly, so a failed test leaves its state behind for
/// inspection.
pub struct TestDb {
    /// Pool connected to this test's database.
    pub pool: PgPool,
    name: String,
}

/// Create a fresh database with migrations applied.
pub async fn test_db() -> TestDb {
    let shared = SHARED_PG.get_or_init(init_shared_pg).await;

    let name = format!(
        "foreman_test_{}_{}",
        std::process::id(),
        NEXT_DB_ID.fetch_add(1, Ordering::Relaxed)
    );
    let stmt = format!("CREATE DATABASE {name}");
    shared
        .admin
        .execute(stmt.as_str())
        .await
        .unwrap_or_else(|e| panic!("failed to create test database {name}: {e}"));

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(30))
        .connect(&format!("{}/{name}", shared.server_url))
        .await
        .unwrap_or_else(|e| panic!("failed to connect to test database {name}: {e}"));

    pool::run_migrations(&pool)
        .await
        .expect("migrations should succeed");

    TestDb { pool, name }
}

impl TestDb {
    /// Close the pool and drop the database.
    ///
    /// Stray connections (e.g. a pool clone held by a server under test)
    /// are terminated first so the drop cannot hang.
    pub async fn teardown(self) {
        self.pool.close().await;

        let shared = SHARED_PG
            .get()
            .expect("teardown called before any test database was created");

        let terminate = format!(
            "SELECT pg_terminate_backend(pid) \
             FROM pg_stat_activity \
             WHERE datname = '{}' AND pid <> pg_backend_pid()",
            self.name
        );
        let _ = shared.admin.execute(terminate.as_str()).await;

        let drop_stmt = format!("DROP DATABASE IF EXISTS {}", self.name);
        let _ = shared.admin.execute(drop_stmt.as_str()).await;
    }
}
