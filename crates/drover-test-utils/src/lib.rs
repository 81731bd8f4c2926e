//! Postgres scaffolding shared by drover's integration tests.
//!
//! Each test binary talks to one Postgres backend, resolved once: an
//! external server named by `DROVER_TEST_PG_URL`, or a testcontainers
//! instance started on first use and kept alive for the life of the
//! process. Individual tests carve out throwaway databases through
//! [`TestDb`], which applies the drover-db migrations on creation and
//! force-drops the database on teardown.
//!
//! Tests should gate on [`pg_available`] and skip when it returns false,
//! so suites stay green on machines with neither a server nor a container
//! runtime.

use std::path::Path;

use sqlx::postgres::PgPoolOptions;
use sqlx::{Connection, Executor, PgConnection, PgPool};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use uuid::Uuid;

use drover_db::pool;

/// The Postgres backend serving this test binary.
enum Backend {
    /// Server provided by the environment; nothing to keep alive.
    External { url: String },
    /// Container started by this process. The handle keeps it running
    /// until the test binary exits.
    Owned {
        url: String,
        _container: ContainerAsync<Postgres>,
    },
}

impl Backend {
    fn url(&self) -> &str {
        match self {
            Self::External { url } | Self::Owned { url, .. } => url,
        }
    }
}

static BACKEND: OnceCell<Backend> = OnceCell::const_new();

/// Whether integration tests can reach a Postgres backend at all: an
/// external URL, or a container runtime to start one in.
pub fn pg_available() -> bool {
    std::env::var("DROVER_TEST_PG_URL").is_ok()
        || Path::new("/var/run/docker.sock").exists()
        || std::env::var("DOCKER_HOST").is_ok()
        || std::env::var("TESTCONTAINERS_HOST_OVERRIDE").is_ok()
}

/// Resolve the shared backend, starting a container when no external URL
/// is configured. The returned URL points at the server root, without a
/// database name.
async fn backend() -> &'static Backend {
    BACKEND
        .get_or_init(|| async {
            if let Ok(url) = std::env::var("DROVER_TEST_PG_URL") {
                return Backend::External { url };
            }

            let container = Postgres::default()
                .with_tag("18")
                .start()
                .await
                .expect("postgres test container should start");
            let host = container.get_host().await.expect("container host");
            let port = container
                .get_host_port_ipv4(5432)
                .await
                .expect("container mapped port");

            Backend::Owned {
                url: format!("postgresql://postgres:postgres@{host}:{port}"),
                _container: container,
            }
        })
        .await
}

/// One short-lived admin connection for DDL, aimed at the server's
/// `postgres` database.
async fn admin_connection() -> PgConnection {
    let url = format!("{}/postgres", backend().await.url());
    PgConnection::connect(&url)
        .await
        .expect("admin connection to the test backend")
}

/// A throwaway database owned by a single test.
///
/// Created with a unique name and the drover-db migrations already
/// applied. Call [`TestDb::teardown`] at the end of the test; dropping
/// the struct without it leaks the database into the shared backend,
/// which is harmless for containers but clutters an external server.
pub struct TestDb {
    pub pool: PgPool,
    name: String,
}

impl TestDb {
    /// Create a fresh database and connect a migrated pool to it.
    pub async fn create() -> Self {
        let name = format!("drover_it_{}", Uuid::new_v4().simple());

        let mut admin = admin_connection().await;
        let ddl = format!("CREATE DATABASE {name}");
        admin
            .execute(ddl.as_str())
            .await
            .unwrap_or_else(|e| panic!("could not create test database {name}: {e}"));

        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(&format!("{}/{name}", backend().await.url()))
            .await
            .unwrap_or_else(|e| panic!("could not connect to test database {name}: {e}"));

        pool::run_migrations(&pool)
            .await
            .expect("migrations apply cleanly on a fresh database");

        Self { pool, name }
    }

    /// The generated database name, for tests that assert on it.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Close the pool and drop the database. `WITH (FORCE)` disconnects
    /// any straggler sessions, so a test that leaked a connection still
    /// tears down cleanly.
    pub async fn teardown(self) {
        self.pool.close().await;
        let mut admin = admin_connection().await;
        let ddl = format!("DROP DATABASE IF EXISTS {} WITH (FORCE)", self.name);
        let _ = admin.execute(ddl.as_str()).await;
    }
}
