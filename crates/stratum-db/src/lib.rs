//! # stratum-db
//!
//! PostgreSQL storage layer for stratum.
//!
//! This crate provides:
//! - Connection pool management
//! - The durable enrichment job queue (atomic claim via
//!   `FOR UPDATE SKIP LOCKED`)
//! - Knowledge element storage with derivation-key upserts and lineage
//!   edges
//! - Lineage graph walks (ancestors/descendants)
//! - Watcher state (last-seen checksum/mtime per source file)
//! - Schema migration and destructive reset with backup
//!
//! ## Example
//!
//! ```rust,ignore
//! use stratum_db::Database;
//! use stratum_core::{JobRepository, JobSource};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Database::connect("postgres://localhost/stratum").await?;
//!     stratum_db::migrate(&db.pool).await?;
//!
//!     db.jobs.enqueue("session-1", JobSource::ChatSync, 5).await?;
//!     let claimed = db.jobs.dequeue(1).await?;
//!     println!("claimed {} job(s)", claimed.len());
//!     Ok(())
//! }
//! ```

pub mod elements;
pub mod jobs;
pub mod lineage;
pub mod maintenance;
pub mod pool;
pub mod watch;

// Re-export core types
pub use stratum_core::*;

pub use elements::PgElementRepository;
pub use jobs::PgJobRepository;
pub use lineage::{trace, LineageTrace, TraceHop};
pub use maintenance::{migrate, reset, schema_present, write_backup, BackupSnapshot, SCHEMA_VERSION};
pub use pool::{create_pool, create_pool_with_config, PoolConfig};
pub use watch::PgWatchStateRepository;

/// Combined database context with all repositories.
pub struct Database {
    /// The underlying connection pool.
    pub pool: sqlx::PgPool,
    /// Enrichment job queue.
    pub jobs: PgJobRepository,
    /// Knowledge elements and lineage edges.
    pub elements: PgElementRepository,
    /// Change-watcher bookkeeping.
    pub watch: PgWatchStateRepository,
}

impl Database {
    /// Connect with default pool configuration.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = create_pool(database_url).await?;
        Ok(Self::from_pool(pool))
    }

    /// Build the repository context over an existing pool.
    pub fn from_pool(pool: sqlx::PgPool) -> Self {
        Self {
            jobs: PgJobRepository::new(pool.clone()),
            elements: PgElementRepository::new(pool.clone()),
            watch: PgWatchStateRepository::new(pool.clone()),
            pool,
        }
    }
}
