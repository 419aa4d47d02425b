pub mod config;
pub mod db;
pub mod error;
pub mod load;
pub mod model;
pub mod test_support;

pub use config::LoaderConfig;
pub use db::{Connection, Database, PgDatabase};
pub use error::{BatchFailure, DbError, LoadError, LoadFailure};
pub use load::{BulkLoader, LoadReport, SessionSetting, TableReport};
pub use model::{Dependency, Key, KeySource, LoadManifest, Row, TableConfig, Value};

use env_logger::Env;
use std::sync::Once;

static LOGGER: Once = Once::new();

/// Install the env_logger backend once. Safe to call repeatedly.
pub fn init_logger() {
    LOGGER.call_once(|| {
        let _ = env_logger::Builder::from_env(Env::default().default_filter_or("info,sqlx=warn"))
            .try_init();
    });
}
