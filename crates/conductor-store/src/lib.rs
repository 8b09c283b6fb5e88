pub mod database;
pub mod error;
pub mod history;
pub mod run_events;
pub mod runs;
pub mod schema;

pub use database::Database;
pub use error::StoreError;
pub use history::HistoryRepo;
pub use run_events::RunEventRepo;
pub use runs::{RunRepo, RunRow, RunStatus};
