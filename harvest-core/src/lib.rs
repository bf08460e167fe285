pub mod checkpoint;
pub mod config;
pub mod error;
pub mod harvest;
pub mod model;
pub mod output;
pub mod report;
pub mod roster;

pub use checkpoint::{CheckpointStore, FileCheckpointStore, SqliteCheckpointStore, open_checkpoint_store};
pub use config::{CheckpointBackend, HarvestConfig};
pub use error::{HarvestError, Result};
pub use harvest::{HarvestSummary, Harvester};
pub use model::{CrawlUnit, SnapshotResult, UnitKey, UnitState};
pub use output::{CsvOutputStore, OutputStore, SnapshotRecord};
pub use roster::{RosterEntry, Stage, load_roster};
