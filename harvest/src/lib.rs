#[path = "handlers.rs"]
pub mod handlers;

pub use handlers::{
    Overrides, apply_overrides, format_snapshot_list, resolve_roster_path, write_default_config,
};
