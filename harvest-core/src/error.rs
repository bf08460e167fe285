use harvest_scanner::ScanError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HarvestError {
    #[error(transparent)]
    Scan(#[from] ScanError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Could not render config: {0}")]
    ConfigRender(#[from] toml::ser::Error),

    #[error("Invalid configuration:\n  {}", .0.join("\n  "))]
    Config(Vec<String>),

    #[error("Roster error: {0}")]
    Roster(String),

    #[error("Storage failure: {0}")]
    Storage(String),
}

impl HarvestError {
    /// Failures of the checkpoint or output store. These end the run, since
    /// carrying on would lose track of what has been recorded.
    pub fn is_storage(&self) -> bool {
        matches!(
            self,
            HarvestError::Storage(_)
                | HarvestError::Io(_)
                | HarvestError::Csv(_)
                | HarvestError::Database(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, HarvestError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_classification() {
        let io = HarvestError::Io(std::io::Error::other("disk full"));
        assert!(io.is_storage());
        assert!(HarvestError::Storage("checkpoint log".into()).is_storage());

        let scan = HarvestError::from(ScanError::Status {
            url: "http://a".into(),
            status: 503,
        });
        assert!(!scan.is_storage());
        assert!(!HarvestError::Roster("missing".into()).is_storage());
    }

    #[test]
    fn test_config_render_is_not_storage() {
        let err = HarvestError::from(<toml::ser::Error as serde::ser::Error>::custom("bad value"));
        assert!(matches!(err, HarvestError::ConfigRender(_)));
        assert!(!err.is_storage());
        assert!(err.to_string().contains("bad value"));
    }

    #[test]
    fn test_config_errors_are_listed() {
        let err = HarvestError::Config(vec!["workers must be > 0".into(), "bad delay".into()]);
        let msg = err.to_string();
        assert!(msg.contains("workers must be > 0"));
        assert!(msg.contains("bad delay"));
    }
}
