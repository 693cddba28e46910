use directories::ProjectDirs;
use std::path::PathBuf;

/// Centralized application directory resolution
pub struct AppDirs;

impl AppDirs {
    fn state_dir() -> Option<PathBuf> {
        if let Ok(home) = std::env::var("HOME") {
            Some(
                PathBuf::from(home)
                    .join(".local")
                    .join("state")
                    .join("gazalyzer"),
            )
        } else {
            ProjectDirs::from("", "", "gazalyzer").map(|pd| pd.data_local_dir().to_path_buf())
        }
    }

    pub fn db_path() -> Option<PathBuf> {
        Self::state_dir().map(|dir| dir.join("gazalyzer.db"))
    }

    /// Where the last valid calibration is kept between runs
    pub fn calibration_path() -> Option<PathBuf> {
        Self::state_dir().map(|dir| dir.join("calibration.json"))
    }
}
