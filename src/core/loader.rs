use std::fs;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::core::config::EpilogueConfig;
use crate::core::error::EpilogueError;

pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads any serde document (configs, epilogue specs) from a JSON file.
    pub fn load_json<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> Result<T, EpilogueError> {
        let path = path.as_ref();
        debug!(path = %path.display(), "loading json");
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Saves a document as pretty-printed JSON.
    pub fn save_json<T: Serialize, P: AsRef<Path>>(value: &T, path: P) -> Result<(), EpilogueError> {
        let content = serde_json::to_string_pretty(value)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Loads an epilogue configuration and applies environment overrides on top.
    pub fn load_config<P: AsRef<Path>>(path: P) -> Result<EpilogueConfig, EpilogueError> {
        let config: EpilogueConfig = Self::load_json(path)?;
        Ok(config.with_env_overrides())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::TileOrder;

    #[test]
    fn test_round_trip_file() {
        let path = std::env::temp_dir().join(format!("tracea_evt_config_{}.json", std::process::id()));
        let config = EpilogueConfig { parallel: false, tile_order: TileOrder::Reversed, ..Default::default() };
        ConfigLoader::save_json(&config, &path).unwrap();
        let loaded: EpilogueConfig = ConfigLoader::load_json(&path).unwrap();
        assert_eq!(loaded, config);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = ConfigLoader::load_json::<EpilogueConfig, _>("/nonexistent/tracea_evt.json").unwrap_err();
        assert!(matches!(err, EpilogueError::Io(_)));
    }
}
