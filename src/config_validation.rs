//! Validation of a loaded configuration before the proxy starts.

use crate::config::Config;
use std::path::Path;

#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn success() -> Self {
        Self {
            is_valid: true,
            errors: vec![],
            warnings: vec![],
        }
    }

    pub fn add_error(&mut self, error: String) {
        self.errors.push(error);
        self.is_valid = false;
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }
}

pub fn validate(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::success();

    if config.max_header_size == 0 {
        result.add_error("max_header_size must be greater than zero".to_string());
    } else if config.max_header_size < 1024 {
        result.add_warning(format!(
            "max_header_size of {} bytes will reject most browser requests",
            config.max_header_size
        ));
    }

    if config.connect_timeout_secs == 0 {
        result.add_warning("connect_timeout_secs is 0: upstream dials have no deadline".to_string());
    }
    if config.read_timeout_secs == 0 {
        result.add_warning("read_timeout_secs is 0: silent peers can hold connections open forever".to_string());
    }

    validate_cache(config, &mut result);
    result
}

fn validate_cache(config: &Config, result: &mut ValidationResult) {
    let cache = &config.cache;
    if !cache.enabled {
        result.add_warning("Response cache is disabled".to_string());
        return;
    }

    if cache.max_entries == Some(0) {
        result.add_error("cache.max_entries must be greater than zero (use enabled: false to turn the cache off)".to_string());
    } else if cache.max_entries.is_none() {
        result.add_warning("cache.max_entries is unset: the cache can grow without bound".to_string());
    }

    if config.max_response_size == 0 {
        result.add_warning("max_response_size is 0: no response will ever be cached".to_string());
    }

    if let Some(dir) = &cache.disk_dir {
        validate_cache_dir(dir, result);
    }
}

fn validate_cache_dir(dir: &Path, result: &mut ValidationResult) {
    match std::fs::metadata(dir) {
        Ok(metadata) if !metadata.is_dir() => {
            result.add_error(format!("cache.disk_dir {} exists but is not a directory", dir.display()));
        }
        Ok(metadata) if metadata.permissions().readonly() => {
            result.add_error(format!("cache.disk_dir {} is read-only", dir.display()));
        }
        Ok(_) => {}
        Err(_) => {
            result.add_warning(format!("cache.disk_dir {} does not exist and will be created", dir.display()));
        }
    }
}
