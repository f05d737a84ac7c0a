use std::{collections::HashMap, fs, path::Path, time::Duration};

use anyhow::Context;
use shared::domain::ThresholdPercentile;
use tracing::warn;

pub const SETTINGS_FILE: &str = "scavenger.toml";

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub backend_url: String,
    pub threshold_percentile: f64,
    pub required_extension: String,
    pub request_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            backend_url: "http://127.0.0.1:8000".into(),
            threshold_percentile: ThresholdPercentile::DEFAULT.value(),
            required_extension: ".csv".into(),
            request_timeout_secs: 120,
        }
    }
}

impl Settings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn threshold(&self) -> anyhow::Result<ThresholdPercentile> {
        ThresholdPercentile::new(self.threshold_percentile)
            .context("invalid threshold_percentile setting")
    }
}

/// Defaults, then `scavenger.toml` in the working directory, then environment.
pub fn load_settings() -> anyhow::Result<Settings> {
    let mut settings = Settings::default();
    let path = Path::new(SETTINGS_FILE);
    if path.exists() {
        apply_file(&mut settings, path)?;
    }
    apply_env(&mut settings, |key| std::env::var(key).ok());
    Ok(settings)
}

fn apply_file(settings: &mut Settings, path: &Path) -> anyhow::Result<()> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read settings file '{}'", path.display()))?;
    let file_cfg = toml::from_str::<HashMap<String, toml::Value>>(&raw)
        .with_context(|| format!("failed to parse settings file '{}'", path.display()))?;
    apply_values(settings, |key| {
        file_cfg.get(key).map(|value| match value {
            toml::Value::String(text) => text.clone(),
            other => other.to_string(),
        })
    });
    Ok(())
}

fn apply_env(settings: &mut Settings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("BACKEND_URL") {
        settings.backend_url = v;
    }
    apply_values(settings, |key| lookup(&format!("APP__{}", key.to_ascii_uppercase())));
}

fn apply_values(settings: &mut Settings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("backend_url") {
        settings.backend_url = v;
    }
    if let Some(v) = lookup("threshold_percentile") {
        match v.parse::<f64>() {
            Ok(parsed) => settings.threshold_percentile = parsed,
            Err(_) => warn!(value = %v, "ignoring unparsable threshold_percentile"),
        }
    }
    if let Some(v) = lookup("required_extension") {
        settings.required_extension = v;
    }
    if let Some(v) = lookup("request_timeout_secs") {
        match v.parse::<u64>() {
            Ok(parsed) => settings.request_timeout_secs = parsed,
            Err(_) => warn!(value = %v, "ignoring unparsable request_timeout_secs"),
        }
    }
}
