use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use serde::Serialize;
use std::path::Path;
use std::path::PathBuf;

/// Runtime configuration, loaded from a TOML file at startup and writable
/// back from the admin surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Secret API key of the hosted-checkout payment processor.
    pub payment_api_key: String,
    /// Shared secret used to verify payment webhook signatures.
    pub payment_webhook_secret: String,
    /// Application id of the external media transport.
    pub media_app_id: String,
    /// Signing certificate for media join tokens.
    pub media_app_certificate: String,
    /// Secret used to sign short-lived attachment bearer tokens.
    pub auth_token_secret: String,
    pub frontend_base_url: String,
    pub checkout_success_url: String,
    pub checkout_cancel_url: String,
    #[serde(default = "default_timer_tick_interval_sec")]
    pub timer_tick_interval_sec: u64,
    #[serde(default = "default_warning_threshold_minutes")]
    pub warning_threshold_minutes: u32,
    #[serde(default = "default_media_token_ttl_sec")]
    pub media_token_ttl_sec: u64,

    // We don't want the path to be part of the written file.
    #[serde(skip)]
    path: Option<PathBuf>,
}

fn default_timer_tick_interval_sec() -> u64 {
    2
}

fn default_warning_threshold_minutes() -> u32 {
    3
}

fn default_media_token_ttl_sec() -> u64 {
    7200
}

impl Settings {
    pub async fn new(settings_path: &Path) -> Result<Self> {
        let data = tokio::fs::read_to_string(settings_path)
            .await
            .with_context(|| format!("Failed to read settings at {settings_path:?}"))?;

        let mut settings =
            toml::from_str::<Settings>(&data).context("Unable to parse settings file")?;
        settings.path = Some(settings_path.to_path_buf());

        tracing::info!(?settings_path, "Read settings file");

        Ok(settings)
    }

    pub async fn write_to_file(&self) -> Result<()> {
        let path = self
            .path
            .as_ref()
            .context("Settings were not loaded from a file")?;

        let data = toml::to_string_pretty(self)?;
        tokio::fs::write(path, data.as_bytes())
            .await
            .with_context(|| format!("Failed to write settings to {path:?}"))
    }

    pub fn timer_tick_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timer_tick_interval_sec)
    }

    /// Settings arriving over the admin surface carry no file path; keep
    /// the one we originally loaded from.
    pub fn keep_path_from(&mut self, other: &Settings) {
        self.path = other.path.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn optional_knobs_fall_back_to_documented_defaults() {
        let settings: Settings = toml::from_str(
            r#"
            payment_api_key = "sk_test_123"
            payment_webhook_secret = "whsec_123"
            media_app_id = "app"
            media_app_certificate = "cert"
            auth_token_secret = "secret"
            frontend_base_url = "https://app.example.com"
            checkout_success_url = "https://app.example.com/payment-success"
            checkout_cancel_url = "https://app.example.com/payment-cancelled"
            "#,
        )
        .unwrap();

        assert_eq!(settings.timer_tick_interval_sec, 2);
        assert_eq!(settings.warning_threshold_minutes, 3);
        assert_eq!(settings.media_token_ttl_sec, 7200);
    }
}
