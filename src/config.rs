use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::{
    audio::transport::PcmFormat,
    sources::{pipeline::DEFAULT_LOUDNORM, PipelineSettings},
};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    // Discord
    pub discord_token: String,
    pub command_prefix: String,

    // Procesos externos
    pub ytdlp_path: String,
    pub ffmpeg_path: String,

    // Audio
    pub loudnorm_filter: String,
    pub audio_bitrate: String,
    pub copy_chunk_size: usize, // En bytes

    // Features
    pub enable_previews: bool,
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self::from_lookup(|key| std::env::var(key).ok())?;

        // Validar antes de devolver
        config.validate()?;

        Ok(config)
    }

    /// Construye la configuración a partir de una fuente de variables
    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let var = |key: &str, default: String| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(default)
        };

        Ok(Self {
            // Discord
            discord_token: lookup("DISCORD_TOKEN").context("DISCORD_TOKEN no está definido")?,
            command_prefix: var("COMMAND_PREFIX", defaults.command_prefix),

            // Procesos externos
            ytdlp_path: var("YTDLP_PATH", defaults.ytdlp_path),
            ffmpeg_path: var("FFMPEG_PATH", defaults.ffmpeg_path),

            // Audio
            loudnorm_filter: var("LOUDNORM_FILTER", defaults.loudnorm_filter),
            audio_bitrate: var("AUDIO_BITRATE", defaults.audio_bitrate),
            copy_chunk_size: var("COPY_CHUNK_SIZE", defaults.copy_chunk_size.to_string())
                .parse()
                .context("COPY_CHUNK_SIZE debe ser un entero")?,

            // Features
            enable_previews: var("ENABLE_PREVIEWS", defaults.enable_previews.to_string())
                .parse()
                .context("ENABLE_PREVIEWS debe ser true o false")?,
        })
    }

    /// Validates configuration values for correctness.
    ///
    /// # Validation Rules
    ///
    /// - The bot token must not be empty
    /// - Both external binaries must be named
    /// - The copy chunk must hold whole PCM frames (4 bytes each)
    pub fn validate(&self) -> Result<()> {
        if self.discord_token.trim().is_empty() {
            anyhow::bail!("DISCORD_TOKEN cannot be empty");
        }

        if self.ytdlp_path.trim().is_empty() || self.ffmpeg_path.trim().is_empty() {
            anyhow::bail!("Downloader and decoder paths must not be empty");
        }

        let frame = PcmFormat::DISCORD.frame_bytes();
        if self.copy_chunk_size == 0 || self.copy_chunk_size % frame != 0 {
            anyhow::bail!(
                "Copy chunk size must be a positive multiple of {} bytes, got: {}",
                frame,
                self.copy_chunk_size
            );
        }

        Ok(())
    }

    /// Ajustes del pipeline de procesos derivados de la configuración
    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            downloader: self.ytdlp_path.clone(),
            decoder: self.ffmpeg_path.clone(),
            loudnorm: self.loudnorm_filter.clone(),
            audio_bitrate: self.audio_bitrate.clone(),
            ..PipelineSettings::default()
        }
    }

    /// Returns a summary of the current configuration for logging.
    ///
    /// The token is never included.
    pub fn summary(&self) -> String {
        format!(
            "Config Summary:\n  \
            Commands: prefix '{}'\n  \
            Pipeline: {} -> {} ({})\n  \
            Audio: {} bytes/chunk ({}ms)\n  \
            Features: Previews={}",
            self.command_prefix,
            self.ytdlp_path,
            self.ffmpeg_path,
            self.audio_bitrate,
            self.copy_chunk_size,
            self.copy_chunk_size * 1000 / (PcmFormat::DISCORD.frame_bytes() * PcmFormat::DISCORD.sample_rate as usize),
            self.enable_previews
        )
    }
}

/// Default configuration values.
///
/// Used as fallbacks when environment variables are not provided.
impl Default for Config {
    fn default() -> Self {
        Self {
            // Discord (el token no tiene default)
            discord_token: String::new(),
            command_prefix: "!".to_string(),

            ytdlp_path: "yt-dlp".to_string(),
            ffmpeg_path: "ffmpeg".to_string(),

            loudnorm_filter: DEFAULT_LOUDNORM.to_string(),
            audio_bitrate: "384k".to_string(),
            copy_chunk_size: 3840, // 20ms s16 estéreo a 48kHz

            enable_previews: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults_apply_when_unset() {
        let config = from_pairs(&[("DISCORD_TOKEN", "abc")]).unwrap();
        assert_eq!(config.command_prefix, "!");
        assert_eq!(config.ytdlp_path, "yt-dlp");
        assert_eq!(config.ffmpeg_path, "ffmpeg");
        assert_eq!(config.audio_bitrate, "384k");
        assert_eq!(config.copy_chunk_size, 3840);
        assert!(config.enable_previews);
        config.validate().unwrap();
    }

    #[test]
    fn test_overrides_are_read() {
        let config = from_pairs(&[
            ("DISCORD_TOKEN", "abc"),
            ("COMMAND_PREFIX", "?"),
            ("YTDLP_PATH", "/opt/yt-dlp"),
            ("COPY_CHUNK_SIZE", "1920"),
            ("ENABLE_PREVIEWS", "false"),
        ])
        .unwrap();

        assert_eq!(config.command_prefix, "?");
        assert_eq!(config.copy_chunk_size, 1920);
        assert!(!config.enable_previews);

        let settings = config.pipeline_settings();
        assert_eq!(settings.downloader, "/opt/yt-dlp");
        assert_eq!(settings.decoder, "ffmpeg");
        assert_eq!(settings.preview_seconds, 3);
    }

    #[test]
    fn test_missing_token_fails() {
        assert!(from_pairs(&[]).is_err());
    }

    #[test]
    fn test_bad_numbers_fail() {
        assert!(from_pairs(&[("DISCORD_TOKEN", "abc"), ("COPY_CHUNK_SIZE", "mucho")]).is_err());
        assert!(from_pairs(&[("DISCORD_TOKEN", "abc"), ("ENABLE_PREVIEWS", "quizás")]).is_err());
    }

    #[test]
    fn test_validate_rejects_misaligned_chunks() {
        let mut config = Config {
            discord_token: "abc".into(),
            ..Config::default()
        };
        config.copy_chunk_size = 3841;
        assert!(config.validate().is_err());
        config.copy_chunk_size = 0;
        assert!(config.validate().is_err());
        config.copy_chunk_size = 4;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_values() {
        assert!(Config::default().validate().is_err());

        let config = Config {
            discord_token: "abc".into(),
            ffmpeg_path: " ".into(),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_summary_hides_token() {
        let config = Config {
            discord_token: "super-secreto".into(),
            ..Config::default()
        };
        let summary = config.summary();
        assert!(!summary.contains("super-secreto"));
        assert!(summary.contains("3840 bytes/chunk (20ms)"));
    }
}
