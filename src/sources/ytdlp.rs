use async_trait::async_trait;
use serde::Deserialize;
use std::{path::PathBuf, process::Stdio, sync::Arc, time::Duration};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{
    pipeline::{spawn_pipeline, AudioStream, PipelineSettings, ProcessSpec},
    MediaResolver,
};
use crate::{
    audio::{track::Track, transport::PcmFormat},
    error::{PlayerError, PlayerResult},
};

/// Descriptor de una plataforma servida por yt-dlp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Platform {
    pub name: &'static str,
    /// Subcadenas de dominio que identifican la plataforma
    pub markers: &'static [&'static str],
    /// Si la plataforma tiene video para generar previews
    pub previews: bool,
}

impl Platform {
    pub const YOUTUBE: Platform = Platform {
        name: "YouTube",
        markers: &["youtube.com", "youtu.be"],
        previews: true,
    };

    pub const SOUNDCLOUD: Platform = Platform {
        name: "SoundCloud",
        markers: &["soundcloud.com"],
        previews: false,
    };

    pub fn matches(&self, locator: &str) -> bool {
        self.markers.iter().any(|marker| locator.contains(marker))
    }
}

/// Información extraída de yt-dlp --dump-json
#[derive(Debug, Deserialize)]
struct YtDlpInfo {
    title: String,
    uploader: Option<String>,
    channel: Option<String>,
    duration: Option<f64>,
}

/// Resolver genérico: yt-dlp para metadata y descarga, ffmpeg para decodificar.
pub struct YtDlpResolver {
    platform: Platform,
    settings: Arc<PipelineSettings>,
}

impl YtDlpResolver {
    pub fn new(platform: Platform, settings: Arc<PipelineSettings>) -> Self {
        Self { platform, settings }
    }

    fn metadata_spec(&self, locator: &str) -> ProcessSpec {
        ProcessSpec::new(
            &self.settings.downloader,
            ["--dump-json", "--no-playlist", "--skip-download", "--no-warnings", locator],
        )
    }

    fn preview_url_spec(&self, locator: &str) -> ProcessSpec {
        ProcessSpec::new(&self.settings.downloader, ["-f", "bestvideo", "-g", "--no-playlist", locator])
    }

    fn preview_clip_spec(&self, direct_url: &str, output: &str) -> ProcessSpec {
        let filter = format!(
            "scale={}:-1:force_original_aspect_ratio=decrease,fps={}",
            self.settings.preview_width, self.settings.preview_fps
        );
        ProcessSpec::new(
            &self.settings.decoder,
            [
                "-hide_banner".to_string(),
                "-loglevel".to_string(),
                "error".to_string(),
                "-ss".to_string(),
                "0".to_string(),
                "-t".to_string(),
                self.settings.preview_seconds.to_string(),
                "-i".to_string(),
                direct_url.to_string(),
                "-vf".to_string(),
                filter,
                "-vcodec".to_string(),
                "libwebp_anim".to_string(),
                "-q:v".to_string(),
                "66".to_string(),
                "-loop".to_string(),
                "0".to_string(),
                "-y".to_string(),
                output.to_string(),
            ],
        )
    }
}

/// Ejecuta un proceso hasta el final y devuelve su stdout
async fn run_to_completion(spec: &ProcessSpec) -> PlayerResult<String> {
    let output = Command::new(&spec.program)
        .args(&spec.args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| PlayerError::process(&spec.program, e))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let reason = stderr
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("error desconocido")
            .to_string();
        return Err(PlayerError::process(&spec.program, format!("{} ({})", reason, output.status)));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Convierte la respuesta JSON de yt-dlp en un [`Track`]
fn parse_metadata(locator: &str, json: &str) -> PlayerResult<Track> {
    let info: YtDlpInfo = serde_json::from_str(json.trim()).map_err(|e| PlayerError::Metadata {
        locator: locator.to_string(),
        message: e.to_string(),
    })?;

    let author = info
        .channel
        .or(info.uploader)
        .filter(|a| !a.trim().is_empty())
        .unwrap_or_else(|| "Unknown".to_string());
    let duration = info
        .duration
        .filter(|d| d.is_finite() && *d >= 0.0)
        .map(Duration::from_secs_f64)
        .unwrap_or_default();

    Ok(Track::new(locator, info.title, author, duration))
}

/// Primera URL directa impresa por `yt-dlp -g`
fn first_url(stdout: &str) -> Option<&str> {
    stdout.lines().map(str::trim).find(|l| !l.is_empty())
}

#[async_trait]
impl MediaResolver for YtDlpResolver {
    fn name(&self) -> &'static str {
        self.platform.name
    }

    fn identify(&self, locator: &str) -> bool {
        self.platform.matches(locator)
    }

    async fn fetch_metadata(&self, locator: &str) -> PlayerResult<Track> {
        debug!("📊 Obteniendo info de: {}", locator);
        let stdout = run_to_completion(&self.metadata_spec(locator)).await?;
        parse_metadata(locator, &stdout)
    }

    async fn open_audio_stream(&self, locator: &str) -> PlayerResult<AudioStream> {
        info!("🎵 Abriendo stream de {} para: {}", self.platform.name, locator);
        spawn_pipeline(
            &self.settings.downloader_spec(locator),
            &self.settings.decoder_spec(PcmFormat::DISCORD),
            locator,
        )
    }

    async fn fetch_preview(&self, locator: &str) -> PlayerResult<Option<PathBuf>> {
        if !self.platform.previews {
            return Ok(None);
        }

        let stdout = run_to_completion(&self.preview_url_spec(locator)).await?;
        let direct_url = first_url(&stdout)
            .ok_or_else(|| PlayerError::process(&self.settings.downloader, "sin URL de video"))?
            .to_string();

        let path = tempfile::Builder::new()
            .prefix("preview-")
            .suffix(".webp")
            .tempfile()?
            .into_temp_path()
            .keep()
            .map_err(|e| PlayerError::Io(e.error))?;

        info!("🖼️ Descargando preview: {}", path.display());
        let clip = self.preview_clip_spec(&direct_url, &path.to_string_lossy());
        if let Err(e) = run_to_completion(&clip).await {
            if let Err(rm) = tokio::fs::remove_file(&path).await {
                warn!("No se pudo borrar preview fallida {}: {}", path.display(), rm);
            }
            return Err(e);
        }
        info!("✅ Preview descargada: {}", path.display());

        Ok(Some(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn resolver(platform: Platform) -> YtDlpResolver {
        YtDlpResolver::new(platform, Arc::new(PipelineSettings::default()))
    }

    #[test]
    fn test_youtube_markers() {
        let yt = resolver(Platform::YOUTUBE);
        assert!(yt.identify("https://www.youtube.com/watch?v=dQw4w9WgXcQ"));
        assert!(yt.identify("https://youtu.be/dQw4w9WgXcQ"));
        assert!(yt.identify("https://music.youtube.com/watch?v=test"));
        assert!(!yt.identify("https://soundcloud.com/a/b"));
        assert_eq!(yt.name(), "YouTube");
    }

    #[test]
    fn test_soundcloud_markers() {
        let sc = resolver(Platform::SOUNDCLOUD);
        assert!(sc.identify("https://soundcloud.com/artist/track"));
        assert!(!sc.identify("https://youtu.be/x"));
    }

    #[test]
    fn test_parse_metadata_prefers_channel() {
        let json = r#"{"title":"Song","uploader":"Uploader","channel":"Channel","duration":212.4}"#;
        let track = parse_metadata("https://youtu.be/x", json).unwrap();
        assert_eq!(track.title(), "Song");
        assert_eq!(track.author(), "Channel");
        assert_eq!(track.url(), "https://youtu.be/x");
        assert_eq!(track.duration().as_secs(), 212);
    }

    #[test]
    fn test_parse_metadata_missing_fields() {
        let json = r#"{"title":"Live radio","duration":null}"#;
        let track = parse_metadata("https://youtu.be/live", json).unwrap();
        assert_eq!(track.author(), "Unknown");
        assert_eq!(track.duration(), Duration::ZERO);
    }

    #[test]
    fn test_parse_metadata_rejects_garbage() {
        let err = parse_metadata("https://youtu.be/x", "ERROR: not json").unwrap_err();
        assert!(matches!(err, PlayerError::Metadata { .. }));
    }

    #[test]
    fn test_first_url_skips_blank_lines() {
        assert_eq!(first_url("\n  https://cdn/video.mp4 \nhttps://cdn/audio\n"), Some("https://cdn/video.mp4"));
        assert_eq!(first_url("  \n"), None);
    }

    #[test]
    fn test_preview_clip_args() {
        let yt = resolver(Platform::YOUTUBE);
        let spec = yt.preview_clip_spec("https://cdn/video.mp4", "/tmp/p.webp");
        let args = spec.args.join(" ");
        assert_eq!(spec.program, "ffmpeg");
        assert!(args.contains("-ss 0 -t 3 -i https://cdn/video.mp4"));
        assert!(args.contains("scale=720:-1:force_original_aspect_ratio=decrease,fps=10"));
        assert!(args.ends_with("-loop 0 -y /tmp/p.webp"));
    }

    #[tokio::test]
    async fn test_soundcloud_has_no_preview() {
        let sc = resolver(Platform::SOUNDCLOUD);
        assert_eq!(sc.fetch_preview("https://soundcloud.com/a/b").await.unwrap(), None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_process_reports_last_stderr_line() {
        let spec = ProcessSpec::new("sh", ["-c", "echo 'primera' >&2; echo 'ERROR: Video unavailable' >&2; exit 1"]);
        let err = run_to_completion(&spec).await.unwrap_err();
        match err {
            PlayerError::Process { program, message } => {
                assert_eq!(program, "sh");
                assert!(message.starts_with("ERROR: Video unavailable"));
            }
            other => panic!("error inesperado: {other:?}"),
        }
    }
}
