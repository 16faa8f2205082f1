//! Downloader → decoder process pipeline.
//!
//! Two child processes connected by a copy task: the downloader writes the
//! compressed audio to its stdout, a background task feeds it into the
//! decoder's stdin, and the decoder's stdout (raw PCM) is handed back to the
//! caller right away. Nothing is buffered beyond the OS pipes.
//!
//! The returned [`AudioStream`] owns the whole pipeline. Dropping it kills
//! the decoder, cancels the copy task and with it the downloader.

use std::{
    io,
    pin::Pin,
    process::Stdio,
    task::{Context, Poll},
};

use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader, ReadBuf},
    process::{Child, ChildStdin, ChildStdout, Command},
    sync::oneshot,
};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use crate::{
    audio::transport::PcmFormat,
    error::{PlayerError, PlayerResult},
};

/// Perfil de normalización por defecto para el decoder
pub const DEFAULT_LOUDNORM: &str = "loudnorm=I=-16:TP=-1.5:LRA=11:measured_I=-11.8:measured_TP=0.5:measured_LRA=7.8:measured_thresh=-21.9:offset=0:linear=true";

/// Programa externo más sus argumentos.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl ProcessSpec {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).kill_on_drop(true);
        cmd
    }
}

/// Binarios y parámetros de los procesos externos.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub downloader: String,
    pub decoder: String,
    pub loudnorm: String,
    pub audio_bitrate: String,
    pub preview_seconds: u32,
    pub preview_width: u32,
    pub preview_fps: u32,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            downloader: "yt-dlp".to_string(),
            decoder: "ffmpeg".to_string(),
            loudnorm: DEFAULT_LOUDNORM.to_string(),
            audio_bitrate: "384k".to_string(),
            preview_seconds: 3,
            preview_width: 720,
            preview_fps: 10,
        }
    }
}

impl PipelineSettings {
    /// yt-dlp en modo "mejor audio a stdout"
    pub fn downloader_spec(&self, locator: &str) -> ProcessSpec {
        ProcessSpec::new(&self.downloader, ["-f", "bestaudio", "-o", "-", "--no-playlist", locator])
    }

    /// ffmpeg: audio comprimido por stdin, PCM s16le normalizado por stdout
    pub fn decoder_spec(&self, format: PcmFormat) -> ProcessSpec {
        ProcessSpec::new(
            &self.decoder,
            [
                "-hide_banner".to_string(),
                "-loglevel".to_string(),
                "error".to_string(),
                "-i".to_string(),
                "pipe:0".to_string(),
                "-af".to_string(),
                self.loudnorm.clone(),
                "-b:a".to_string(),
                self.audio_bitrate.clone(),
                "-ac".to_string(),
                format.channels.to_string(),
                "-ar".to_string(),
                format.sample_rate.to_string(),
                "-f".to_string(),
                "s16le".to_string(),
                "pipe:1".to_string(),
            ],
        )
    }
}

/// Procesos vivos detrás de un [`AudioStream`].
struct Pipeline {
    decoder: Child,
    decoder_name: String,
    downloader_pid: Option<u32>,
    /// Salida del downloader, informada por la tarea de copia
    downloader_exit: oneshot::Receiver<PlayerResult<()>>,
    _feeder: DropGuard,
}

/// Flujo de bytes PCM de un track.
pub struct AudioStream {
    reader: Box<dyn AsyncRead + Send + Unpin>,
    pipeline: Option<Pipeline>,
}

impl AudioStream {
    pub fn from_reader<R>(reader: R) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        Self {
            reader: Box::new(reader),
            pipeline: None,
        }
    }

    /// Flujo válido pero sin audio
    #[cfg(test)]
    pub fn empty() -> Self {
        Self::from_reader(tokio::io::empty())
    }

    pub fn is_process_backed(&self) -> bool {
        self.pipeline.is_some()
    }

    /// PIDs de downloader y decoder
    #[cfg(test)]
    fn process_ids(&self) -> (Option<u32>, Option<u32>) {
        match &self.pipeline {
            Some(pipeline) => (pipeline.downloader_pid, pipeline.decoder.id()),
            None => (None, None),
        }
    }

    /// Espera la salida de ambos procesos tras leer todo el stdout del decoder.
    ///
    /// Una salida con error de cualquiera de los dos es un error del track;
    /// el downloader se informa primero porque suele ser la causa. Un track
    /// interrumpido no pasa por aquí: se suelta con `drop` y sus procesos se
    /// matan.
    pub async fn close(mut self) -> PlayerResult<()> {
        let Some(mut pipeline) = self.pipeline.take() else {
            return Ok(());
        };

        match pipeline.downloader_exit.await {
            Ok(result) => result?,
            Err(_) => debug!("La tarea de copia terminó sin informar al downloader"),
        }

        let status = pipeline
            .decoder
            .wait()
            .await
            .map_err(|e| PlayerError::process(&pipeline.decoder_name, e))?;
        if !status.success() {
            return Err(PlayerError::process(&pipeline.decoder_name, format!("terminó con {}", status)));
        }

        debug!(
            "{} terminó correctamente (downloader pid {:?})",
            pipeline.decoder_name, pipeline.downloader_pid
        );
        Ok(())
    }
}

impl AsyncRead for AudioStream {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.reader).poll_read(cx, buf)
    }
}

impl std::fmt::Debug for AudioStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioStream")
            .field("process_backed", &self.is_process_backed())
            .finish()
    }
}

/// Lanza downloader y decoder conectados y devuelve el stdout del decoder.
pub fn spawn_pipeline(downloader: &ProcessSpec, decoder: &ProcessSpec, locator: &str) -> PlayerResult<AudioStream> {
    let mut downloader_child = downloader
        .command()
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| PlayerError::process(&downloader.program, e))?;

    // Si el decoder no arranca, el downloader se mata al soltar su handle
    let mut decoder_child = decoder
        .command()
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| PlayerError::process(&decoder.program, e))?;

    let source = downloader_child
        .stdout
        .take()
        .ok_or_else(|| PlayerError::process(&downloader.program, "stdout no disponible"))?;
    let sink = decoder_child
        .stdin
        .take()
        .ok_or_else(|| PlayerError::process(&decoder.program, "stdin no disponible"))?;
    let pcm = decoder_child
        .stdout
        .take()
        .ok_or_else(|| PlayerError::process(&decoder.program, "stdout no disponible"))?;

    if let Some(stderr) = downloader_child.stderr.take() {
        tokio::spawn(drain_diagnostics(downloader.program.clone(), locator.to_string(), stderr));
    }
    if let Some(stderr) = decoder_child.stderr.take() {
        tokio::spawn(drain_diagnostics(decoder.program.clone(), locator.to_string(), stderr));
    }

    let downloader_pid = downloader_child.id();
    let (exit_tx, exit_rx) = oneshot::channel();
    let cancel = CancellationToken::new();
    tokio::spawn(feed_decoder(
        downloader_child,
        downloader.program.clone(),
        source,
        sink,
        exit_tx,
        cancel.clone(),
    ));

    info!("🔧 Pipeline {} → {} iniciado para {}", downloader.program, decoder.program, locator);

    Ok(AudioStream {
        reader: Box::new(pcm),
        pipeline: Some(Pipeline {
            decoder: decoder_child,
            decoder_name: decoder.program.clone(),
            downloader_pid,
            downloader_exit: exit_rx,
            _feeder: cancel.drop_guard(),
        }),
    })
}

/// Copia stdout del downloader a stdin del decoder hasta EOF y cierra la entrada.
async fn feed_decoder(
    mut downloader: Child,
    program: String,
    mut source: ChildStdout,
    mut sink: ChildStdin,
    exit: oneshot::Sender<PlayerResult<()>>,
    cancel: CancellationToken,
) {
    let copied = tokio::select! {
        _ = cancel.cancelled() => {
            debug!("Pipeline soltado, cancelando {}", program);
            return;
        }
        copied = tokio::io::copy(&mut source, &mut sink) => copied,
    };

    match copied {
        Ok(bytes) => debug!("{} entregó {} bytes al decoder", program, bytes),
        // El decoder puede cerrar antes (track interrumpido); no es fatal
        Err(e) => warn!("⚠️ Error en el pipe {} → decoder: {}", program, e),
    }

    if let Err(e) = sink.shutdown().await {
        debug!("No se pudo cerrar stdin del decoder: {}", e);
    }
    drop(sink);

    let result = match downloader.wait().await {
        Ok(status) if status.success() => Ok(()),
        Ok(status) => {
            warn!("⚠️ {} terminó con {}", program, status);
            Err(PlayerError::process(&program, format!("terminó con {}", status)))
        }
        Err(e) => Err(PlayerError::process(&program, e)),
    };
    // El receptor ya no existe si el flujo se soltó
    let _ = exit.send(result);
}

/// Vuelca stderr de un proceso como líneas de log; nunca falla.
async fn drain_diagnostics<R>(program: String, locator: String, stderr: R)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => continue,
            Ok(Some(line)) => warn!(program = %program, locator = %locator, "{}", line),
            Ok(None) => break,
            Err(e) => {
                debug!("stderr de {} ilegible: {}", program, e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_downloader_streams_best_audio_to_stdout() {
        let settings = PipelineSettings::default();
        let spec = settings.downloader_spec("https://youtu.be/abc");
        assert_eq!(spec.program, "yt-dlp");
        assert_eq!(spec.args, vec!["-f", "bestaudio", "-o", "-", "--no-playlist", "https://youtu.be/abc"]);
    }

    #[test]
    fn test_decoder_emits_fixed_pcm_format() {
        let settings = PipelineSettings::default();
        let spec = settings.decoder_spec(PcmFormat::DISCORD);
        assert_eq!(spec.program, "ffmpeg");

        let args = spec.args.join(" ");
        assert!(args.contains("-i pipe:0"));
        assert!(args.contains("-ac 2"));
        assert!(args.contains("-ar 48000"));
        assert!(args.ends_with("-f s16le pipe:1"));
        assert!(args.contains(&format!("-af {}", DEFAULT_LOUDNORM)));
    }

    #[tokio::test]
    async fn test_empty_stream_reads_nothing() {
        let mut stream = AudioStream::empty();
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert!(out.is_empty());
        assert!(!stream.is_process_backed());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_pipeline_pipes_downloader_into_decoder() {
        let downloader = ProcessSpec::new("sh", ["-c", "printf 'hola mundo'; echo 'aviso' >&2"]);
        let decoder = ProcessSpec::new("tr", ["a-z", "A-Z"]);

        let mut stream = spawn_pipeline(&downloader, &decoder, "test://pipe").unwrap();
        assert!(stream.is_process_backed());

        let mut out = Vec::new();
        // EOF solo llega si el stdin del decoder se cerró tras el downloader
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"HOLA MUNDO".to_vec());
        stream.close().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_downloader_fails_the_stream() {
        let downloader = ProcessSpec::new("sh", ["-c", "echo 'ERROR: Video unavailable' >&2; exit 1"]);
        let decoder = ProcessSpec::new("cat", Vec::<String>::new());

        let mut stream = spawn_pipeline(&downloader, &decoder, "test://gone").unwrap();
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert!(out.is_empty());

        match stream.close().await.unwrap_err() {
            PlayerError::Process { program, message } => {
                assert_eq!(program, "sh");
                assert!(message.contains('1'), "mensaje: {message}");
            }
            other => panic!("error inesperado: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_decoder_fails_the_stream() {
        let downloader = ProcessSpec::new("printf", ["datos"]);
        let decoder = ProcessSpec::new("sh", ["-c", "cat > /dev/null; exit 2"]);

        let mut stream = spawn_pipeline(&downloader, &decoder, "test://corrupt").unwrap();
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();

        let err = stream.close().await.unwrap_err();
        assert!(matches!(err, PlayerError::Process { ref program, .. } if program == "sh"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_missing_binary_is_a_process_error() {
        let downloader = ProcessSpec::new("definitely-not-a-real-binary-xyz", Vec::<String>::new());
        let decoder = ProcessSpec::new("cat", Vec::<String>::new());

        let err = spawn_pipeline(&downloader, &decoder, "test://missing").unwrap_err();
        match err {
            PlayerError::Process { program, .. } => assert_eq!(program, "definitely-not-a-real-binary-xyz"),
            other => panic!("error inesperado: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_dropping_stream_releases_endless_pipeline() {
        let downloader = ProcessSpec::new("yes", Vec::<String>::new());
        let decoder = ProcessSpec::new("cat", Vec::<String>::new());

        let mut stream = spawn_pipeline(&downloader, &decoder, "test://endless").unwrap();
        let mut buf = [0u8; 64];
        let n = stream.read(&mut buf).await.unwrap();
        assert!(n > 0);

        let (Some(downloader_pid), Some(decoder_pid)) = stream.process_ids() else {
            panic!("ambos procesos debían tener pid");
        };
        assert!(process_alive(downloader_pid));
        assert!(process_alive(decoder_pid));

        drop(stream);

        for _ in 0..100 {
            if !process_alive(downloader_pid) && !process_alive(decoder_pid) {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        panic!("los procesos siguen vivos tras soltar el flujo");
    }

    /// Un zombie cuenta como muerto: ya recibió la señal
    #[cfg(unix)]
    fn process_alive(pid: u32) -> bool {
        if let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            let state = stat.rsplit(')').next().and_then(|rest| rest.split_whitespace().next());
            return !matches!(state, Some("Z") | Some("X"));
        }
        if std::path::Path::new("/proc/self").exists() {
            return false;
        }
        std::process::Command::new("kill")
            .args(["-0", &pid.to_string()])
            .stderr(Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }
}
