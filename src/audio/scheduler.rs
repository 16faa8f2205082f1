//! Per-session playback loop.
//!
//! A [`SessionScheduler`] owns the queue and voice connection of one guild
//! and runs at most one playback loop at a time. The "spawn a loop if none
//! is running" decision and the loop's "queue drained, go idle" decision
//! are taken under the same lock, so racing enqueues can never start two
//! loops nor strand a track in the queue.
//!
//! Skip and stop never run loop logic. They cancel the token of the track
//! being played; the pump checks it between every PCM chunk.

use parking_lot::Mutex;
use serenity::model::id::{ChannelId, GuildId};
use std::{sync::Arc, time::Duration};
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    queue::SessionQueue,
    track::Track,
    transport::{Notifier, PcmFormat, PcmOutput, VoiceConnection, VoiceGateway},
};
use crate::{
    error::{PlayerError, PlayerResult},
    sources::ResolverRegistry,
};

/// Estado del ciclo de reproducción de una sesión
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    /// Sin loop activo
    Idle,
    /// Estableciendo o verificando la conexión de voz
    Connecting,
    /// Bombeando el audio de un track
    Playing,
    /// Último track terminando con la cola vacía
    Draining,
}

impl PlaybackState {
    pub fn is_active(&self) -> bool {
        !matches!(self, PlaybackState::Idle)
    }
}

/// Resultado de reproducir un track completo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackOutcome {
    Finished,
    Interrupted,
}

/// Resultado de bombear un flujo PCM al transporte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpOutcome {
    Completed { bytes: u64 },
    Interrupted { bytes: u64 },
}

/// Vista de solo lectura de una sesión
#[derive(Debug, Clone)]
pub struct SessionStatus {
    pub state: PlaybackState,
    pub now_playing: Option<Track>,
    pub upcoming: Vec<Track>,
    pub remaining: Duration,
}

struct SessionState {
    queue: SessionQueue,
    playback: PlaybackState,
    voice_channel_id: Option<ChannelId>,
    notifier: Option<Arc<dyn Notifier>>,
    /// Cola de avisos hacia la tarea que los envía en orden
    outbox: Option<mpsc::UnboundedSender<(Arc<dyn Notifier>, String)>>,
    connection: Option<Arc<dyn VoiceConnection>>,
    now_playing: Option<Track>,
    current: Option<CancellationToken>,
    loops_started: u64,
}

pub struct SessionScheduler {
    guild_id: GuildId,
    registry: Arc<ResolverRegistry>,
    gateway: Arc<dyn VoiceGateway>,
    chunk_size: usize,
    inner: Mutex<SessionState>,
}

impl SessionScheduler {
    pub fn new(
        guild_id: GuildId,
        registry: Arc<ResolverRegistry>,
        gateway: Arc<dyn VoiceGateway>,
        chunk_size: usize,
    ) -> Self {
        Self {
            guild_id,
            registry,
            gateway,
            chunk_size: chunk_size.max(PcmFormat::DISCORD.frame_bytes()),
            inner: Mutex::new(SessionState {
                queue: SessionQueue::new(),
                playback: PlaybackState::Idle,
                voice_channel_id: None,
                notifier: None,
                outbox: None,
                connection: None,
                now_playing: None,
                current: None,
                loops_started: 0,
            }),
        }
    }

    /// Agrega un track y arranca el loop si no hay uno activo.
    ///
    /// Devuelve `true` si esta llamada inició un loop nuevo.
    pub fn enqueue(self: &Arc<Self>, track: Track, voice_channel_id: ChannelId, notifier: Arc<dyn Notifier>) -> bool {
        let title = track.display_line();
        let start_loop = {
            let mut state = self.inner.lock();
            state.voice_channel_id = Some(voice_channel_id);
            state.notifier = Some(notifier);
            state.queue.enqueue(track);

            if state.playback.is_active() {
                false
            } else {
                state.playback = PlaybackState::Playing;
                state.loops_started += 1;
                debug!("Loop #{} para guild {}", state.loops_started, self.guild_id);
                true
            }
        };

        self.notify(format!("➕ {} agregado a la cola", title));

        if start_loop {
            tokio::spawn(self.clone().play_loop());
        }
        start_loop
    }

    /// Interrumpe el track actual; el loop sigue con el siguiente
    pub fn skip(&self) -> bool {
        let state = self.inner.lock();
        match &state.current {
            Some(token) if !token.is_cancelled() => {
                info!("⏭️ Saltando track en guild {}", self.guild_id);
                token.cancel();
                true
            }
            _ => false,
        }
    }

    /// Vacía la cola e interrumpe el track actual.
    ///
    /// Devuelve cuántos tracks pendientes se descartaron.
    pub fn stop(&self) -> usize {
        let mut state = self.inner.lock();
        let dropped = state.queue.len();
        state.queue.clear();
        if let Some(token) = &state.current {
            token.cancel();
        }
        info!("⏹️ Reproducción detenida en guild {}", self.guild_id);
        dropped
    }

    #[cfg(test)]
    pub fn is_playing(&self) -> bool {
        self.inner.lock().playback.is_active()
    }

    #[cfg(test)]
    pub fn state(&self) -> PlaybackState {
        self.inner.lock().playback
    }

    #[cfg(test)]
    pub fn has_queued(&self) -> bool {
        self.inner.lock().queue.has_any()
    }

    #[cfg(test)]
    pub fn voice_channel_id(&self) -> Option<ChannelId> {
        self.inner.lock().voice_channel_id
    }

    /// Cantidad de loops lanzados desde que existe la sesión
    #[cfg(test)]
    pub fn loops_started(&self) -> u64 {
        self.inner.lock().loops_started
    }

    pub fn status(&self) -> SessionStatus {
        let state = self.inner.lock();
        SessionStatus {
            state: state.playback,
            now_playing: state.now_playing.clone(),
            upcoming: state.queue.snapshot(),
            remaining: state.queue.total_duration(),
        }
    }

    async fn play_loop(self: Arc<Self>) {
        info!("▶️ Loop de reproducción iniciado en guild {}", self.guild_id);

        while let Some((track, token)) = self.next_track() {
            let connection = match self.ensure_connection().await {
                Ok(connection) => connection,
                Err(e) if e.is_lookup_failure() => {
                    error!("❌ No se pudo conectar en guild {}: {}", self.guild_id, e);
                    self.notify(format!("❌ {}", e));
                    self.abort_loop();
                    return;
                }
                Err(e) => {
                    warn!("⚠️ Conexión fallida para {}: {}", track.title(), e);
                    self.notify(format!("⚠️ No se pudo reproducir `{}`: {}", track.title(), e));
                    continue;
                }
            };

            self.set_state(PlaybackState::Playing);
            self.notify(format!("🎶 Reproduciendo {}", track.display_line()));

            match self.stream_track(&track, connection.as_ref(), &token).await {
                Ok(TrackOutcome::Finished) => info!("✅ Track terminado: {}", track.title()),
                Ok(TrackOutcome::Interrupted) => info!("⏭️ Track interrumpido: {}", track.title()),
                Err(e) => {
                    warn!("⚠️ Error reproduciendo {}: {}", track.title(), e);
                    self.notify(format!("⚠️ Error durante la reproducción de `{}`: {}", track.title(), e));
                }
            }
        }

        info!("📭 Cola vacía, loop terminado en guild {}", self.guild_id);
    }

    /// Saca el siguiente track, o pasa a `Idle` si la cola está vacía
    fn next_track(&self) -> Option<(Track, CancellationToken)> {
        let mut state = self.inner.lock();
        state.current = None;
        state.now_playing = None;

        match state.queue.dequeue() {
            Some(track) => {
                let token = CancellationToken::new();
                state.current = Some(token.clone());
                state.now_playing = Some(track.clone());
                Some((track, token))
            }
            None => {
                state.playback = PlaybackState::Idle;
                None
            }
        }
    }

    /// El loop termina sin tocar lo que queda en cola; el próximo enqueue lo retoma
    fn abort_loop(&self) {
        let mut state = self.inner.lock();
        state.current = None;
        state.now_playing = None;
        state.playback = PlaybackState::Idle;
    }

    fn set_state(&self, playback: PlaybackState) {
        self.inner.lock().playback = playback;
    }

    fn mark_draining_if_empty(&self) {
        let mut state = self.inner.lock();
        if !state.queue.has_any() {
            state.playback = PlaybackState::Draining;
        }
    }

    /// Reutiliza la conexión si sigue viva; si no, conecta al canal más reciente
    async fn ensure_connection(&self) -> PlayerResult<Arc<dyn VoiceConnection>> {
        let (cached, channel_id) = {
            let state = self.inner.lock();
            (state.connection.clone(), state.voice_channel_id)
        };

        if let Some(connection) = cached {
            if connection.is_connected().await {
                return Ok(connection);
            }
            debug!("Conexión de voz caída en guild {}, reconectando", self.guild_id);
        }

        let channel_id = channel_id.ok_or_else(|| PlayerError::Transport("sin canal de voz asignado".into()))?;

        self.set_state(PlaybackState::Connecting);
        info!("🔗 Conectando al canal {} en guild {}", channel_id, self.guild_id);
        let connection = self.gateway.connect(self.guild_id, channel_id).await?;

        self.inner.lock().connection = Some(connection.clone());
        Ok(connection)
    }

    async fn stream_track(
        &self,
        track: &Track,
        connection: &dyn VoiceConnection,
        token: &CancellationToken,
    ) -> PlayerResult<TrackOutcome> {
        if token.is_cancelled() {
            return Ok(TrackOutcome::Interrupted);
        }

        let mut stream = self.registry.open_audio_stream(track.url()).await?;
        let mut output = connection.open_pcm_output(PcmFormat::DISCORD).await?;

        match pump_pcm(&mut stream, output.as_mut(), token, self.chunk_size).await {
            Ok(PumpOutcome::Completed { bytes }) => {
                debug!("{} bytes PCM enviados para {}", bytes, track.title());

                // Un downloader o decoder que salió con error es un fallo del track
                if let Err(e) = stream.close().await {
                    if let Err(flush_err) = output.flush().await {
                        debug!("Flush tras error también falló: {}", flush_err);
                    }
                    return Err(e);
                }
                self.mark_draining_if_empty();

                // Se puede saltar mientras el transporte termina de sonar
                let flushed = tokio::select! {
                    biased;
                    _ = token.cancelled() => None,
                    flushed = output.flush() => Some(flushed),
                };

                match flushed {
                    Some(result) => result.map(|_| TrackOutcome::Finished),
                    None => output.abort().await.map(|_| TrackOutcome::Interrupted),
                }
            }
            Ok(PumpOutcome::Interrupted { bytes }) => {
                debug!("Track interrumpido tras {} bytes", bytes);
                drop(stream);
                output.abort().await?;
                Ok(TrackOutcome::Interrupted)
            }
            Err(e) => {
                drop(stream);
                if let Err(flush_err) = output.flush().await {
                    debug!("Flush tras error también falló: {}", flush_err);
                }
                Err(e)
            }
        }
    }

    /// Encola un aviso sin esperar; una sola tarea por sesión los envía en orden
    /// y sus fallos solo se registran.
    fn notify(&self, text: String) {
        let mut state = self.inner.lock();
        let Some(notifier) = state.notifier.clone() else {
            return;
        };

        let outbox = state.outbox.get_or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(deliver_notifications(self.guild_id, rx));
            tx
        });
        if outbox.send((notifier, text)).is_err() {
            warn!("Tarea de avisos cerrada en guild {}", self.guild_id);
        }
    }
}

async fn deliver_notifications(guild_id: GuildId, mut rx: mpsc::UnboundedReceiver<(Arc<dyn Notifier>, String)>) {
    while let Some((notifier, text)) = rx.recv().await {
        if let Err(e) = notifier.send(&text).await {
            warn!("No se pudo enviar aviso en guild {}: {:?}", guild_id, e);
        }
    }
    debug!("Tarea de avisos terminada en guild {}", guild_id);
}

/// Copia PCM al transporte chunk a chunk, atento a la cancelación entre chunks.
pub async fn pump_pcm<R>(
    stream: &mut R,
    output: &mut dyn PcmOutput,
    token: &CancellationToken,
    chunk_size: usize,
) -> PlayerResult<PumpOutcome>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = vec![0u8; chunk_size];
    let mut bytes = 0u64;

    loop {
        let read = tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(PumpOutcome::Interrupted { bytes }),
            read = stream.read(&mut buf) => read?,
        };

        if read == 0 {
            return Ok(PumpOutcome::Completed { bytes });
        }

        tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(PumpOutcome::Interrupted { bytes }),
            written = output.write_all(&buf[..read]) => written?,
        }
        bytes += read as u64;
    }
}
