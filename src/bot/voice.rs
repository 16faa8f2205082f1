//! Songbird implementation of the voice transport.
//!
//! Each track gets its own songbird input. PCM written by the scheduler
//! travels through an in-memory duplex pipe, is converted from s16le to
//! the f32 samples [`RawAdapter`] expects, and is read by the songbird
//! mixer. Flushing closes the pipe and waits for songbird to report the
//! end of the track.

use async_trait::async_trait;
use parking_lot::Mutex;
use serenity::{
    cache::Cache,
    model::{
        channel::ChannelType,
        id::{ChannelId, GuildId},
    },
};
use songbird::{
    input::{Input, RawAdapter},
    tracks::TrackHandle,
    Call, Event, EventContext, EventHandler as VoiceEventHandler, Songbird, TrackEvent,
};
use std::{
    io::{self, Read, Seek, SeekFrom},
    sync::Arc,
};
use symphonia::core::io::MediaSource;
use tokio::{
    io::{AsyncWriteExt, DuplexStream},
    sync::oneshot,
};
use tokio_util::io::SyncIoBridge;
use tracing::{debug, info, warn};

use crate::{
    audio::transport::{PcmFormat, PcmOutput, VoiceConnection, VoiceGateway},
    error::{PlayerError, PlayerResult},
};

/// Bytes en vuelo entre el scheduler y el mixer (~1.3s de audio)
const PIPE_CAPACITY: usize = 256 * 1024;

/// Lectura cruda del pipe por vuelta
const READ_CHUNK: usize = 4096;

pub struct SongbirdGateway {
    songbird: Arc<Songbird>,
    cache: Arc<Cache>,
}

impl SongbirdGateway {
    pub fn new(songbird: Arc<Songbird>, cache: Arc<Cache>) -> Self {
        Self { songbird, cache }
    }

    /// Verifica en caché que la guild exista y que el canal sea de voz
    fn locate(&self, guild_id: GuildId, channel_id: ChannelId) -> PlayerResult<()> {
        let guild = self.cache.guild(guild_id).ok_or(PlayerError::GuildNotFound(guild_id))?;

        match guild.channels.get(&channel_id) {
            Some(channel) if matches!(channel.kind, ChannelType::Voice | ChannelType::Stage) => Ok(()),
            _ => Err(PlayerError::ChannelNotFound(channel_id)),
        }
    }
}

#[async_trait]
impl VoiceGateway for SongbirdGateway {
    async fn connect(&self, guild_id: GuildId, channel_id: ChannelId) -> PlayerResult<Arc<dyn VoiceConnection>> {
        self.locate(guild_id, channel_id)?;

        let call = self
            .songbird
            .join(guild_id, channel_id)
            .await
            .map_err(|e| PlayerError::Join(e.to_string()))?;

        info!("🔊 Conectado al canal de voz {} en guild {}", channel_id, guild_id);
        Ok(Arc::new(SongbirdConnection { call }))
    }
}

pub struct SongbirdConnection {
    call: Arc<tokio::sync::Mutex<Call>>,
}

#[async_trait]
impl VoiceConnection for SongbirdConnection {
    async fn is_connected(&self) -> bool {
        self.call.lock().await.current_connection().is_some()
    }

    async fn open_pcm_output(&self, format: PcmFormat) -> PlayerResult<Box<dyn PcmOutput>> {
        let (writer, reader) = tokio::io::duplex(PIPE_CAPACITY);
        let bridge = PcmBridge::new(SyncIoBridge::new(reader));
        let input: Input = RawAdapter::new(bridge, format.sample_rate, format.channels as u32).into();

        let handle = self.call.lock().await.play_only_input(input);

        let (tx, rx) = oneshot::channel();
        let ended = TrackEndHandler {
            sender: Arc::new(Mutex::new(Some(tx))),
        };
        for event in [TrackEvent::End, TrackEvent::Error] {
            handle
                .add_event(Event::Track(event), ended.clone())
                .map_err(|e| PlayerError::Transport(format!("Error al agregar event handler: {}", e)))?;
        }

        Ok(Box::new(SongbirdOutput {
            writer: Some(writer),
            handle,
            ended: Some(rx),
        }))
    }
}

/// Entrada PCM de un track en reproducción.
pub struct SongbirdOutput {
    writer: Option<DuplexStream>,
    handle: TrackHandle,
    ended: Option<oneshot::Receiver<()>>,
}

#[async_trait]
impl PcmOutput for SongbirdOutput {
    async fn write_all(&mut self, chunk: &[u8]) -> PlayerResult<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| PlayerError::Transport("pipe de audio cerrado".into()))?;

        writer
            .write_all(chunk)
            .await
            .map_err(|e| PlayerError::Transport(e.to_string()))
    }

    async fn flush(&mut self) -> PlayerResult<()> {
        if let Some(mut writer) = self.writer.take() {
            // EOF para el mixer; el track termina al vaciar el pipe
            writer.shutdown().await?;
        }

        if let Some(ended) = self.ended.take() {
            ended
                .await
                .map_err(|_| PlayerError::Transport("el track terminó sin aviso".into()))?;
        }
        Ok(())
    }

    async fn abort(&mut self) -> PlayerResult<()> {
        self.writer = None;
        self.ended = None;
        if let Err(e) = self.handle.stop() {
            debug!("El track ya estaba detenido: {}", e);
        }
        Ok(())
    }
}

impl Drop for SongbirdOutput {
    fn drop(&mut self) {
        if self.writer.is_some() {
            let _ = self.handle.stop();
        }
    }
}

/// Avisa una sola vez que songbird terminó (o abortó) el track
#[derive(Clone)]
struct TrackEndHandler {
    sender: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

#[async_trait]
impl VoiceEventHandler for TrackEndHandler {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        if let EventContext::Track(tracks) = ctx {
            for (state, _handle) in *tracks {
                debug!("Track finalizado en songbird: {:?}", state.playing);
            }
        }

        if let Some(sender) = self.sender.lock().take() {
            let _ = sender.send(());
        }

        None
    }
}

/// Convierte un flujo s16le en muestras f32 nativas para [`RawAdapter`].
pub struct PcmBridge<R> {
    inner: R,
    /// Byte suelto de una muestra partida entre lecturas
    carry: Option<u8>,
    ready: Vec<u8>,
    offset: usize,
}

impl<R: Read> PcmBridge<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            carry: None,
            ready: Vec::with_capacity(READ_CHUNK * 2),
            offset: 0,
        }
    }

    /// Rellena `ready`; devuelve `false` en EOF
    fn refill(&mut self) -> io::Result<bool> {
        let mut raw = [0u8; READ_CHUNK];

        loop {
            let n = self.inner.read(&mut raw)?;
            if n == 0 {
                if self.carry.take().is_some() {
                    warn!("Flujo PCM terminó con una muestra incompleta");
                }
                return Ok(false);
            }

            let mut bytes = Vec::with_capacity(n + 1);
            bytes.extend(self.carry.take());
            bytes.extend_from_slice(&raw[..n]);
            if bytes.len() % 2 == 1 {
                self.carry = bytes.pop();
            }

            self.ready.clear();
            self.offset = 0;
            for pair in bytes.chunks_exact(2) {
                let sample = i16::from_le_bytes([pair[0], pair[1]]);
                self.ready.extend_from_slice(&(sample as f32 / 32768.0).to_le_bytes());
            }

            if !self.ready.is_empty() {
                return Ok(true);
            }
        }
    }
}

impl<R: Read> Read for PcmBridge<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.offset >= self.ready.len() && !self.refill()? {
            return Ok(0);
        }

        let n = buf.len().min(self.ready.len() - self.offset);
        buf[..n].copy_from_slice(&self.ready[self.offset..self.offset + n]);
        self.offset += n;
        Ok(n)
    }
}

impl<R> Seek for PcmBridge<R> {
    fn seek(&mut self, _pos: SeekFrom) -> io::Result<u64> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "flujo PCM en vivo"))
    }
}

impl<R: Read + Send + Sync> MediaSource for PcmBridge<R> {
    fn is_seekable(&self) -> bool {
        false
    }

    fn byte_len(&self) -> Option<u64> {
        None
    }
}
