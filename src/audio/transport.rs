//! Boundaries between the playback core and the chat platform.
//!
//! The scheduler only talks to these traits. The serenity/songbird
//! implementations live in [`crate::bot`]; tests use in-memory fakes.

use async_trait::async_trait;
use serenity::model::id::{ChannelId, GuildId};
use std::{path::Path, sync::Arc};

use crate::error::PlayerResult;

/// Formato PCM que espera el transporte de voz.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl PcmFormat {
    /// s16le estéreo a 48kHz (estándar de Discord)
    pub const DISCORD: PcmFormat = PcmFormat {
        sample_rate: 48_000,
        channels: 2,
    };

    /// Bytes por frame (una muestra s16 por canal)
    pub fn frame_bytes(&self) -> usize {
        self.channels as usize * 2
    }
}

/// Establece conexiones de voz a partir del canal pedido.
#[async_trait]
pub trait VoiceGateway: Send + Sync {
    /// Falla con `GuildNotFound` / `ChannelNotFound` si la búsqueda no encuentra nada.
    async fn connect(&self, guild_id: GuildId, channel_id: ChannelId) -> PlayerResult<Arc<dyn VoiceConnection>>;
}

/// Conexión de voz activa, reutilizada entre tracks mientras siga conectada.
#[async_trait]
pub trait VoiceConnection: Send + Sync {
    async fn is_connected(&self) -> bool;

    async fn open_pcm_output(&self, format: PcmFormat) -> PlayerResult<Box<dyn PcmOutput>>;
}

/// Entrada de audio del transporte para un track.
#[async_trait]
pub trait PcmOutput: Send {
    async fn write_all(&mut self, chunk: &[u8]) -> PlayerResult<()>;

    /// Espera a que el transporte termine de reproducir lo escrito.
    async fn flush(&mut self) -> PlayerResult<()>;

    /// Descarta lo pendiente cuando el track fue interrumpido.
    async fn abort(&mut self) -> PlayerResult<()> {
        self.flush().await
    }
}

/// Canal de texto para avisos de estado; sus fallos nunca son críticos.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, text: &str) -> anyhow::Result<()>;

    async fn send_file(&self, path: &Path) -> anyhow::Result<()>;
}

#[cfg(test)]
pub mod fakes {
    //! In-memory transport used by the scheduler and service tests.

    use super::*;
    use crate::error::PlayerError;
    use parking_lot::Mutex;
    use std::{path::PathBuf, time::Duration};

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Played {
        Completed(Vec<u8>),
        Aborted(Vec<u8>),
    }

    #[derive(Default)]
    pub struct FakeState {
        pub connects: Vec<(GuildId, ChannelId)>,
        pub played: Vec<Played>,
        pub open_outputs: usize,
        pub connected: bool,
        /// Canales que la "guild" no conoce
        pub missing_channels: Vec<ChannelId>,
        /// Retardo por chunk escrito, para simular reproducción en tiempo real
        pub write_delay: Option<Duration>,
        /// Retardo del flush, como si el transporte aún estuviera sonando
        pub flush_delay: Option<Duration>,
        pub connect_delay: Option<Duration>,
        pub fail_writes: bool,
    }

    #[derive(Clone, Default)]
    pub struct FakeVoice {
        pub state: Arc<Mutex<FakeState>>,
    }

    impl FakeVoice {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_write_delay(delay: Duration) -> Self {
            let fake = Self::default();
            fake.state.lock().write_delay = Some(delay);
            fake
        }

        pub fn played(&self) -> Vec<Played> {
            self.state.lock().played.clone()
        }

        pub fn connects(&self) -> Vec<(GuildId, ChannelId)> {
            self.state.lock().connects.clone()
        }
    }

    #[async_trait]
    impl VoiceGateway for FakeVoice {
        async fn connect(&self, guild_id: GuildId, channel_id: ChannelId) -> PlayerResult<Arc<dyn VoiceConnection>> {
            let delay = self.state.lock().connect_delay;
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            let mut state = self.state.lock();
            if state.missing_channels.contains(&channel_id) {
                return Err(PlayerError::ChannelNotFound(channel_id));
            }
            state.connects.push((guild_id, channel_id));
            state.connected = true;
            Ok(Arc::new(self.clone()))
        }
    }

    #[async_trait]
    impl VoiceConnection for FakeVoice {
        async fn is_connected(&self) -> bool {
            self.state.lock().connected
        }

        async fn open_pcm_output(&self, format: PcmFormat) -> PlayerResult<Box<dyn PcmOutput>> {
            assert_eq!(format, PcmFormat::DISCORD);
            self.state.lock().open_outputs += 1;
            Ok(Box::new(FakeOutput {
                state: self.state.clone(),
                buffer: Vec::new(),
            }))
        }
    }

    pub struct FakeOutput {
        state: Arc<Mutex<FakeState>>,
        buffer: Vec<u8>,
    }

    #[async_trait]
    impl PcmOutput for FakeOutput {
        async fn write_all(&mut self, chunk: &[u8]) -> PlayerResult<()> {
            let (delay, fail) = {
                let state = self.state.lock();
                (state.write_delay, state.fail_writes)
            };
            if fail {
                return Err(PlayerError::Transport("socket cerrado".into()));
            }
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            self.buffer.extend_from_slice(chunk);
            Ok(())
        }

        async fn flush(&mut self) -> PlayerResult<()> {
            let delay = self.state.lock().flush_delay;
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            let mut state = self.state.lock();
            state.open_outputs -= 1;
            state.played.push(Played::Completed(std::mem::take(&mut self.buffer)));
            Ok(())
        }

        async fn abort(&mut self) -> PlayerResult<()> {
            let mut state = self.state.lock();
            state.open_outputs -= 1;
            state.played.push(Played::Aborted(std::mem::take(&mut self.buffer)));
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct RecordingNotifier {
        pub messages: Mutex<Vec<String>>,
        pub files: Mutex<Vec<PathBuf>>,
        /// Los avisos que contienen este texto tardan en enviarse
        pub slow: Option<(String, Duration)>,
    }

    impl RecordingNotifier {
        pub fn slow_for(needle: &str, delay: Duration) -> Self {
            Self {
                slow: Some((needle.to_string(), delay)),
                ..Self::default()
            }
        }

        pub fn messages(&self) -> Vec<String> {
            self.messages.lock().clone()
        }

        pub fn contains(&self, needle: &str) -> bool {
            self.messages.lock().iter().any(|m| m.contains(needle))
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn send(&self, text: &str) -> anyhow::Result<()> {
            if let Some((needle, delay)) = &self.slow {
                if text.contains(needle.as_str()) {
                    tokio::time::sleep(*delay).await;
                }
            }
            self.messages.lock().push(text.to_string());
            Ok(())
        }

        async fn send_file(&self, path: &Path) -> anyhow::Result<()> {
            self.files.lock().push(path.to_path_buf());
            Ok(())
        }
    }
}
