use dashmap::DashMap;
use serenity::model::id::{ChannelId, GuildId};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::{
    scheduler::{SessionScheduler, SessionStatus},
    track::Track,
    transport::{Notifier, VoiceGateway},
};
use crate::{
    error::{PlayerError, PlayerResult},
    sources::{PreviewAsset, ResolverRegistry},
};

/// Mapa guild → scheduler; las entradas se crean en el primer enqueue y nunca se borran.
pub struct SchedulerDirectory {
    schedulers: DashMap<GuildId, Arc<SessionScheduler>>,
    registry: Arc<ResolverRegistry>,
    gateway: Arc<dyn VoiceGateway>,
    chunk_size: usize,
}

impl SchedulerDirectory {
    pub fn new(registry: Arc<ResolverRegistry>, gateway: Arc<dyn VoiceGateway>, chunk_size: usize) -> Self {
        Self {
            schedulers: DashMap::new(),
            registry,
            gateway,
            chunk_size,
        }
    }

    /// Único punto de creación de schedulers
    pub fn get_or_create(&self, guild_id: GuildId) -> Arc<SessionScheduler> {
        self.schedulers
            .entry(guild_id)
            .or_insert_with(|| {
                info!("🆕 Nueva sesión de reproducción para guild {}", guild_id);
                Arc::new(SessionScheduler::new(
                    guild_id,
                    self.registry.clone(),
                    self.gateway.clone(),
                    self.chunk_size,
                ))
            })
            .clone()
    }

    pub fn get(&self, guild_id: GuildId) -> Option<Arc<SessionScheduler>> {
        self.schedulers.get(&guild_id).map(|s| s.clone())
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.schedulers.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.schedulers.is_empty()
    }
}

/// Punto de entrada de los comandos de chat.
pub struct PlayerService {
    directory: SchedulerDirectory,
    registry: Arc<ResolverRegistry>,
    previews: bool,
}

impl PlayerService {
    pub fn new(
        registry: Arc<ResolverRegistry>,
        gateway: Arc<dyn VoiceGateway>,
        chunk_size: usize,
        previews: bool,
    ) -> Self {
        Self {
            directory: SchedulerDirectory::new(registry.clone(), gateway, chunk_size),
            registry,
            previews,
        }
    }

    #[cfg(test)]
    pub fn directory(&self) -> &SchedulerDirectory {
        &self.directory
    }

    /// Resuelve el localizador y lo agrega a la cola de la guild.
    ///
    /// La metadata se resuelve antes de tocar el directorio, así un pedido
    /// inválido nunca crea una sesión.
    pub async fn enqueue(
        &self,
        guild_id: GuildId,
        voice_channel_id: ChannelId,
        locator: &str,
        requester: &str,
        notifier: Arc<dyn Notifier>,
    ) -> PlayerResult<Track> {
        let track = match self.registry.fetch_metadata(locator).await {
            Ok(track) => track,
            Err(e) => {
                error!("❌ Error obteniendo metadata de {}: {}", locator, e);
                return Err(e);
            }
        };

        if track.is_empty() {
            warn!("Nadie pudo resolver {}", locator);
            return Err(PlayerError::Unresolvable(locator.to_string()));
        }

        let track = track.with_requester(requester);

        if self.previews {
            self.spawn_preview(locator.to_string(), notifier.clone());
        }

        let scheduler = self.directory.get_or_create(guild_id);
        if scheduler.enqueue(track.clone(), voice_channel_id, notifier) {
            debug!("Loop nuevo para guild {}", guild_id);
        }

        Ok(track)
    }

    /// No-op si la guild no tiene sesión
    pub fn skip(&self, guild_id: GuildId) -> bool {
        self.directory.get(guild_id).is_some_and(|s| s.skip())
    }

    /// Devuelve `false` si la guild no tiene sesión
    pub fn stop(&self, guild_id: GuildId) -> bool {
        match self.directory.get(guild_id) {
            Some(scheduler) => {
                let dropped = scheduler.stop();
                debug!("{} tracks descartados en guild {}", dropped, guild_id);
                true
            }
            None => false,
        }
    }

    pub fn status(&self, guild_id: GuildId) -> Option<SessionStatus> {
        self.directory.get(guild_id).map(|s| s.status())
    }

    /// La preview se envía en segundo plano; sus errores solo se registran
    fn spawn_preview(&self, locator: String, notifier: Arc<dyn Notifier>) {
        let registry = self.registry.clone();
        tokio::spawn(async move {
            match registry.fetch_preview_asset(&locator).await {
                Ok(PreviewAsset::File(path)) => {
                    if let Err(e) = notifier.send_file(&path).await {
                        warn!("No se pudo enviar la preview de {}: {:?}", locator, e);
                    }
                    if let Err(e) = tokio::fs::remove_file(&path).await {
                        debug!("No se pudo borrar {}: {}", path.display(), e);
                    }
                }
                Ok(PreviewAsset::Passthrough(link)) => {
                    if let Err(e) = notifier.send(&link).await {
                        warn!("No se pudo enviar el enlace {}: {:?}", link, e);
                    }
                }
                Err(e) => warn!("⚠️ Preview fallida para {}: {}", locator, e),
            }
        });
    }
}
