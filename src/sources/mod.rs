//! # Sources Module
//!
//! Platform resolution for incoming locators.
//!
//! Each supported platform implements [`MediaResolver`]. The
//! [`ResolverRegistry`] keeps them in registration order and routes every
//! locator to the first resolver whose [`MediaResolver::identify`] matches.
//! Adding a platform means implementing the trait and registering it; the
//! scheduler never changes.
//!
//! Unmatched locators degrade to inert results, except for audio streams,
//! which report [`PlayerError::Unsupported`] so a missing platform is never
//! mistaken for a silent track.

pub mod pipeline;
pub mod ytdlp;

use async_trait::async_trait;
use std::{path::PathBuf, sync::Arc};
use tracing::{debug, info};

use crate::{
    audio::track::Track,
    error::{PlayerError, PlayerResult},
};

pub use pipeline::{AudioStream, PipelineSettings};
pub use ytdlp::{Platform, YtDlpResolver};

/// Capacidades que cada plataforma debe implementar
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MediaResolver: Send + Sync {
    /// Nombre de la plataforma
    fn name(&self) -> &'static str;

    /// Coincidencia barata y sin efectos secundarios sobre el localizador
    fn identify(&self, locator: &str) -> bool;

    /// Título, autor y duración del track
    async fn fetch_metadata(&self, locator: &str) -> PlayerResult<Track>;

    /// Flujo PCM s16le estéreo 48kHz, perezoso
    async fn open_audio_stream(&self, locator: &str) -> PlayerResult<AudioStream>;

    /// Clip de preview en disco; `None` si la plataforma no tiene previews
    async fn fetch_preview(&self, locator: &str) -> PlayerResult<Option<PathBuf>>;
}

/// Resultado de pedir una preview.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreviewAsset {
    /// Archivo temporal listo para enviarse
    File(PathBuf),
    /// Sin preview: se devuelve el localizador original
    Passthrough(String),
}

/// Lista ordenada de resolvers; el primero que reconoce un localizador gana.
#[derive(Default)]
pub struct ResolverRegistry {
    resolvers: Vec<Arc<dyn MediaResolver>>,
}

impl ResolverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registro con las plataformas soportadas de serie
    pub fn with_defaults(settings: Arc<PipelineSettings>) -> Self {
        Self::new()
            .with(Arc::new(YtDlpResolver::new(Platform::YOUTUBE, settings.clone())))
            .with(Arc::new(YtDlpResolver::new(Platform::SOUNDCLOUD, settings)))
    }

    pub fn with(mut self, resolver: Arc<dyn MediaResolver>) -> Self {
        self.register(resolver);
        self
    }

    pub fn register(&mut self, resolver: Arc<dyn MediaResolver>) {
        info!("🧩 Resolver registrado: {}", resolver.name());
        self.resolvers.push(resolver);
    }

    pub fn len(&self) -> usize {
        self.resolvers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resolvers.is_empty()
    }

    /// Primer resolver que reconoce el localizador
    pub fn resolve(&self, locator: &str) -> Option<&Arc<dyn MediaResolver>> {
        let found = self.resolvers.iter().find(|r| r.identify(locator));
        match found {
            Some(resolver) => debug!("{} reconoce {}", resolver.name(), locator),
            None => debug!("Ningún resolver reconoce {}", locator),
        }
        found
    }

    /// Metadata del track, o el centinela vacío si nadie lo reconoce
    pub async fn fetch_metadata(&self, locator: &str) -> PlayerResult<Track> {
        match self.resolve(locator) {
            Some(resolver) => resolver.fetch_metadata(locator).await,
            None => Ok(Track::empty()),
        }
    }

    /// Abre el pipeline de audio; un localizador sin dueño es `Unsupported`
    pub async fn open_audio_stream(&self, locator: &str) -> PlayerResult<AudioStream> {
        match self.resolve(locator) {
            Some(resolver) => resolver.open_audio_stream(locator).await,
            None => Err(PlayerError::Unsupported(locator.to_string())),
        }
    }

    pub async fn fetch_preview_asset(&self, locator: &str) -> PlayerResult<PreviewAsset> {
        let Some(resolver) = self.resolve(locator) else {
            return Ok(PreviewAsset::Passthrough(locator.to_string()));
        };

        Ok(match resolver.fetch_preview(locator).await? {
            Some(path) => PreviewAsset::File(path),
            None => PreviewAsset::Passthrough(locator.to_string()),
        })
    }
}
