use std::time::Duration;

use crate::error::format_duration;

const UNKNOWN: &str = "Unknown";

/// Un elemento reproducible ya resuelto por un resolver.
///
/// Todos los campos son fijos tras la construcción salvo `requester`, que
/// el servicio asigna una sola vez al encolar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Track {
    url: String,
    title: String,
    author: String,
    duration: Duration,
    requester: String,
}

impl Track {
    pub fn new(url: impl Into<String>, title: impl Into<String>, author: impl Into<String>, duration: Duration) -> Self {
        Self {
            url: url.into(),
            title: title.into(),
            author: author.into(),
            duration,
            requester: UNKNOWN.to_string(),
        }
    }

    /// Centinela devuelto cuando ningún resolver reconoce el localizador.
    pub fn empty() -> Self {
        Self::new(UNKNOWN, UNKNOWN, UNKNOWN, Duration::ZERO)
    }

    pub fn is_empty(&self) -> bool {
        self.url == UNKNOWN && self.title == UNKNOWN && self.author == UNKNOWN && self.duration.is_zero()
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn author(&self) -> &str {
        &self.author
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn requester(&self) -> &str {
        &self.requester
    }

    pub fn with_requester(mut self, requester: impl Into<String>) -> Self {
        self.requester = requester.into();
        self
    }

    /// Línea corta para mensajes de chat: `Título - Autor (3m 12s)`.
    pub fn display_line(&self) -> String {
        if self.duration.is_zero() {
            format!("`{}` - {}", self.title, self.author)
        } else {
            format!("`{}` - {} ({})", self.title, self.author, format_duration(self.duration))
        }
    }
}

impl Default for Track {
    fn default() -> Self {
        Self::empty()
    }
}
