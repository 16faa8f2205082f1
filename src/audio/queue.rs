use std::{collections::VecDeque, time::Duration};
use tracing::{debug, info};

use super::track::Track;

/// Cola FIFO de una sesión de voz.
///
/// Sin límite de tamaño ni deduplicación: el orden de inserción es el orden
/// de reproducción. Solo la muta su [`SessionScheduler`](super::scheduler::SessionScheduler).
#[derive(Debug, Default)]
pub struct SessionQueue {
    items: VecDeque<Track>,
}

impl SessionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Agrega un track al final de la cola
    pub fn enqueue(&mut self, track: Track) {
        info!("➕ Agregado a la cola: {}", track.title());
        self.items.push_back(track);
    }

    /// Obtiene el siguiente track (FIFO estricto)
    pub fn dequeue(&mut self) -> Option<Track> {
        let next = self.items.pop_front();
        match &next {
            Some(track) => debug!("➡️ Siguiente en cola: {}", track.title()),
            None => debug!("📭 Cola vacía, no hay siguiente track"),
        }
        next
    }

    pub fn has_any(&self) -> bool {
        !self.items.is_empty()
    }

    /// Limpia la cola
    pub fn clear(&mut self) {
        let dropped = self.items.len();
        self.items.clear();
        if dropped > 0 {
            info!("🗑️ Cola limpiada ({} canciones descartadas)", dropped);
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Copia de los tracks pendientes, en orden de reproducción
    pub fn snapshot(&self) -> Vec<Track> {
        self.items.iter().cloned().collect()
    }

    pub fn total_duration(&self) -> Duration {
        self.items.iter().map(Track::duration).sum()
    }
}
