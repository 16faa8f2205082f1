//! # Bot Module
//!
//! Discord shell around the playback core.
//!
//! [`PlaybackBot`] implements Serenity's [`EventHandler`]: it parses text
//! commands and forwards them to the shared [`PlayerService`], which is
//! stored in the client's data map under [`PlayerServiceKey`] once the
//! client (and its cache) exist.
//!
//! The songbird transport lives in [`voice`], text notifications in
//! [`notifier`].

use anyhow::Result;
use serenity::{
    all::{ChannelId, Context, EventHandler, GuildId, Message, Ready, UserId, VoiceState},
    async_trait,
    prelude::TypeMapKey,
};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub mod notifier;
pub mod voice;

use crate::{
    audio::{player::PlayerService, scheduler::SessionStatus},
    config::Config,
    error::format_duration,
};
use notifier::ChannelNotifier;

/// Clave del servicio de reproducción en `client.data`
pub struct PlayerServiceKey;

impl TypeMapKey for PlayerServiceKey {
    type Value = Arc<PlayerService>;
}

/// Comandos de texto soportados
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command<'a> {
    Play(&'a str),
    Skip,
    Stop,
    Queue,
}

/// Interpreta `<prefijo><comando> [argumento]`; `None` si no es un comando
fn parse_command<'a>(prefix: &str, content: &'a str) -> Option<Command<'a>> {
    let body = content.trim().strip_prefix(prefix)?;
    let (name, arg) = match body.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (body, ""),
    };

    match name.to_lowercase().as_str() {
        "play" | "p" => Some(Command::Play(arg)),
        "skip" | "s" => Some(Command::Skip),
        "stop" => Some(Command::Stop),
        "queue" | "q" => Some(Command::Queue),
        _ => None,
    }
}

/// Texto del comando `queue`
fn render_status(status: Option<&SessionStatus>) -> String {
    let Some(status) = status else {
        return "📭 La cola está vacía".to_string();
    };
    if status.now_playing.is_none() && status.upcoming.is_empty() {
        return "📭 La cola está vacía".to_string();
    }

    let mut lines = Vec::new();
    if let Some(track) = &status.now_playing {
        lines.push(format!("🎶 Sonando: {}", track.display_line()));
    }
    for (i, track) in status.upcoming.iter().enumerate() {
        lines.push(format!("{}. {} · pedido por {}", i + 1, track.display_line(), track.requester()));
    }
    if !status.upcoming.is_empty() {
        lines.push(format!(
            "📋 {} en cola ({})",
            status.upcoming.len(),
            format_duration(status.remaining)
        ));
    }
    lines.join("\n")
}

/// Canal de voz en el que está el usuario, según la caché
fn user_voice_channel(ctx: &Context, guild_id: GuildId, user_id: UserId) -> Option<ChannelId> {
    let guild = guild_id.to_guild_cached(&ctx.cache)?;
    let channel_id = guild.voice_states.get(&user_id).and_then(|state| state.channel_id);
    channel_id
}

pub struct PlaybackBot {
    config: Arc<Config>,
}

impl PlaybackBot {
    pub fn new(config: Config) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    async fn player(ctx: &Context) -> Option<Arc<PlayerService>> {
        ctx.data.read().await.get::<PlayerServiceKey>().cloned()
    }

    async fn handle_command(&self, ctx: &Context, msg: &Message, guild_id: GuildId, command: Command<'_>) -> Result<()> {
        let player = Self::player(ctx)
            .await
            .ok_or_else(|| anyhow::anyhow!("Servicio de reproducción no inicializado"))?;

        let reply = match command {
            Command::Play("") => format!("Uso: `{}play <url>`", self.config.command_prefix),
            Command::Play(locator) => {
                let Some(channel_id) = user_voice_channel(ctx, guild_id, msg.author.id) else {
                    msg.channel_id.say(&ctx.http, "❌ Debes estar en un canal de voz").await?;
                    return Ok(());
                };

                let notifier = Arc::new(ChannelNotifier::new(ctx.http.clone(), msg.channel_id));
                match player
                    .enqueue(guild_id, channel_id, locator, &msg.author.name, notifier)
                    .await
                {
                    // El scheduler ya avisa que se agregó
                    Ok(track) => {
                        debug!("{} pidió {}", msg.author.name, track.title());
                        return Ok(());
                    }
                    Err(e) => format!("❌ {}", e),
                }
            }
            Command::Skip => {
                if player.skip(guild_id) {
                    "⏭️ Saltando...".to_string()
                } else {
                    "No hay nada sonando".to_string()
                }
            }
            Command::Stop => {
                if player.stop(guild_id) {
                    "⏹️ Reproducción detenida y cola vaciada".to_string()
                } else {
                    "No hay nada sonando".to_string()
                }
            }
            Command::Queue => render_status(player.status(guild_id).as_ref()),
        };

        msg.channel_id.say(&ctx.http, reply).await?;
        Ok(())
    }
}

#[async_trait]
impl EventHandler for PlaybackBot {
    async fn ready(&self, _ctx: Context, ready: Ready) {
        info!("🤖 {} está en línea!", ready.user.name);
        info!("📊 Conectado a {} servidores", ready.guilds.len());
    }

    async fn message(&self, ctx: Context, msg: Message) {
        if msg.author.bot {
            return;
        }
        let Some(command) = parse_command(&self.config.command_prefix, &msg.content) else {
            return;
        };
        let Some(guild_id) = msg.guild_id else {
            return;
        };

        debug!("Comando {:?} en guild {}", command, guild_id);
        if let Err(e) = self.handle_command(&ctx, &msg, guild_id, command).await {
            error!("Error manejando comando: {:?}", e);
        }
    }

    /// Si desconectan al bot del canal de voz, se detiene la reproducción
    async fn voice_state_update(&self, ctx: Context, old: Option<VoiceState>, new: VoiceState) {
        let current_user_id = ctx.cache.current_user().id;
        if new.user_id != current_user_id || old.is_none() || new.channel_id.is_some() {
            return;
        }
        let Some(guild_id) = new.guild_id else {
            return;
        };

        info!("🔌 Bot desconectado en guild {}", guild_id);
        match Self::player(&ctx).await {
            Some(player) => {
                player.stop(guild_id);
            }
            None => warn!("Servicio de reproducción no disponible al desconectar"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{scheduler::PlaybackState, track::Track};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    #[test]
    fn test_parse_commands() {
        assert_eq!(
            parse_command("!", "!play https://youtu.be/x"),
            Some(Command::Play("https://youtu.be/x"))
        );
        assert_eq!(parse_command("!", "  !PLAY   https://youtu.be/x  "), Some(Command::Play("https://youtu.be/x")));
        assert_eq!(parse_command("!", "!play"), Some(Command::Play("")));
        assert_eq!(parse_command("!", "!skip"), Some(Command::Skip));
        assert_eq!(parse_command("!", "!stop"), Some(Command::Stop));
        assert_eq!(parse_command("!", "!q"), Some(Command::Queue));
    }

    #[test]
    fn test_ignores_non_commands() {
        assert_eq!(parse_command("!", "play something"), None);
        assert_eq!(parse_command("!", "!dance"), None);
        assert_eq!(parse_command("?", "!play x"), None);
        assert_eq!(parse_command("!", ""), None);
    }

    #[test]
    fn test_render_empty_status() {
        assert_eq!(render_status(None), "📭 La cola está vacía");
        let idle = SessionStatus {
            state: PlaybackState::Idle,
            now_playing: None,
            upcoming: Vec::new(),
            remaining: Duration::ZERO,
        };
        assert_eq!(render_status(Some(&idle)), "📭 La cola está vacía");
    }

    #[test]
    fn test_render_status_lists_queue() {
        let status = SessionStatus {
            state: PlaybackState::Playing,
            now_playing: Some(Track::new("u1", "Uno", "A", Duration::from_secs(60))),
            upcoming: vec![Track::new("u2", "Dos", "B", Duration::from_secs(90)).with_requester("ana")],
            remaining: Duration::from_secs(90),
        };

        let text = render_status(Some(&status));
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines[0], "🎶 Sonando: `Uno` - A (1m)");
        assert_eq!(lines[1], "1. `Dos` - B (1m 30s) · pedido por ana");
        assert_eq!(lines[2], "📋 1 en cola (1m 30s)");
    }
}
