use async_trait::async_trait;
use serenity::{
    builder::{CreateAttachment, CreateMessage},
    http::Http,
    model::id::ChannelId,
};
use std::{path::Path, sync::Arc};

use crate::audio::transport::Notifier;

/// Avisos al canal de texto donde se pidió la canción.
pub struct ChannelNotifier {
    http: Arc<Http>,
    channel_id: ChannelId,
}

impl ChannelNotifier {
    pub fn new(http: Arc<Http>, channel_id: ChannelId) -> Self {
        Self { http, channel_id }
    }
}

#[async_trait]
impl Notifier for ChannelNotifier {
    async fn send(&self, text: &str) -> anyhow::Result<()> {
        self.channel_id.say(&self.http, text).await?;
        Ok(())
    }

    async fn send_file(&self, path: &Path) -> anyhow::Result<()> {
        let attachment = CreateAttachment::path(path).await?;
        self.channel_id
            .send_files(&self.http, [attachment], CreateMessage::new())
            .await?;
        Ok(())
    }
}
