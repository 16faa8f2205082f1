//! # Audio Module
//!
//! Per-guild playback for the bot.
//!
//! ## Architecture
//!
//! ### [`player`] - Service boundary
//! - [`player::PlayerService`] resolves locators and routes commands
//! - [`player::SchedulerDirectory`] creates one scheduler per guild, lazily
//!
//! ### [`scheduler`] - Playback loop
//! - One loop per guild, spawned on demand and idle when the queue drains
//! - Skip/stop cancel the current track between PCM chunks
//!
//! ### [`queue`] / [`track`] - Data
//! - Strict FIFO of immutable tracks
//!
//! ### [`transport`] - Boundaries
//! - Voice gateway, PCM sink and text notifier traits
//!
//! ## Audio Format
//!
//! - **Sample Rate**: 48kHz (Discord standard)
//! - **Bit Depth**: 16-bit signed integers, little endian
//! - **Channels**: Stereo

pub mod player;
pub mod queue;
pub mod scheduler;
pub mod track;
pub mod transport;
