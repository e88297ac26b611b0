//! Experience service: character level progress.

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{subscribe, PlayerTracker, Service, ServiceContext, ServiceDescriptor};
use crate::events::parser::ParserEventKind;
use crate::events::service::LevelProgressEvent;
use crate::events::{Event, EventBus, EventKind, ParserEvent, ServiceEvent};
use crate::storage::Database;

pub struct ExperienceService {
    bus: Arc<EventBus>,
    db: Arc<Database>,
    tracker: Arc<PlayerTracker>,
    /// level -> experience required for that level.
    exp_table: HashMap<i64, i64>,
    state: Mutex<(i64, i64)>,
}

impl ExperienceService {
    pub const DESCRIPTOR: ServiceDescriptor = ServiceDescriptor {
        name: "ExperienceService",
        version: "0.1.0",
        requires: &[],
    };

    pub fn new(ctx: &ServiceContext) -> Self {
        let exp_table = Self::load_experience_table(&ctx.config.experience_table_path());
        info!("🎓 ExperienceService initialized");
        Self {
            bus: Arc::clone(&ctx.bus),
            db: Arc::clone(&ctx.db),
            tracker: Arc::new(PlayerTracker::default()),
            exp_table,
            state: Mutex::new((1, 0)),
        }
    }

    /// The table ships as `{"levels": [[{"Id": N, "Exp": M}, ...]], ...}`.
    fn load_experience_table(path: &Path) -> HashMap<i64, i64> {
        let mut table = HashMap::new();
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(_) => {
                warn!("🎓 Experience table not found at {}", path.display());
                return table;
            }
        };
        let data: serde_json::Value = match serde_json::from_str(&raw) {
            Ok(data) => data,
            Err(e) => {
                warn!("🎓 Invalid experience table {}: {e}", path.display());
                return table;
            }
        };

        if let Some(levels) = data
            .get("levels")
            .and_then(|l| l.get(0))
            .and_then(|l| l.as_array())
        {
            for entry in levels {
                if let (Some(id), Some(exp)) = (
                    entry.get("Id").and_then(|v| v.as_i64()),
                    entry.get("Exp").and_then(|v| v.as_i64()),
                ) {
                    table.insert(id, exp);
                }
            }
        }
        info!("🎓 Loaded experience table with {} levels", table.len());
        table
    }

    fn level_progress(&self, level: i64, experience: i64) -> Option<LevelProgressEvent> {
        let Some(&level_total) = self.exp_table.get(&level) else {
            warn!("🎓 Level {level} not found in experience table");
            return None;
        };
        let remaining = (level_total - experience).max(0);
        let percentage = if level_total > 0 {
            experience as f64 / level_total as f64 * 100.0
        } else {
            0.0
        };

        Some(LevelProgressEvent {
            timestamp: crate::events::now(),
            level,
            current: experience,
            remaining,
            level_total,
            percentage,
        })
    }

    async fn on_exp_update(&self, event: Event) -> Result<()> {
        let Event::Parser(ParserEvent::ExpUpdate(e)) = event else {
            return Ok(());
        };
        debug!("🎓 Exp update: Level {}, Exp {}", e.level, e.experience);

        let prev_level = {
            let mut state = self.state.lock();
            let prev = state.0;
            *state = (e.level, e.experience);
            prev
        };
        if prev_level > 0 && prev_level != e.level {
            info!("🎉 Level change! {prev_level} -> {}", e.level);
        }

        let Some(progress) = self.level_progress(e.level, e.experience) else {
            return Ok(());
        };
        let (level, current, percentage) = (progress.level, progress.current, progress.percentage);
        self.bus.publish(ServiceEvent::LevelProgress(progress)).await;

        if let Some(player_name) = self.tracker.player_name() {
            self.db.update_player_progress(&player_name, level, current)?;
            debug!(
                "💾 Updated player {player_name}: Level {level}, Exp {current} ({percentage:.1}%)"
            );
        }
        Ok(())
    }

    /// On join, seed progress from the persisted player row.
    async fn on_player_join(&self, event: Event) -> Result<()> {
        let Event::Parser(ParserEvent::PlayerJoin(e)) = event else {
            return Ok(());
        };
        self.tracker.set_player(&e.player_name);
        let player = self.db.touch_player(&e.player_name)?;

        *self.state.lock() = (player.level, player.experience);

        if let Some(progress) = self.level_progress(player.level, player.experience) {
            info!(
                "🎓 Loaded player {}: Level {}, Exp {}/{} ({:.1}%)",
                player.name, player.level, player.experience, progress.level_total,
                progress.percentage
            );
            self.bus.publish(ServiceEvent::LevelProgress(progress)).await;
        }
        Ok(())
    }
}

#[async_trait]
impl Service for ExperienceService {
    fn descriptor(&self) -> ServiceDescriptor {
        Self::DESCRIPTOR
    }

    fn register(self: Arc<Self>, bus: &EventBus) {
        self.tracker.register(bus, "ExperienceService");
        subscribe!(bus, self, EventKind::Parser(ParserEventKind::ExpUpdate), on_exp_update);
        subscribe!(bus, self, EventKind::Parser(ParserEventKind::PlayerJoin), on_player_join);
    }

    async fn startup(&self) -> Result<()> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}
