//! Stage table — ordered follow-up stages and the delay before each one.
//! Delays are measured from the previous stage's actual send time. After the
//! last numbered stage the campaign settles into a recurring maintenance stage.

use chrono::Duration;

use nudge_core::config::{CampaignConfig, StageEntry, StagePreset};
use nudge_core::error::{NudgeError, Result};
use nudge_core::types::Stage;

const HOUR: u64 = 3_600;
const DAY: u64 = 24 * HOUR;

/// Ordered stage table plus campaign-wide limits.
#[derive(Debug, Clone)]
pub struct StageConfig {
    /// (stage number, delay since previous send), in send order.
    stages: Vec<(u32, Duration)>,
    maintenance_interval: Duration,
    cooldown: Duration,
}

impl StageConfig {
    pub fn new(
        entries: &[StageEntry],
        max_stages: Option<u32>,
        maintenance_interval: Duration,
        cooldown: Duration,
    ) -> Result<Self> {
        if entries.is_empty() {
            return Err(NudgeError::Config("stage table is empty".into()));
        }
        let limit = max_stages.map(|m| m as usize).unwrap_or(entries.len()).max(1);
        let stages = entries
            .iter()
            .take(limit)
            .map(|e| (e.stage, Duration::seconds(e.delay_secs as i64)))
            .collect();
        Ok(Self {
            stages,
            maintenance_interval,
            cooldown,
        })
    }

    pub fn from_config(config: &CampaignConfig) -> Result<Self> {
        let entries = match &config.stages {
            Some(entries) => entries.clone(),
            None => preset_entries(config.preset),
        };
        Self::new(
            &entries,
            config.max_stages,
            Duration::days(config.maintenance_interval_days as i64),
            Duration::seconds(config.cooldown_secs as i64),
        )
    }

    /// The stage every campaign (re)starts at.
    pub fn first(&self) -> Stage {
        Stage::Numbered(self.stages[0].0)
    }

    /// Stage following `current`; maintenance after the table, and forever after that.
    pub fn next_stage(&self, current: Stage) -> Stage {
        match current {
            Stage::Maintenance => Stage::Maintenance,
            Stage::Numbered(n) => match self.position(n) {
                Some(idx) if idx + 1 < self.stages.len() => Stage::Numbered(self.stages[idx + 1].0),
                _ => Stage::Maintenance,
            },
        }
    }

    /// Delay before `stage`, counted from the previous send (or campaign start for the first).
    pub fn delay_for(&self, stage: Stage) -> Duration {
        match stage {
            Stage::Maintenance => self.maintenance_interval,
            Stage::Numbered(n) => self
                .position(n)
                .map(|idx| self.stages[idx].1)
                .unwrap_or(self.maintenance_interval),
        }
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    pub fn maintenance_interval(&self) -> Duration {
        self.maintenance_interval
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Numbered stages in send order.
    pub fn numbered(&self) -> Vec<Stage> {
        self.stages.iter().map(|(n, _)| Stage::Numbered(*n)).collect()
    }

    fn position(&self, number: u32) -> Option<usize> {
        self.stages.iter().position(|(n, _)| *n == number)
    }
}

/// Built-in stage tables.
pub fn preset_entries(preset: StagePreset) -> Vec<StageEntry> {
    let delays: &[u64] = match preset {
        StagePreset::Standard => &[HOUR, 6 * HOUR, DAY, 2 * DAY, 3 * DAY, 5 * DAY, 7 * DAY, 14 * DAY],
        StagePreset::Extended => &[
            HOUR,
            3 * HOUR,
            6 * HOUR,
            12 * HOUR,
            DAY,
            2 * DAY,
            3 * DAY,
            5 * DAY,
            7 * DAY,
            10 * DAY,
            14 * DAY,
            21 * DAY,
            30 * DAY,
            45 * DAY,
        ],
    };
    delays
        .iter()
        .enumerate()
        .map(|(i, d)| StageEntry {
            stage: i as u32,
            delay_secs: *d,
        })
        .collect()
}
