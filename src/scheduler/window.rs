use std::str::FromStr;

use chrono::{DateTime, Timelike, Utc};
use serde::Serialize;

/// key: maintenance-window
/// Hours of the UTC day, `[start_hour, end_hour)`, in which normal-priority rotations may run.
/// A window whose end precedes its start wraps midnight (e.g. `22-3`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct MaintenanceWindow {
    pub start_hour: u32,
    pub end_hour: u32,
}

impl Default for MaintenanceWindow {
    fn default() -> Self {
        Self {
            start_hour: 2,
            end_hour: 6,
        }
    }
}

impl MaintenanceWindow {
    pub fn new(start_hour: u32, end_hour: u32) -> Result<Self, String> {
        if start_hour > 23 || end_hour > 24 {
            return Err(format!(
                "hours must be within 0-24, got {start_hour}-{end_hour}"
            ));
        }
        if start_hour == end_hour {
            return Err("window must not be empty".to_string());
        }
        Ok(Self {
            start_hour,
            end_hour,
        })
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        let hour = at.hour();
        if self.start_hour < self.end_hour {
            hour >= self.start_hour && hour < self.end_hour
        } else {
            hour >= self.start_hour || hour < self.end_hour
        }
    }
}

impl FromStr for MaintenanceWindow {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (start, end) = value
            .split_once('-')
            .ok_or_else(|| format!("expected '<start>-<end>' hours, got '{value}'"))?;
        let start = start
            .trim()
            .parse::<u32>()
            .map_err(|err| format!("invalid start hour: {err}"))?;
        let end = end
            .trim()
            .parse::<u32>()
            .map_err(|err| format!("invalid end hour: {err}"))?;
        Self::new(start, end)
    }
}
