//! Push payloads and the notifications they produce.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::NotificationConfig;

/// Data attached to a notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationData {
    /// Arrival time in milliseconds since the epoch.
    pub date_of_arrival: i64,
    pub primary_key: u64,
}

/// A notification to display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub title: String,
    pub body: String,
    pub icon: String,
    pub badge: String,
    pub vibrate: Vec<u32>,
    pub data: NotificationData,
}

/// Build the notification for a plain-text push payload.
pub fn build_notification(
    config: &NotificationConfig,
    payload: &str,
    primary_key: u64,
    now: DateTime<Utc>,
) -> Notification {
    Notification {
        title: config.title.clone(),
        body: payload.to_string(),
        icon: config.icon.clone(),
        badge: config.badge.clone(),
        vibrate: config.vibrate.clone(),
        data: NotificationData {
            date_of_arrival: now.timestamp_millis(),
            primary_key,
        },
    }
}
