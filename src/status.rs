//! Wire types shared with the manager.

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize, Serializer};

/// Sync status of a mirror as reported to the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncStatus {
    #[default]
    None,
    Failed,
    Success,
    Syncing,
    PreSyncing,
    Paused,
    Disabled,
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncStatus::None => write!(f, "none"),
            SyncStatus::Failed => write!(f, "failed"),
            SyncStatus::Success => write!(f, "success"),
            SyncStatus::Syncing => write!(f, "syncing"),
            SyncStatus::PreSyncing => write!(f, "pre-syncing"),
            SyncStatus::Paused => write!(f, "paused"),
            SyncStatus::Disabled => write!(f, "disabled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MirrorStatus {
    pub name: String,
    pub worker: String,
    pub is_master: bool,
    pub status: SyncStatus,
    pub last_update: DateTime<Utc>,
    /// Older managers omit this field
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_ended: Option<DateTime<Utc>>,
    pub upstream: String,
    pub size: String,
    pub error_msg: String,
}

impl MirrorStatus {
    /// End time of the last finished run, falling back to `last_update`.
    pub fn last_ended(&self) -> DateTime<Utc> {
        self.last_ended.unwrap_or(self.last_update)
    }
}

const WEB_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S %z";

fn serialize_web_time<S: Serializer>(t: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&t.with_timezone(&Local).format(WEB_TIME_FORMAT).to_string())
}

/// Browser-facing rendering of [`MirrorStatus`].
#[derive(Debug, Clone, Serialize)]
pub struct WebMirrorStatus {
    pub name: String,
    pub is_master: bool,
    pub status: SyncStatus,
    #[serde(serialize_with = "serialize_web_time")]
    pub last_update: DateTime<Utc>,
    pub last_update_ts: i64,
    #[serde(serialize_with = "serialize_web_time")]
    pub last_ended: DateTime<Utc>,
    pub last_ended_ts: i64,
    pub upstream: String,
    pub size: String,
}

impl From<&MirrorStatus> for WebMirrorStatus {
    fn from(m: &MirrorStatus) -> Self {
        let last_ended = m.last_ended();
        Self {
            name: m.name.clone(),
            is_master: m.is_master,
            status: m.status,
            last_update: m.last_update,
            last_update_ts: m.last_update.timestamp(),
            last_ended,
            last_ended_ts: last_ended.timestamp(),
            upstream: m.upstream.clone(),
            size: m.size.clone(),
        }
    }
}

/// `POST /workers` body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub id: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MirrorSchedule {
    pub mirror_name: String,
    pub next_schedule: DateTime<Utc>,
}

/// `POST /workers/{id}/schedules` body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MirrorSchedules {
    pub schedules: Vec<MirrorSchedule>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn sample() -> MirrorStatus {
        MirrorStatus {
            name: "debian".to_string(),
            worker: "w1".to_string(),
            is_master: true,
            status: SyncStatus::PreSyncing,
            last_update: Utc.with_ymd_and_hms(2016, 4, 16, 23, 8, 10).unwrap(),
            last_ended: None,
            upstream: "rsync://ftp.debian.org/debian/".to_string(),
            size: "1.2G".to_string(),
            error_msg: String::new(),
        }
    }

    #[test]
    fn status_names_on_the_wire() {
        let all = [
            (SyncStatus::None, "none"),
            (SyncStatus::Failed, "failed"),
            (SyncStatus::Success, "success"),
            (SyncStatus::Syncing, "syncing"),
            (SyncStatus::PreSyncing, "pre-syncing"),
            (SyncStatus::Paused, "paused"),
            (SyncStatus::Disabled, "disabled"),
        ];
        for (status, name) in all {
            assert_eq!(serde_json::to_value(status).unwrap(), json!(name));
            assert_eq!(status.to_string(), name);
        }
    }

    #[test]
    fn mirror_status_shape() {
        let value = serde_json::to_value(sample()).unwrap();
        assert_eq!(value["status"], "pre-syncing");
        assert_eq!(value["last_update"], "2016-04-16T23:08:10Z");
        assert!(value.get("last_ended").is_none());
        assert_eq!(value["is_master"], true);
    }

    #[test]
    fn missing_last_ended_defaults_to_last_update() {
        let text = r#"{
            "name": "m", "worker": "w", "is_master": false, "status": "success",
            "last_update": "2020-01-02T03:04:05Z", "upstream": "u", "size": "unknown",
            "error_msg": ""
        }"#;
        let status: MirrorStatus = serde_json::from_str(text).unwrap();
        assert!(status.last_ended.is_none());
        assert_eq!(status.last_ended(), status.last_update);
    }

    #[test]
    fn web_status_formats_time() {
        let web = WebMirrorStatus::from(&sample());
        assert_eq!(web.last_update_ts, 1460848090);
        assert_eq!(web.last_ended_ts, 1460848090);
        let value = serde_json::to_value(&web).unwrap();
        let rendered = value["last_update"].as_str().unwrap();
        // local offset varies by host; the layout does not
        assert_eq!(rendered.len(), "2016-04-16 23:08:10 +0000".len());
        assert!(rendered.starts_with("2016-04-1"));
    }
}
