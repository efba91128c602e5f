//! Typed views over `Task::data` for the built-in task types, plus the
//! constructors that give each type its bizId convention.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::change::ChangeRecord;
use super::cursor::Cursor;
use super::ids::TaskId;
use super::task::{Task, TaskData};
use super::task_type::TaskType;

pub fn package_sync_biz_id(registry_id: &str, fullname: &str) -> String {
    format!("sync_package:{registry_id}:{fullname}")
}

pub fn binary_sync_biz_id(binary_name: &str) -> String {
    format!("sync_binary:{binary_name}")
}

pub fn change_feed_poll_biz_id(registry_id: &str) -> String {
    format!("change_feed_poll:{registry_id}")
}

/// `data` of a PackageSync task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageSyncData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry_id: Option<String>,

    /// `None` means a full sync of every version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub specific_versions: Option<Vec<String>>,

    #[serde(default)]
    pub deleted: bool,

    /// How many upstream changes were folded into this task.
    #[serde(default)]
    pub change_count: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_cursor: Option<Cursor>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tips: Option<String>,
}

impl PackageSyncData {
    pub fn from_record(registry_id: &str, record: &ChangeRecord) -> Self {
        Self {
            registry_id: Some(registry_id.to_string()),
            specific_versions: normalize_versions(record.versions.clone()),
            deleted: record.deleted,
            change_count: 1,
            last_cursor: Some(record.cursor.clone()),
            tips: None,
        }
    }

    pub fn from_data(data: &TaskData) -> Result<Self, serde_json::Error> {
        serde_json::from_value(serde_json::Value::Object(data.clone()))
    }

    pub fn into_data(self) -> TaskData {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => map,
            // a struct always serializes to an object
            _ => TaskData::new(),
        }
    }

    /// Fold a newer change into this pending one.
    ///
    /// A full sync on either side wins; otherwise versions accumulate.
    pub fn merge(&self, newer: &PackageSyncData) -> PackageSyncData {
        let specific_versions = match (&self.specific_versions, &newer.specific_versions) {
            (Some(a), Some(b)) => {
                normalize_versions(a.iter().chain(b.iter()).cloned().collect())
            }
            _ => None,
        };
        let last_cursor = match (&self.last_cursor, &newer.last_cursor) {
            (Some(a), Some(b)) => Some(a.clone().max(b.clone())),
            (a, b) => a.clone().or_else(|| b.clone()),
        };
        PackageSyncData {
            registry_id: newer.registry_id.clone().or_else(|| self.registry_id.clone()),
            specific_versions,
            deleted: newer.deleted,
            change_count: self.change_count + newer.change_count,
            last_cursor,
            tips: newer.tips.clone().or_else(|| self.tips.clone()),
        }
    }
}

fn normalize_versions(mut versions: Vec<String>) -> Option<Vec<String>> {
    if versions.is_empty() {
        return None;
    }
    versions.sort();
    versions.dedup();
    Some(versions)
}

/// Merge function for PackageSync tasks used with `TaskStore::create_or_merge`.
///
/// Unknown keys already present on the pending task are preserved.
pub fn merge_package_sync(existing: &Task, candidate: &Task) -> TaskData {
    match (
        PackageSyncData::from_data(&existing.data),
        PackageSyncData::from_data(&candidate.data),
    ) {
        (Ok(old), Ok(new)) => {
            let mut data = existing.data.clone();
            data.extend(old.merge(&new).into_data());
            if new.specific_versions.is_none() || old.specific_versions.is_none() {
                data.remove("specificVersions");
            }
            data
        }
        _ => {
            let mut data = existing.data.clone();
            data.extend(candidate.data.clone());
            data
        }
    }
}

/// Merge function that leaves the pending task as it is.
pub fn keep_existing(existing: &Task, _candidate: &Task) -> TaskData {
    existing.data.clone()
}

impl Task {
    pub fn package_sync(
        task_id: TaskId,
        registry_id: &str,
        fullname: &str,
        data: PackageSyncData,
        now: DateTime<Utc>,
    ) -> Task {
        Task::new(task_id, TaskType::PackageSync, fullname, now)
            .with_biz_id(package_sync_biz_id(registry_id, fullname))
            .with_data(data.into_data())
    }

    pub fn binary_sync(task_id: TaskId, binary_name: &str, now: DateTime<Utc>) -> Task {
        Task::new(task_id, TaskType::BinarySync, binary_name, now)
            .with_biz_id(binary_sync_biz_id(binary_name))
    }

    pub fn change_feed_poll(task_id: TaskId, registry_id: &str, now: DateTime<Utc>) -> Task {
        let mut data = TaskData::new();
        data.insert("registryId".into(), registry_id.into());
        Task::new(task_id, TaskType::ChangeFeedPoll, registry_id, now)
            .with_biz_id(change_feed_poll_biz_id(registry_id))
            .with_data(data)
    }

    /// Hook deliveries are never deduplicated.
    pub fn hook_trigger(
        task_id: TaskId,
        hook_event_id: &str,
        payload: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Task {
        let mut data = TaskData::new();
        data.insert("hookEventId".into(), hook_event_id.into());
        data.insert("payload".into(), payload);
        Task::new(task_id, TaskType::HookTrigger, hook_event_id, now).with_data(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use ulid::Ulid;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn sync_task(versions: &[&str], seq: u64) -> Task {
        let record = ChangeRecord::new(Cursor::new(seq), "@foo/bar", serde_json::json!({}))
            .with_versions(versions.iter().map(|v| v.to_string()).collect());
        Task::package_sync(
            TaskId::from_ulid(Ulid::new()),
            "npm",
            "@foo/bar",
            PackageSyncData::from_record("npm", &record),
            now(),
        )
    }

    #[test]
    fn constructors_follow_biz_id_conventions() {
        let id = TaskId::from_ulid(Ulid::new());
        assert_eq!(
            sync_task(&[], 1).biz_id.as_deref(),
            Some("sync_package:npm:@foo/bar")
        );
        assert_eq!(
            Task::binary_sync(id, "node", now()).biz_id.as_deref(),
            Some("sync_binary:node")
        );
        let poll = Task::change_feed_poll(id, "npm", now());
        assert_eq!(poll.biz_id.as_deref(), Some("change_feed_poll:npm"));
        assert_eq!(poll.task_type, TaskType::ChangeFeedPoll);
        assert!(Task::hook_trigger(id, "evt-1", serde_json::json!({}), now())
            .biz_id
            .is_none());
    }

    #[test]
    fn versions_accumulate_as_sorted_set() {
        let existing = sync_task(&["1.0.1", "1.0.0"], 1);
        let candidate = sync_task(&["1.0.2", "1.0.1"], 2);
        let merged = merge_package_sync(&existing, &candidate);
        let merged = PackageSyncData::from_data(&merged).unwrap();
        assert_eq!(
            merged.specific_versions,
            Some(vec!["1.0.0".into(), "1.0.1".into(), "1.0.2".into()])
        );
        assert_eq!(merged.change_count, 2);
        assert_eq!(merged.last_cursor, Some(Cursor::new(2)));
    }

    #[test]
    fn full_sync_wins_over_specific_versions() {
        let existing = sync_task(&["1.0.0"], 1);
        let candidate = sync_task(&[], 2);
        let data = merge_package_sync(&existing, &candidate);
        assert!(!data.contains_key("specificVersions"));
        assert_eq!(PackageSyncData::from_data(&data).unwrap().specific_versions, None);

        let data = merge_package_sync(&candidate, &existing);
        assert!(!data.contains_key("specificVersions"));
    }

    #[test]
    fn unknown_keys_survive_merge() {
        let mut existing = sync_task(&["1.0.0"], 1);
        existing.data.insert("logPath".into(), "/tmp/log".into());
        let data = merge_package_sync(&existing, &sync_task(&["2.0.0"], 2));
        assert_eq!(data["logPath"], "/tmp/log");
    }

    #[test]
    fn keep_existing_ignores_candidate() {
        let existing = sync_task(&["1.0.0"], 1);
        assert_eq!(keep_existing(&existing, &sync_task(&[], 9)), existing.data);
    }
}
