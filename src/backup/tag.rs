//! Names of scheduled backups
//!
//! Scheduled backups are tagged `scheduled-<version>-<nodeCount>-<yyyyMMddHHmmss>`.
//! Anything else is a manual backup.

use chrono::{DateTime, NaiveDateTime, Utc};
use std::collections::BTreeSet;
use std::sync::OnceLock;

pub const SCHEDULED_PREFIX: &str = "scheduled";
const TIME_FORMAT: &str = "%Y%m%d%H%M%S";

fn scheduled_re() -> Option<&'static regex::Regex> {
    static RE: OnceLock<Option<regex::Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        regex::Regex::new(&format!(r"^{}-[0-9]\.[0-9].*-\d+-\d{{14}}$", SCHEDULED_PREFIX)).ok()
    })
    .as_ref()
}

pub struct ScheduledBackupTag;

impl ScheduledBackupTag {
    pub fn format(version: &str, node_count: usize, time: DateTime<Utc>) -> String {
        format!(
            "{}-{}-{}-{}",
            SCHEDULED_PREFIX,
            version,
            node_count,
            time.format(TIME_FORMAT)
        )
    }

    pub fn is_scheduled(tag: &str) -> bool {
        scheduled_re().is_some_and(|re| re.is_match(tag))
    }

    /// The scheduled tags among `tags`.
    pub fn pick_scheduled<'a, I>(tags: I) -> BTreeSet<String>
    where
        I: IntoIterator<Item = &'a String>,
    {
        tags.into_iter()
            .filter(|t| Self::is_scheduled(t))
            .cloned()
            .collect()
    }

    /// Creation time encoded in a scheduled tag.
    pub fn parse_time(tag: &str) -> Option<DateTime<Utc>> {
        if !Self::is_scheduled(tag) {
            return None;
        }
        let (_, stamp) = tag.rsplit_once('-')?;
        NaiveDateTime::parse_from_str(stamp, TIME_FORMAT)
            .ok()
            .map(|t| t.and_utc())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_format_and_recognise() {
        let time = Utc.with_ymd_and_hms(2024, 6, 10, 0, 30, 0).unwrap();
        let tag = ScheduledBackupTag::format("3.6.1", 3, time);
        assert_eq!(tag, "scheduled-3.6.1-3-20240610003000");
        assert!(ScheduledBackupTag::is_scheduled(&tag));
        assert_eq!(ScheduledBackupTag::parse_time(&tag), Some(time));
    }

    #[test]
    fn test_manual_tags_are_not_scheduled() {
        assert!(!ScheduledBackupTag::is_scheduled("before-upgrade"));
        assert!(!ScheduledBackupTag::is_scheduled("scheduled-x-3-20240610003000"));
        assert!(!ScheduledBackupTag::is_scheduled("scheduled-3.6-3-2024"));
        assert_eq!(ScheduledBackupTag::parse_time("before-upgrade"), None);
    }

    #[test]
    fn test_pick_scheduled() {
        let tags: BTreeSet<String> = [
            "scheduled-3.6-3-20240610003000",
            "manual-1",
            "scheduled-3.6-3-20240611003000",
        ]
        .into_iter()
        .map(String::from)
        .collect();
        let picked = ScheduledBackupTag::pick_scheduled(&tags);
        assert_eq!(picked.len(), 2);
        assert!(!picked.contains("manual-1"));
    }
}
