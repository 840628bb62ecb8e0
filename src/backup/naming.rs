//! Remote archive file names
//!
//! `<tag>_<totalNodes>_<availableNodes>_<site><suffix>`, where the suffix
//! records whether the upload is complete, still in progress or abandoned.

pub const COMPLETE_SUFFIX: &str = ".tar";
pub const INCOMPLETE_SUFFIX: &str = ".tar.incomplete";
pub const INVALID_SUFFIX: &str = ".tar.invalid";
pub const NAME_DELIMITER: char = '_';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    Complete,
    Incomplete,
    Invalid,
}

impl FileState {
    /// State of a remote file by its suffix alone.
    pub fn of(name: &str) -> Option<Self> {
        [FileState::Incomplete, FileState::Invalid, FileState::Complete]
            .into_iter()
            .find(|state| name.ends_with(state.suffix()))
    }

    pub fn suffix(&self) -> &'static str {
        match self {
            FileState::Complete => COMPLETE_SUFFIX,
            FileState::Incomplete => INCOMPLETE_SUFFIX,
            FileState::Invalid => INVALID_SUFFIX,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFileName {
    pub tag: String,
    pub total_nodes: usize,
    pub available_nodes: usize,
    pub site: String,
    pub state: FileState,
}

impl RemoteFileName {
    /// Name of a new, incomplete upload.
    pub fn new(tag: &str, total_nodes: usize, available_nodes: usize, site: &str) -> Self {
        Self {
            tag: tag.to_string(),
            total_nodes,
            available_nodes,
            site: sanitize_site(site),
            state: FileState::Incomplete,
        }
    }

    /// Parse a remote file name of `tag`. Both the tag and the site may
    /// contain the delimiter, so the tag is stripped first.
    pub fn parse(tag: &str, name: &str) -> Option<Self> {
        let state = FileState::of(name)?;
        let stem = name.strip_suffix(state.suffix())?;
        let rest = stem.strip_prefix(tag)?.strip_prefix(NAME_DELIMITER)?;

        let mut parts = rest.splitn(3, NAME_DELIMITER);
        let total_nodes = parts.next()?.parse().ok()?;
        let available_nodes = parts.next()?.parse().ok()?;
        let site = parts.next().filter(|s| !s.is_empty())?;

        Some(Self {
            tag: tag.to_string(),
            total_nodes,
            available_nodes,
            site: site.to_string(),
            state,
        })
    }

    pub fn file_name(&self) -> String {
        format!(
            "{}{d}{}{d}{}{d}{}{}",
            self.tag,
            self.total_nodes,
            self.available_nodes,
            self.site,
            self.state.suffix(),
            d = NAME_DELIMITER
        )
    }

    /// Every node contributed to the archive.
    pub fn is_full(&self) -> bool {
        self.total_nodes == self.available_nodes
    }
}

/// Prefix shared by all remote files of `tag`.
pub fn tag_prefix(tag: &str) -> String {
    format!("{}{}", tag, NAME_DELIMITER)
}

/// The name an incomplete upload gets once it is finished or abandoned.
pub fn finished_name(name: &str, success: bool) -> String {
    let state = if success {
        FileState::Complete
    } else {
        FileState::Invalid
    };
    match name.strip_suffix(INCOMPLETE_SUFFIX) {
        Some(stem) => format!("{}{}", stem, state.suffix()),
        None => name.to_string(),
    }
}

/// Make an incomplete upload name unique by stamping it before the suffix.
pub fn deduplicated(name: &str, millis: i64) -> String {
    let stem = name.strip_suffix(INCOMPLETE_SUFFIX).unwrap_or(name);
    format!("{}({}){}", stem, millis, INCOMPLETE_SUFFIX)
}

/// Strip leading and trailing non-alphanumeric characters.
pub fn sanitize_site(site: &str) -> String {
    site.trim_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_format() {
        let name = RemoteFileName::new("manual-1", 3, 2, "{site-a}");
        assert_eq!(name.file_name(), "manual-1_3_2_site-a.tar.incomplete");
        assert!(!name.is_full());
    }

    #[test]
    fn test_parse_tag_with_delimiters() {
        let parsed = RemoteFileName::parse("pre_upgrade_b", "pre_upgrade_b_5_5_dc1.tar").unwrap();
        assert_eq!(parsed.tag, "pre_upgrade_b");
        assert_eq!(parsed.total_nodes, 5);
        assert_eq!(parsed.available_nodes, 5);
        assert_eq!(parsed.site, "dc1");
        assert_eq!(parsed.state, FileState::Complete);
    }

    #[test]
    fn test_parse_site_with_delimiters() {
        let name = RemoteFileName::new("manual_1", 3, 2, "dc_east").file_name();
        assert_eq!(name, "manual_1_3_2_dc_east.tar.incomplete");

        let parsed = RemoteFileName::parse("manual_1", &name).unwrap();
        assert_eq!(parsed.tag, "manual_1");
        assert_eq!(parsed.total_nodes, 3);
        assert_eq!(parsed.available_nodes, 2);
        assert_eq!(parsed.site, "dc_east");
        assert_eq!(parsed.state, FileState::Incomplete);
    }

    #[test]
    fn test_parse_states() {
        assert_eq!(
            RemoteFileName::parse("t", "t_3_3_s.tar.incomplete").unwrap().state,
            FileState::Incomplete
        );
        assert_eq!(
            RemoteFileName::parse("t", "t_3_3_s.tar.invalid").unwrap().state,
            FileState::Invalid
        );
        assert!(RemoteFileName::parse("t", "t_3_3_s.zip").is_none());
        assert!(RemoteFileName::parse("t", "t_x_3_s.tar").is_none());
        assert!(RemoteFileName::parse("u", "t_3_3_s.tar").is_none());
    }

    #[test]
    fn test_state_from_suffix_only() {
        assert_eq!(FileState::of("t_3_3_s(17).tar"), Some(FileState::Complete));
        assert_eq!(FileState::of("t.tar.incomplete"), Some(FileState::Incomplete));
        assert_eq!(FileState::of("t.tar.invalid"), Some(FileState::Invalid));
        assert_eq!(FileState::of("t.zip"), None);
    }

    #[test]
    fn test_finish_and_deduplicate() {
        let name = "t_3_3_s.tar.incomplete";
        assert_eq!(finished_name(name, true), "t_3_3_s.tar");
        assert_eq!(finished_name(name, false), "t_3_3_s.tar.invalid");

        let unique = deduplicated(name, 1700000000000);
        assert_eq!(unique, "t_3_3_s(1700000000000).tar.incomplete");
        assert_eq!(finished_name(&unique, true), "t_3_3_s(1700000000000).tar");
    }
}
