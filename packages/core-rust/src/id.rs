//! AIP identifier grammar.
//!
//! An archival information package identifier has the form
//! `dsid[/filepath][#version]`, where `dsid` is either a legacy EDI-ID or
//! the local portion of a PDR ARK (`ark:/NNNNN/local` normalizes to
//! `local`). The identifier with no `filepath` names a whole dataset; with
//! a `filepath` it names one file within that dataset.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;

/// Errors from parsing an AIP identifier.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum IdError {
    #[error("empty identifier")]
    Empty,
    #[error("malformed AIP identifier: {input}")]
    Malformed { input: String },
}

/// A parsed AIP identifier.
///
/// `filepath` and `version` are `None` when the corresponding optional
/// segment is absent (or present but empty, which the grammar treats the
/// same way).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AipId {
    /// Dataset identifier, with any ARK prefix stripped.
    pub dsid: String,
    /// Path of a file within the dataset, if the id names a single file.
    pub filepath: Option<String>,
    /// Requested dataset version, if pinned.
    pub version: Option<String>,
}

fn id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(?:ark:/\d+/)?([^/#]+)(?:/([^#]*))?(?:#(.*))?$")
            .expect("AIP id pattern compiles")
    })
}

impl AipId {
    /// Parses `dsid[/filepath][#version]`, normalizing away an ARK prefix.
    ///
    /// # Errors
    ///
    /// Returns [`IdError::Empty`] for an empty string and
    /// [`IdError::Malformed`] when no dsid can be extracted (e.g. a
    /// `/`-prefixed input or a bare `#version`).
    pub fn parse(input: &str) -> Result<Self, IdError> {
        if input.is_empty() {
            return Err(IdError::Empty);
        }
        let caps = id_pattern()
            .captures(input)
            .ok_or_else(|| IdError::Malformed {
                input: input.to_string(),
            })?;

        let dsid = caps
            .get(1)
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| IdError::Malformed {
                input: input.to_string(),
            })?;
        let filepath = caps
            .get(2)
            .map(|m| m.as_str())
            .filter(|p| !p.is_empty())
            .map(str::to_string);
        let version = caps
            .get(3)
            .map(|m| m.as_str())
            .filter(|v| !v.is_empty())
            .map(str::to_string);

        Ok(Self {
            dsid,
            filepath,
            version,
        })
    }

    /// Builds an id naming a whole dataset.
    #[must_use]
    pub fn dataset(dsid: impl Into<String>) -> Self {
        Self {
            dsid: dsid.into(),
            filepath: None,
            version: None,
        }
    }

    /// True when the id names a whole dataset rather than one file.
    #[must_use]
    pub fn is_dataset(&self) -> bool {
        self.filepath.is_none()
    }

    /// The `dsid/` prefix shared by every file of this dataset.
    ///
    /// Suitable for prefix lookups against the inventory.
    #[must_use]
    pub fn dataset_prefix(&self) -> String {
        format!("{}/", self.dsid)
    }

    /// Returns a copy of this id pinned to `version`.
    #[must_use]
    pub fn with_version(&self, version: Option<&str>) -> Self {
        Self {
            dsid: self.dsid.clone(),
            filepath: self.filepath.clone(),
            version: version.map(str::to_string),
        }
    }
}

impl fmt::Display for AipId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.dsid)?;
        if let Some(path) = &self.filepath {
            write!(f, "/{path}")?;
        }
        if let Some(ver) = &self.version {
            write!(f, "#{ver}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_dsid() {
        let id = AipId::parse("mds2-2119").unwrap();
        assert_eq!(id.dsid, "mds2-2119");
        assert_eq!(id.filepath, None);
        assert_eq!(id.version, None);
        assert!(id.is_dataset());
    }

    #[test]
    fn parses_file_id() {
        let id = AipId::parse("mds2-2119/data/readme.txt").unwrap();
        assert_eq!(id.dsid, "mds2-2119");
        assert_eq!(id.filepath.as_deref(), Some("data/readme.txt"));
        assert!(!id.is_dataset());
    }

    #[test]
    fn parses_versioned_file_id() {
        let id = AipId::parse("mds2-2119/data/readme.txt#1.2.0").unwrap();
        assert_eq!(id.dsid, "mds2-2119");
        assert_eq!(id.filepath.as_deref(), Some("data/readme.txt"));
        assert_eq!(id.version.as_deref(), Some("1.2.0"));
    }

    #[test]
    fn parses_versioned_dataset_id() {
        let id = AipId::parse("mds2-2119#2").unwrap();
        assert!(id.is_dataset());
        assert_eq!(id.version.as_deref(), Some("2"));
    }

    #[test]
    fn strips_ark_prefix() {
        let id = AipId::parse("ark:/88434/mds2-2119/data/readme.txt").unwrap();
        assert_eq!(id.dsid, "mds2-2119");
        assert_eq!(id.filepath.as_deref(), Some("data/readme.txt"));
    }

    #[test]
    fn empty_input_rejected() {
        assert_eq!(AipId::parse(""), Err(IdError::Empty));
    }

    #[test]
    fn missing_dsid_rejected() {
        assert!(matches!(
            AipId::parse("/data/readme.txt"),
            Err(IdError::Malformed { .. })
        ));
        assert!(matches!(
            AipId::parse("#1.0"),
            Err(IdError::Malformed { .. })
        ));
    }

    #[test]
    fn empty_optional_segments_treated_as_absent() {
        let id = AipId::parse("mds2-2119/").unwrap();
        assert_eq!(id.filepath, None);

        let id = AipId::parse("mds2-2119#").unwrap();
        assert_eq!(id.version, None);
    }

    #[test]
    fn display_is_canonical() {
        for raw in [
            "mds2-2119",
            "mds2-2119/data/readme.txt",
            "mds2-2119/data/readme.txt#1.2.0",
            "mds2-2119#3",
        ] {
            assert_eq!(AipId::parse(raw).unwrap().to_string(), raw);
        }
    }

    #[test]
    fn dataset_prefix_ends_with_slash() {
        let id = AipId::parse("mds2-2119#2").unwrap();
        assert_eq!(id.dataset_prefix(), "mds2-2119/");
    }

    mod properties {
        use proptest::prelude::*;

        use super::*;

        proptest! {
            #[test]
            fn parse_display_round_trips(
                dsid in "[A-Za-z0-9._-]{1,24}",
                filepath in proptest::option::of("[A-Za-z0-9._-]{1,16}(/[A-Za-z0-9._-]{1,16}){0,3}"),
                version in proptest::option::of("[A-Za-z0-9.]{1,8}"),
            ) {
                let id = AipId { dsid, filepath, version };
                let reparsed = AipId::parse(&id.to_string()).unwrap();
                prop_assert_eq!(reparsed, id);
            }

            #[test]
            fn parse_never_panics(input in ".{0,64}") {
                let _ = AipId::parse(&input);
            }
        }
    }
}
