//! Naming and preference policies.
//!
//! The cache manager is customized by composition: a [`NamingPolicy`]
//! decides what an object is called inside a volume, and a
//! [`PreferencePolicy`] decides which volume roles suit an object. Both
//! are injected at construction, with defaults matching the public data
//! repository layout.

use pdrcache_core::AipId;

/// Role bits a volume can advertise and an object can prefer.
///
/// A volume with no role bits is general-purpose and accepts anything.
pub mod roles {
    /// Default, unrestricted storage.
    pub const GENERAL: u32 = 1;
    /// Tuned for many small objects.
    pub const SMALL: u32 = 2;
    /// Tuned for few large objects.
    pub const LARGE: u32 = 4;
    /// Low-latency storage for frequently served content.
    pub const FAST: u32 = 8;
    /// Restricted-access content only.
    pub const RESTRICTED: u32 = 16;
}

/// Maps an AIP id to its name within a volume.
pub trait NamingPolicy: Send + Sync {
    /// In-volume name for `id`, possibly differing by volume role.
    fn name_for(&self, id: &AipId, roles: u32) -> String;
}

/// Standard repository layout: `dsid/filepath` for the current version,
/// versioned copies filed under `dsid/_v/<version>/filepath`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultNaming;

impl NamingPolicy for DefaultNaming {
    fn name_for(&self, id: &AipId, _roles: u32) -> String {
        let filepath = id.filepath.as_deref().unwrap_or("");
        match &id.version {
            Some(version) if !filepath.is_empty() => {
                format!("{}/_v/{version}/{filepath}", id.dsid)
            }
            _ if !filepath.is_empty() => format!("{}/{filepath}", id.dsid),
            _ => id.dsid.clone(),
        }
    }
}

/// Chooses volume roles for an object.
pub trait PreferencePolicy: Send + Sync {
    /// Preference bits for `id`, given its size when known.
    fn preferences_for(&self, id: &AipId, size: Option<i64>) -> u32;
}

/// Size-driven defaults: small objects go to small/fast space, large
/// objects to bulk space, version-pinned objects to general space.
#[derive(Debug, Clone, Copy)]
pub struct DefaultPreferences {
    /// Objects at or below this many bytes count as small. Default 100 MB.
    pub small_object_cutoff: i64,
}

impl Default for DefaultPreferences {
    fn default() -> Self {
        Self {
            small_object_cutoff: 100_000_000,
        }
    }
}

impl PreferencePolicy for DefaultPreferences {
    fn preferences_for(&self, id: &AipId, size: Option<i64>) -> u32 {
        if id.version.is_some() {
            // Pinned old versions see little traffic; keep the fast
            // volumes for the current ones.
            return roles::GENERAL;
        }
        match size {
            Some(s) if s >= 0 && s <= self.small_object_cutoff => roles::SMALL | roles::FAST,
            Some(s) if s > self.small_object_cutoff => roles::LARGE | roles::GENERAL,
            _ => roles::GENERAL,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn naming_current_version() {
        let id = AipId::parse("mds2-2119/data/readme.txt").unwrap();
        assert_eq!(
            DefaultNaming.name_for(&id, 0),
            "mds2-2119/data/readme.txt"
        );
    }

    #[test]
    fn naming_pinned_version_goes_under_version_dir() {
        let id = AipId::parse("mds2-2119/data/readme.txt#1.2.0").unwrap();
        assert_eq!(
            DefaultNaming.name_for(&id, 0),
            "mds2-2119/_v/1.2.0/data/readme.txt"
        );
    }

    #[test]
    fn naming_dataset_id_is_bare_dsid() {
        let id = AipId::parse("mds2-2119").unwrap();
        assert_eq!(DefaultNaming.name_for(&id, 0), "mds2-2119");
    }

    #[test]
    fn small_objects_prefer_small_fast() {
        let policy = DefaultPreferences::default();
        let id = AipId::parse("mds2-2119/small.txt").unwrap();
        assert_eq!(
            policy.preferences_for(&id, Some(1_024)),
            roles::SMALL | roles::FAST
        );
    }

    #[test]
    fn large_objects_prefer_bulk_space() {
        let policy = DefaultPreferences::default();
        let id = AipId::parse("mds2-2119/huge.dat").unwrap();
        assert_eq!(
            policy.preferences_for(&id, Some(10_000_000_000)),
            roles::LARGE | roles::GENERAL
        );
    }

    #[test]
    fn unknown_size_is_general() {
        let policy = DefaultPreferences::default();
        let id = AipId::parse("mds2-2119/who-knows.dat").unwrap();
        assert_eq!(policy.preferences_for(&id, None), roles::GENERAL);
    }

    #[test]
    fn pinned_versions_are_general() {
        let policy = DefaultPreferences::default();
        let id = AipId::parse("mds2-2119/small.txt#1.0").unwrap();
        assert_eq!(policy.preferences_for(&id, Some(10)), roles::GENERAL);
    }
}
