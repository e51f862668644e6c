/*!
Command selection by device family.

A [`CommandTable`] maps family identifiers to a [`DeviceProfile`]: the
configuration-dump command plus an optional setup action run right after
login. New families are supported by registering a profile; the session code
only ever asks the table.
*/

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;

static COMWARE_PROMPT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<.*>").expect("static comware prompt pattern is valid"));

/// Setup command run before the dump, confirmed by a prompt pattern
#[derive(Debug, Clone)]
pub struct SetupAction {
    pub command: String,
    /// Output is read until this pattern matches
    pub expect: Regex,
}

impl SetupAction {
    /// Build a setup action; fails if `expect` is not a valid regular expression
    pub fn new(command: impl Into<String>, expect: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            command: command.into(),
            expect: Regex::new(expect)?,
        })
    }
}

/// Everything the session runner needs to dump one family's configuration
#[derive(Debug, Clone)]
pub struct DeviceProfile {
    pub dump_command: String,
    pub setup: Option<SetupAction>,
}

impl DeviceProfile {
    pub fn new(dump_command: impl Into<String>) -> Self {
        Self {
            dump_command: dump_command.into(),
            setup: None,
        }
    }

    pub fn with_setup(mut self, setup: SetupAction) -> Self {
        self.setup = Some(setup);
        self
    }
}

/// Registered profiles keyed by family identifier, with a fallback
#[derive(Debug, Clone)]
pub struct CommandTable {
    profiles: HashMap<String, DeviceProfile>,
    fallback: DeviceProfile,
}

impl CommandTable {
    /// Empty table answering every family with `fallback`
    pub fn with_fallback(fallback: DeviceProfile) -> Self {
        Self {
            profiles: HashMap::new(),
            fallback,
        }
    }

    /// Register (or replace) the profile for a family; identifiers are case-insensitive
    pub fn register(&mut self, family: &str, profile: DeviceProfile) -> &mut Self {
        self.profiles.insert(family.to_ascii_lowercase(), profile);
        self
    }

    /// Profile for a family, or the fallback when the family is unknown
    pub fn select(&self, family: &str) -> &DeviceProfile {
        self.profiles
            .get(&family.to_ascii_lowercase())
            .unwrap_or(&self.fallback)
    }

    pub fn is_registered(&self, family: &str) -> bool {
        self.profiles.contains_key(&family.to_ascii_lowercase())
    }
}

impl Default for CommandTable {
    /// HPE Comware needs paging disabled and uses `display`; everything else
    /// speaks the IOS-style `show running-config`
    fn default() -> Self {
        let mut table = CommandTable::with_fallback(DeviceProfile::new("show running-config"));
        let comware_setup = SetupAction {
            command: "screen-length disable".to_string(),
            expect: COMWARE_PROMPT.clone(),
        };
        table.register(
            "hp_comware",
            DeviceProfile::new("display current-configuration").with_setup(comware_setup),
        );
        table
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_comware_profile() {
        let table = CommandTable::default();
        let profile = table.select("hp_comware");
        assert_eq!(profile.dump_command, "display current-configuration");

        let setup = profile.setup.as_ref().unwrap();
        assert_eq!(setup.command, "screen-length disable");
        assert!(setup.expect.is_match("<HPE-5130>"));
        assert!(!setup.expect.is_match("Switch#"));
    }

    #[test]
    fn test_unknown_family_uses_fallback() {
        let table = CommandTable::default();
        let profile = table.select("cisco_ios");
        assert_eq!(profile.dump_command, "show running-config");
        assert!(profile.setup.is_none());
        assert!(!table.is_registered("cisco_ios"));
    }

    #[test]
    fn test_family_lookup_is_case_insensitive() {
        let table = CommandTable::default();
        assert!(table.is_registered("HP_Comware"));
        assert_eq!(table.select("HP_COMWARE").dump_command, "display current-configuration");
    }

    #[test]
    fn test_register_new_family() {
        let mut table = CommandTable::default();
        table.register(
            "juniper_junos",
            DeviceProfile::new("show configuration | display set")
                .with_setup(SetupAction::new("set cli screen-length 0", r"[>#]\s*$").unwrap()),
        );

        let profile = table.select("juniper_junos");
        assert_eq!(profile.dump_command, "show configuration | display set");
        assert!(profile.setup.is_some());
        // existing entries are untouched
        assert!(table.select("hp_comware").setup.is_some());
    }

    #[test]
    fn test_invalid_expect_pattern_is_rejected() {
        assert!(SetupAction::new("x", "(unclosed").is_err());
    }
}
