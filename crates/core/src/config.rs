//! Client settings
//!
//! Loaded once at startup from `settings.toml` in the platform config
//! directory. Supplies the display name, the transport to use, and the
//! per-action cooldown defaults.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::countdown::{CountdownMode, CountdownSpec};
use crate::error::{Error, Result};

/// Well-known TCP port for peer-mode hosts
pub const DEFAULT_PEER_PORT: u16 = 9999;

/// Default relay port (also the relay server's fallback listen port)
pub const DEFAULT_RELAY_PORT: u16 = 8888;

const SETTINGS_FILE: &str = "settings.toml";

/// How a session reaches other members
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Host listens, joiners connect directly (same network)
    #[default]
    Direct,
    /// Like `Direct`, but the host asks its gateway for a port mapping first
    NatAssisted,
    /// Everyone polls a hosted relay
    Relay,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Direct => write!(f, "direct"),
            TransportKind::NatAssisted => write!(f, "nat_assisted"),
            TransportKind::Relay => write!(f, "relay"),
        }
    }
}

impl std::str::FromStr for TransportKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "direct" => Ok(TransportKind::Direct),
            "nat" | "nat_assisted" => Ok(TransportKind::NatAssisted),
            "relay" => Ok(TransportKind::Relay),
            other => Err(Error::Config(format!("unknown transport '{}'", other))),
        }
    }
}

/// Per-action defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSettings {
    /// Display name (falls back to the action id)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Cooldown length in whole seconds
    pub cooldown_secs: u32,
    /// Early warning this many seconds before expiry (0 = at expiry)
    #[serde(default)]
    pub alert_secs: u32,
    #[serde(default)]
    pub mode: CountdownMode,
}

impl ActionSettings {
    pub fn new(cooldown_secs: u32, alert_secs: u32, mode: CountdownMode) -> Self {
        Self {
            name: None,
            cooldown_secs,
            alert_secs,
            mode,
        }
    }

    pub fn countdown_spec(&self) -> Result<CountdownSpec> {
        CountdownSpec::new(self.cooldown_secs, self.mode, self.alert_secs)
    }
}

/// Client settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub player_name: String,
    pub transport: TransportKind,
    pub peer_port: u16,
    pub connect_timeout_secs: u64,
    /// Relay base URLs, tried in order
    pub relay_servers: Vec<String>,
    /// Ring on expiry and alerts
    pub sound: bool,
    pub actions: BTreeMap<String, ActionSettings>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            player_name: "Player".to_string(),
            transport: TransportKind::Direct,
            peer_port: DEFAULT_PEER_PORT,
            connect_timeout_secs: 5,
            relay_servers: vec![format!("http://127.0.0.1:{}", DEFAULT_RELAY_PORT)],
            sound: true,
            actions: BTreeMap::new(),
        }
    }
}

impl Settings {
    /// Default settings file location
    pub fn default_path() -> Result<PathBuf> {
        let dirs = ProjectDirs::from("dev", "skillsync", "skillsync").ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "Could not determine config directory",
            ))
        })?;

        Ok(dirs.config_dir().join(SETTINGS_FILE))
    }

    /// Load settings, returning defaults if the file does not exist
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "No settings file, using defaults");
            return Ok(Self::default());
        }
        Self::load_from(path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let settings: Settings = toml::from_str(&text)?;
        settings.validate()?;
        tracing::debug!(path = %path.display(), actions = settings.actions.len(), "Loaded settings");
        Ok(settings)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = toml::to_string_pretty(self)?;
        std::fs::write(path, text)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.player_name.trim().is_empty() {
            return Err(Error::Config("player_name must not be empty".into()));
        }
        for (id, action) in &self.actions {
            if action.cooldown_secs == 0 {
                return Err(Error::Config(format!(
                    "action '{}' needs a cooldown of at least 1 second",
                    id
                )));
            }
        }
        Ok(())
    }

    /// Look up the countdown spec for an action
    pub fn action_spec(&self, action_id: &str) -> Result<CountdownSpec> {
        self.actions
            .get(action_id)
            .ok_or_else(|| Error::UnknownAction(action_id.to_string()))?
            .countdown_spec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let temp = TempDir::new().unwrap();
        let settings = Settings::load_or_default(&temp.path().join("nope.toml")).unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.peer_port, DEFAULT_PEER_PORT);
    }

    #[test]
    fn test_save_load_roundtrip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join(SETTINGS_FILE);

        let mut settings = Settings {
            player_name: "alice".to_string(),
            transport: TransportKind::Relay,
            ..Settings::default()
        };
        settings.actions.insert(
            "shield".to_string(),
            ActionSettings::new(30, 5, CountdownMode::Loop),
        );
        settings.save_to(&path).unwrap();

        let loaded = Settings::load_from(&path).unwrap();
        assert_eq!(loaded, settings);
    }

    #[test]
    fn test_parse_partial_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(SETTINGS_FILE);
        std::fs::write(
            &path,
            r#"
player_name = "bob"
transport = "nat_assisted"

[actions.potion]
cooldown_secs = 60

[actions.ward]
name = "Ward"
cooldown_secs = 90
alert_secs = 10
mode = "permanent"
"#,
        )
        .unwrap();

        let settings = Settings::load_from(&path).unwrap();
        assert_eq!(settings.player_name, "bob");
        assert_eq!(settings.transport, TransportKind::NatAssisted);
        assert_eq!(settings.peer_port, DEFAULT_PEER_PORT);

        let potion = settings.action_spec("potion").unwrap();
        assert_eq!(potion.total_seconds(), 60);
        assert_eq!(potion.mode(), CountdownMode::OneShot);
        assert_eq!(potion.alert_threshold_seconds(), 0);

        let ward = settings.action_spec("ward").unwrap();
        assert_eq!(ward.mode(), CountdownMode::Permanent);
        assert_eq!(ward.alert_threshold_seconds(), 10);

        assert!(matches!(
            settings.action_spec("missing"),
            Err(Error::UnknownAction(_))
        ));
    }

    #[test]
    fn test_zero_cooldown_rejected() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(SETTINGS_FILE);
        std::fs::write(&path, "[actions.bad]\ncooldown_secs = 0\n").unwrap();
        assert!(matches!(Settings::load_from(&path), Err(Error::Config(_))));
    }

    #[test]
    fn test_transport_kind_from_str() {
        assert_eq!("direct".parse::<TransportKind>().unwrap(), TransportKind::Direct);
        assert_eq!("NAT".parse::<TransportKind>().unwrap(), TransportKind::NatAssisted);
        assert_eq!(
            "nat-assisted".parse::<TransportKind>().unwrap(),
            TransportKind::NatAssisted
        );
        assert_eq!("relay".parse::<TransportKind>().unwrap(), TransportKind::Relay);
        assert!("carrier-pigeon".parse::<TransportKind>().is_err());
    }
}
