//! Configuration and saved login for the SkillSwap terminal client

use std::path::{Path, PathBuf};

use skillswap_core::{AuthSession, ClientConfig};

const CONFIG_FILE: &str = "config.json";
const SESSION_FILE: &str = "session.json";

/// `<data_local_dir>/skillswap`, or `./skillswap` when the platform has none.
pub fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("skillswap")
}

pub fn load(data_dir: &Path) -> anyhow::Result<ClientConfig> {
    let config_path = data_dir.join(CONFIG_FILE);

    if config_path.exists() {
        let content = std::fs::read_to_string(&config_path)?;
        let config: ClientConfig = serde_json::from_str(&content)?;
        Ok(config)
    } else {
        Ok(ClientConfig::default())
    }
}

pub fn save(config: &ClientConfig, data_dir: &Path) -> anyhow::Result<()> {
    std::fs::create_dir_all(data_dir)?;
    let content = serde_json::to_string_pretty(config)?;
    std::fs::write(data_dir.join(CONFIG_FILE), content)?;
    Ok(())
}

/// Saved login, dropped when it has expired by `now`.
pub fn load_session(data_dir: &Path, now: i64) -> anyhow::Result<Option<AuthSession>> {
    let path = data_dir.join(SESSION_FILE);
    if !path.exists() {
        return Ok(None);
    }

    let content = std::fs::read_to_string(&path)?;
    let session: AuthSession = serde_json::from_str(&content)?;
    if session.expires_at > 0 && session.expires_at <= now {
        tracing::info!("Saved login for {} has expired", session.email);
        return Ok(None);
    }
    Ok(Some(session))
}

pub fn save_session(session: &AuthSession, data_dir: &Path) -> anyhow::Result<()> {
    std::fs::create_dir_all(data_dir)?;
    let content = serde_json::to_string_pretty(session)?;
    std::fs::write(data_dir.join(SESSION_FILE), content)?;
    Ok(())
}

pub fn clear_session(data_dir: &Path) -> anyhow::Result<()> {
    let path = data_dir.join(SESSION_FILE);
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(expires_at: i64) -> AuthSession {
        AuthSession {
            token: "t0k3n".into(),
            email: "ann@x.io".into(),
            expires_at,
        }
    }

    #[test]
    fn test_missing_config_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = load(dir.path()).unwrap();
        assert_eq!(config.server_port, ClientConfig::default().server_port);
    }

    #[test]
    fn test_config_survives_save() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ClientConfig::new("skills.example.org", 443, true);
        config.api_prefix = "/v2/calls".into();
        save(&config, dir.path()).unwrap();

        let loaded = load(dir.path()).unwrap();
        assert_eq!(loaded.http_url(), "https://skills.example.org:443");
        assert_eq!(loaded.api_prefix, "/v2/calls");
    }

    #[test]
    fn test_expired_session_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        save_session(&session(1_000), dir.path()).unwrap();

        assert!(load_session(dir.path(), 999).unwrap().is_some());
        assert!(load_session(dir.path(), 1_000).unwrap().is_none());
    }

    #[test]
    fn test_clear_session() {
        let dir = tempfile::tempdir().unwrap();
        save_session(&session(0), dir.path()).unwrap();
        clear_session(dir.path()).unwrap();
        clear_session(dir.path()).unwrap();

        assert!(load_session(dir.path(), 0).unwrap().is_none());
    }
}
