use std::path::{Path, PathBuf};

use serde::Deserialize;
use std::fmt;

/// Top-level configuration for the portal.
///
/// Built once at startup, then shared read-only behind an `Arc`.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub proxy: ProxyConfig,
    pub upstreams: UpstreamsConfig,
    pub ca: CaConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    /// HTTP listen port.
    pub port: u16,
    /// Listen address.
    pub bind: String,
    /// Externally visible base URL, used to build the sign-in redirect URI.
    pub public_url: String,
}

#[derive(Deserialize, Clone)]
#[serde(default)]
pub struct AuthConfig {
    /// Identity provider authority, e.g. `https://login.microsoftonline.com`.
    pub authority: String,
    pub tenant_id: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    /// Group whose members are admins.
    pub admin_group: String,
    /// Group whose members may use the portal at all. Unset disables the check.
    pub user_group: Option<String>,
    /// Secret used to sign session cookies.
    pub session_secret: Option<String>,
    pub session_ttl_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ProxyConfig {
    /// Timeout for forwarded capability commands.
    pub timeout_secs: u64,
    /// Timeout for a single status probe.
    pub probe_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct UpstreamsConfig {
    pub home_assistant: TokenUpstream,
    pub immich: TokenUpstream,
    pub proxmox: ProxmoxConfig,
    pub pihole: PlainUpstream,
    pub pihole_secondary: PlainUpstream,
    pub nas: PlainUpstream,
    pub nginx_proxy_manager: PlainUpstream,
    pub portainer: PlainUpstream,
    pub icloudpd: PlainUpstream,
}

/// An upstream addressed by a base URL and a single secret token or API key.
#[derive(Deserialize, Clone, Default)]
#[serde(default)]
pub struct TokenUpstream {
    pub url: Option<String>,
    pub token: Option<String>,
}

#[derive(Deserialize, Clone, Default)]
#[serde(default)]
pub struct ProxmoxConfig {
    pub url: Option<String>,
    pub token_id: Option<String>,
    pub token_secret: Option<String>,
    /// Accept the self-signed certificate Proxmox ships with.
    pub accept_invalid_certs: bool,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct PlainUpstream {
    pub url: Option<String>,
}

#[derive(Deserialize, Clone, Default)]
#[serde(default)]
pub struct CaConfig {
    /// Base64-encoded PEM of the root CA certificate.
    pub root_cert_b64: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            bind: "0.0.0.0".to_string(),
            public_url: "http://localhost:3000".to_string(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            authority: "https://login.microsoftonline.com".to_string(),
            tenant_id: None,
            client_id: None,
            client_secret: None,
            admin_group: String::new(),
            user_group: None,
            session_secret: None,
            session_ttl_secs: 30 * 24 * 3600,
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            probe_timeout_secs: 5,
        }
    }
}

fn redact(value: &Option<String>) -> Option<&'static str> {
    value.as_ref().map(|_| "[REDACTED]")
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("authority", &self.authority)
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .field("client_secret", &redact(&self.client_secret))
            .field("admin_group", &self.admin_group)
            .field("user_group", &self.user_group)
            .field("session_secret", &redact(&self.session_secret))
            .field("session_ttl_secs", &self.session_ttl_secs)
            .finish()
    }
}

impl fmt::Debug for TokenUpstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenUpstream")
            .field("url", &self.url)
            .field("token", &redact(&self.token))
            .finish()
    }
}

impl fmt::Debug for ProxmoxConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxmoxConfig")
            .field("url", &self.url)
            .field("token_id", &self.token_id)
            .field("token_secret", &redact(&self.token_secret))
            .field("accept_invalid_certs", &self.accept_invalid_certs)
            .finish()
    }
}

impl fmt::Debug for CaConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaConfig")
            .field("root_cert_b64", &self.root_cert_b64.as_ref().map(|v| format!("{} bytes", v.len())))
            .finish()
    }
}

impl TokenUpstream {
    /// Base URL and credential, only when both are present.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (self.url.as_deref(), self.token.as_deref()) {
            (Some(url), Some(token)) => Some((url.trim_end_matches('/'), token)),
            _ => None,
        }
    }
}

impl AuthConfig {
    /// Identity provider client settings, only when all three are present.
    pub fn client(&self) -> Option<(&str, &str, &str)> {
        match (
            self.tenant_id.as_deref(),
            self.client_id.as_deref(),
            self.client_secret.as_deref(),
        ) {
            (Some(tenant), Some(id), Some(secret)) => Some((tenant, id, secret)),
            _ => None,
        }
    }
}

/// Determine the default data directory: ~/.local/share/homelab-portal
pub fn default_data_dir() -> PathBuf {
    dirs_next::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("homelab-portal")
}

/// Load config from a TOML file, falling back to defaults for missing fields,
/// then apply environment overrides.
pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let mut config = if path.exists() {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Ok(meta) = std::fs::metadata(path) {
                let mode = meta.permissions().mode();
                if mode & 0o077 != 0 {
                    tracing::warn!(
                        "Config file {:?} is readable by group/others (mode {:o}). \
                         It holds upstream credentials, set permissions to 0600: chmod 600 {:?}",
                        path, mode & 0o777, path
                    );
                }
            }
        }

        let contents = std::fs::read_to_string(path)?;
        toml::from_str(&contents)?
    } else {
        tracing::info!("No config file found at {:?}, using defaults", path);
        Config::default()
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    validate_config(&config)?;
    Ok(config)
}

/// Apply environment variable overrides to config.
///
/// `lookup` returns the raw value for a variable name; empty values are
/// treated as unset.
pub fn apply_env_overrides<F>(config: &mut Config, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

    let set = |slot: &mut Option<String>, key: &str| {
        if let Some(val) = get(key) {
            *slot = Some(val);
        }
    };

    if let Some(port) = get("PORTAL_PORT").and_then(|v| v.parse::<u16>().ok()) {
        config.server.port = port;
    }
    if let Some(url) = get("AUTH_URL") {
        config.server.public_url = url.trim_end_matches('/').to_string();
    }

    set(&mut config.auth.tenant_id, "AUTH_MICROSOFT_ENTRA_ID_TENANT_ID");
    set(&mut config.auth.client_id, "AUTH_MICROSOFT_ENTRA_ID_ID");
    set(&mut config.auth.client_secret, "AUTH_MICROSOFT_ENTRA_ID_SECRET");
    set(&mut config.auth.session_secret, "AUTH_SECRET");
    set(&mut config.auth.user_group, "USER_GROUP_ID");
    if let Some(group) = get("ADMIN_GROUP_ID") {
        config.auth.admin_group = group;
    }

    let up = &mut config.upstreams;
    set(&mut up.home_assistant.url, "HASS_URL");
    set(&mut up.home_assistant.token, "HASS_TOKEN");
    set(&mut up.immich.url, "IMMICH_URL");
    set(&mut up.immich.token, "IMMICH_API_KEY");
    set(&mut up.proxmox.url, "PVE_URL");
    set(&mut up.proxmox.token_id, "PVE_TOKEN_ID");
    set(&mut up.proxmox.token_secret, "PVE_TOKEN_SECRET");
    set(&mut up.pihole.url, "PIHOLE_URL");
    set(&mut up.pihole_secondary.url, "PIHOLE2_URL");
    set(&mut up.nas.url, "NAS_URL");
    set(&mut up.nginx_proxy_manager.url, "NPM_URL");
    set(&mut up.portainer.url, "PORTAINER_URL");
    set(&mut up.icloudpd.url, "ICLOUDPD_STATUS_URL");

    set(&mut config.ca.root_cert_b64, "STEP_CA_ROOT_CERT_B64");

    // An empty group id in the file means "not configured", same as the env.
    if config.auth.user_group.as_deref().is_some_and(|g| g.trim().is_empty()) {
        config.auth.user_group = None;
    }
}

/// Reject URLs that would make every call to that upstream fail.
fn validate_config(config: &Config) -> anyhow::Result<()> {
    let up = &config.upstreams;
    let urls = [
        ("home_assistant", &up.home_assistant.url),
        ("immich", &up.immich.url),
        ("proxmox", &up.proxmox.url),
        ("pihole", &up.pihole.url),
        ("pihole_secondary", &up.pihole_secondary.url),
        ("nas", &up.nas.url),
        ("nginx_proxy_manager", &up.nginx_proxy_manager.url),
        ("portainer", &up.portainer.url),
        ("icloudpd", &up.icloudpd.url),
    ];

    for (name, url) in urls {
        if let Some(url) = url {
            let parsed = url::Url::parse(url).map_err(|e| {
                anyhow::anyhow!("upstreams.{}.url must be an absolute URL, got {:?}: {}", name, url, e)
            })?;
            if !matches!(parsed.scheme(), "http" | "https") {
                anyhow::bail!("upstreams.{}.url must use http or https, got {:?}", name, url);
            }
        }
    }

    config
        .server
        .bind
        .parse::<std::net::IpAddr>()
        .map_err(|_| anyhow::anyhow!("server.bind must be an IP address, got: {}", config.server.bind))?;

    if config.proxy.timeout_secs == 0 {
        anyhow::bail!("proxy.timeout_secs must be at least 1");
    }
    if config.proxy.probe_timeout_secs == 0 {
        anyhow::bail!("proxy.probe_timeout_secs must be at least 1");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.proxy.probe_timeout_secs, 5);
        assert!(config.upstreams.home_assistant.credentials().is_none());
        assert!(config.auth.user_group.is_none());
    }

    #[test]
    fn test_env_overrides_fill_upstreams() {
        let mut config = Config::default();
        apply_env_overrides(
            &mut config,
            env(&[
                ("HASS_URL", "http://ha.lan:8123/"),
                ("HASS_TOKEN", "ha-token"),
                ("IMMICH_URL", "http://immich.lan"),
                ("ADMIN_GROUP_ID", "admins"),
                ("USER_GROUP_ID", "family"),
            ]),
        );

        assert_eq!(
            config.upstreams.home_assistant.credentials(),
            Some(("http://ha.lan:8123", "ha-token"))
        );
        // URL without key is not a usable token upstream.
        assert!(config.upstreams.immich.credentials().is_none());
        assert_eq!(config.auth.admin_group, "admins");
        assert_eq!(config.auth.user_group.as_deref(), Some("family"));
    }

    #[test]
    fn test_empty_env_values_are_unset() {
        let mut config = Config::default();
        apply_env_overrides(&mut config, env(&[("USER_GROUP_ID", "  "), ("NAS_URL", "")]));
        assert!(config.auth.user_group.is_none());
        assert!(config.upstreams.nas.url.is_none());
    }

    #[test]
    fn test_toml_sections() {
        let config: Config = toml::from_str(
            r#"
            [server]
            port = 8080

            [auth]
            admin_group = "g-admin"
            user_group = ""

            [upstreams.proxmox]
            url = "https://pve.lan:8006"
            token_id = "root@pam!portal"
            token_secret = "s3cret"
            accept_invalid_certs = true
            "#,
        )
        .unwrap();

        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.bind, "0.0.0.0");
        assert!(config.upstreams.proxmox.accept_invalid_certs);
        assert_eq!(config.auth.admin_group, "g-admin");
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let mut config = Config::default();
        apply_env_overrides(
            &mut config,
            env(&[
                ("HASS_TOKEN", "very-secret-token"),
                ("AUTH_SECRET", "cookie-signing-secret"),
                ("PVE_TOKEN_SECRET", "pve-secret"),
            ]),
        );
        let printed = format!("{:?}", config);
        assert!(!printed.contains("very-secret-token"));
        assert!(!printed.contains("cookie-signing-secret"));
        assert!(!printed.contains("pve-secret"));
        assert!(printed.contains("[REDACTED]"));
    }

    #[test]
    fn test_validate_rejects_relative_url() {
        let mut config = Config::default();
        config.upstreams.nas.url = Some("nas.lan".into());
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_bind() {
        let mut config = Config::default();
        config.server.bind = "localhost:80".into();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_rejects_zero_timeouts() {
        assert!(validate_config(&Config::default()).is_ok());

        let mut config = Config::default();
        config.proxy.timeout_secs = 0;
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("proxy.timeout_secs"));

        let mut config = Config::default();
        config.proxy.probe_timeout_secs = 0;
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("proxy.probe_timeout_secs"));
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let config = load_config(Path::new("/nonexistent/homelab-portal/config.toml")).unwrap();
        assert_eq!(config.server.bind, "0.0.0.0");
    }
}
