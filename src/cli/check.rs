//! `homelab-portal check`: report what the loaded configuration enables.
//!
//! Secrets are only ever shown as set or unset.

use clap::Args;
use serde::Serialize;

use crate::config::Config;
use crate::status::probes_for;

#[derive(Args, Debug)]
pub struct CheckArgs {
    /// Output raw JSON instead of formatted
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct ConfigReport {
    pub sign_in: bool,
    pub session_secret: bool,
    pub admin_group: bool,
    pub user_group: bool,
    pub home_assistant_proxy: bool,
    pub immich_proxy: bool,
    pub icloudpd: bool,
    pub root_ca: bool,
    pub probes: Vec<String>,
}

pub fn report(config: &Config) -> ConfigReport {
    let up = &config.upstreams;
    ConfigReport {
        sign_in: config.auth.client().is_some(),
        session_secret: config.auth.session_secret.is_some(),
        admin_group: !config.auth.admin_group.is_empty(),
        user_group: config.auth.user_group.is_some(),
        home_assistant_proxy: up.home_assistant.credentials().is_some(),
        immich_proxy: up.immich.credentials().is_some(),
        icloudpd: up.icloudpd.url.is_some(),
        root_ca: config.ca.root_cert_b64.is_some(),
        probes: probes_for(up).into_iter().map(|p| p.name.to_string()).collect(),
    }
}

fn mark(set: bool) -> &'static str {
    if set { "set" } else { "unset" }
}

pub fn execute(args: CheckArgs, config: &Config) -> anyhow::Result<()> {
    let report = report(config);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Homelab Portal Configuration");
    println!("{}", "=".repeat(40));
    println!("Public URL:      {}", config.server.public_url);
    println!("Listen:          {}:{}", config.server.bind, config.server.port);
    println!("Sign-in:         {}", mark(report.sign_in));
    println!("Session secret:  {}", mark(report.session_secret));
    println!("Admin group:     {}", mark(report.admin_group));
    println!(
        "User group:      {}",
        if report.user_group { "set (enforced)" } else { "unset (not enforced)" }
    );
    println!("HA proxy:        {}", mark(report.home_assistant_proxy));
    println!("Immich proxy:    {}", mark(report.immich_proxy));
    println!("iCloudPD:        {}", mark(report.icloudpd));
    println!("Root CA:         {}", mark(report.root_ca));
    if report.probes.is_empty() {
        println!("Status probes:   none");
    } else {
        println!("Status probes:   {}", report.probes.join(", "));
    }

    if !report.sign_in {
        println!();
        println!("⚠ Sign-in is not configured; nobody will be able to get past /login.");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::apply_env_overrides;

    #[test]
    fn test_report_reflects_configuration() {
        let mut config = Config::default();
        apply_env_overrides(&mut config, |key| match key {
            "AUTH_MICROSOFT_ENTRA_ID_ID" => Some("id".into()),
            "AUTH_MICROSOFT_ENTRA_ID_SECRET" => Some("secret".into()),
            "AUTH_MICROSOFT_ENTRA_ID_TENANT_ID" => Some("tenant".into()),
            "HASS_URL" => Some("http://ha.lan".into()),
            "HASS_TOKEN" => Some("token".into()),
            "NAS_URL" => Some("http://nas.lan".into()),
            _ => None,
        });

        let report = report(&config);
        assert!(report.sign_in);
        assert!(report.home_assistant_proxy);
        assert!(!report.immich_proxy);
        assert!(!report.user_group);
        assert_eq!(report.probes, vec!["Home Assistant".to_string(), "NAS".to_string()]);
    }

    #[test]
    fn test_report_never_contains_secrets() {
        let mut config = Config::default();
        config.auth.session_secret = Some("hunter2".into());
        config.upstreams.immich.url = Some("http://immich.lan".into());
        config.upstreams.immich.token = Some("immich-key".into());

        let json = serde_json::to_string(&report(&config)).unwrap();
        assert!(!json.contains("hunter2"));
        assert!(!json.contains("immich-key"));
    }
}
