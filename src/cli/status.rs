//! `homelab-portal status`: query a running portal's status endpoint.

use clap::Args;
use serde::Deserialize;

use crate::session::SESSION_COOKIE;

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Portal URL to query
    #[arg(long, default_value = "http://localhost:3000")]
    pub url: String,

    /// Session token (the portal_session cookie value)
    #[arg(long, env = "PORTAL_SESSION")]
    pub session: String,

    /// Output raw JSON instead of formatted
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Deserialize)]
struct ProbeLine {
    name: String,
    status: String,
    detail: Option<String>,
}

pub async fn execute(args: StatusArgs) -> anyhow::Result<()> {
    let status_url = format!("{}/api/monitoring/status", args.url.trim_end_matches('/'));

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(15))
        .build()?;

    let resp = client
        .get(&status_url)
        .header(reqwest::header::COOKIE, format!("{}={}", SESSION_COOKIE, args.session))
        .send()
        .await
        .map_err(|_| anyhow::anyhow!("Could not connect to {}. Is homelab-portal running?", args.url))?;

    match resp.status().as_u16() {
        401 => anyhow::bail!("Session rejected (401). Sign in again and copy a fresh portal_session cookie."),
        403 => anyhow::bail!("Session is not authorized for the portal (403)."),
        _ if !resp.status().is_success() => anyhow::bail!("Status endpoint returned {}", resp.status()),
        _ => {}
    }

    let data: serde_json::Value = resp.json().await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&data)?);
    } else {
        let lines: Vec<ProbeLine> = serde_json::from_value(data)?;
        print!("{}", render(&lines));
    }

    Ok(())
}

fn render(lines: &[ProbeLine]) -> String {
    if lines.is_empty() {
        return "No upstreams configured.\n".to_string();
    }
    let mut out = String::new();
    for line in lines {
        let icon = match line.status.as_str() {
            "online" => "✓",
            "degraded" => "!",
            "offline" => "✗",
            _ => "?",
        };
        out.push_str(&format!("{} {:<22} {}", icon, line.name, line.status));
        if let Some(detail) = &line.detail {
            out.push_str(&format!(" ({})", detail));
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(clap::Parser)]
    struct TestCli {
        #[command(flatten)]
        args: StatusArgs,
    }

    #[test]
    fn test_parse_args() {
        let cli = TestCli::try_parse_from(["status", "--session", "tok", "--url", "http://portal.lan"]).unwrap();
        assert_eq!(cli.args.session, "tok");
        assert_eq!(cli.args.url, "http://portal.lan");
        assert!(!cli.args.json);
    }

    #[test]
    fn test_render() {
        let lines = vec![
            ProbeLine { name: "NAS".into(), status: "online".into(), detail: None },
            ProbeLine { name: "Pi-hole".into(), status: "offline".into(), detail: Some("Unreachable".into()) },
        ];
        let text = render(&lines);
        assert!(text.starts_with("✓ NAS"));
        assert!(text.contains("✗ Pi-hole"));
        assert!(text.contains("(Unreachable)"));
        assert_eq!(render(&[]), "No upstreams configured.\n");
    }
}
