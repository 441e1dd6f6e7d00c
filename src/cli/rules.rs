//! `homelab-portal rules`: print the capability rule registry for review.

use clap::Args;

use crate::proxy::rules::{CapabilityTable, TargetMatch, REGISTRY};

#[derive(Args, Debug)]
pub struct RulesArgs {
    /// Output raw JSON instead of formatted
    #[arg(long)]
    pub json: bool,
}

pub fn execute(args: RulesArgs) -> anyhow::Result<()> {
    if args.json {
        println!("{}", serde_json::to_string_pretty(REGISTRY)?);
    } else {
        for table in REGISTRY {
            print!("{}", render(table));
        }
    }
    Ok(())
}

fn describe(target: &TargetMatch) -> String {
    match target {
        TargetMatch::Prefix(prefix) => format!("{}*", prefix),
        TargetMatch::OneOf(ids) => format!("one of {} ids", ids.len()),
    }
}

fn render(table: &CapabilityTable) -> String {
    let mut out = format!("{}\n{}\n", table.upstream, "=".repeat(40));
    for rule in table.rules {
        let targets = if rule.targets.is_empty() {
            "(disabled)".to_string()
        } else {
            rule.targets.iter().map(describe).collect::<Vec<_>>().join(", ")
        };
        out.push_str(&format!("{:<24} {}\n", rule.key(), targets));
    }
    if let Some(broadcast) = &table.broadcast {
        out.push_str(&format!(
            "{:<24} {} known targets\n",
            format!("broadcast {}", broadcast.wildcard),
            broadcast.targets.len()
        ));
    }
    out.push('\n');
    out
}
