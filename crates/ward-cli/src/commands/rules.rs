use crate::cli::RulesAction;
use ward_core::{Config, Rule, RuleStore};

pub fn run(config: &Config, action: RulesAction) -> anyhow::Result<()> {
    let store = RuleStore::open(config.resolved_rules_path());

    match action {
        RulesAction::List => print_rules(&store.rules()),
        RulesAction::Add {
            pattern,
            decision,
            risk,
            note,
        } => {
            let mut rule = Rule::new(pattern, decision.into()).with_note(note);
            if let Some(risk) = risk {
                rule = rule.with_risk_level(risk.into());
            }
            println!("Added rule: {}", format_rule(&rule));
            store.remove_rule(&rule.pattern);
            store.add_rule(rule);
            store.save_rules()?;
        }
        RulesAction::Remove { pattern } => {
            if store.remove_rule(&pattern) {
                store.save_rules()?;
                println!("Removed rule: {pattern}");
            } else {
                println!("No rule with pattern: {pattern}");
            }
        }
        RulesAction::Prune => {
            let pruned = store.prune_expired();
            store.save_rules()?;
            println!("Pruned {pruned} expired rule(s).");
        }
    }

    Ok(())
}

fn print_rules(rules: &[Rule]) {
    if rules.is_empty() {
        println!("No rules.");
        return;
    }
    println!("Rules ({}):", rules.len());
    for rule in rules {
        println!("  {}", format_rule(rule));
    }
}

fn format_rule(rule: &Rule) -> String {
    let decision = serde_json::to_value(rule.decision)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default();
    let mut line = format!("{} -> {decision}", rule.pattern);
    if let Some(risk) = rule.risk_level {
        line.push_str(&format!(" [risk: {risk}]"));
    }
    if !rule.conditions.is_empty() {
        line.push_str(&format!(" ({} condition(s))", rule.conditions.len()));
    }
    if let Some(expires_at) = rule.expires_at {
        line.push_str(&format!(" expires {}", expires_at.to_rfc3339()));
    }
    if !rule.note.is_empty() {
        line.push_str(&format!(" # {}", rule.note));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::{DecisionArg, RiskArg};
    use ward_core::{RiskLevel, RuleDecision};

    fn config_in(dir: &tempfile::TempDir) -> Config {
        Config {
            rules_path: Some(dir.path().join("rules.json")),
            ..Config::default()
        }
    }

    #[test]
    fn test_format_rule() {
        let rule = Rule::new("bash", RuleDecision::DenyAlways)
            .with_risk_level(RiskLevel::High)
            .with_note("no shells");
        assert_eq!(format_rule(&rule), "bash -> deny_always [risk: high] # no shells");
    }

    #[test]
    fn test_add_then_remove_persists() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(&dir);

        run(
            &config,
            RulesAction::Add {
                pattern: "read_*".to_string(),
                decision: DecisionArg::Allow,
                risk: Some(RiskArg::Low),
                note: String::new(),
            },
        )
        .unwrap();
        let store = RuleStore::open(config.resolved_rules_path());
        assert_eq!(store.len(), 1);
        assert_eq!(store.rules()[0].risk_level, Some(RiskLevel::Low));

        run(&config, RulesAction::Remove { pattern: "read_*".to_string() }).unwrap();
        assert!(RuleStore::open(config.resolved_rules_path()).is_empty());
    }
}
