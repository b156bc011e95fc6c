use anyhow::Context;
use serde_json::Value;
use ward_core::{Config, Decision, PermissionRequest, PermissionResponse};

pub async fn run(config: &Config, tool: &str, args: &str, json: bool) -> anyhow::Result<()> {
    let request = parse_request(tool, args)?;
    let inspector = config.build_enhanced_inspector();
    let response = inspector.check(&request).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&response)?);
    } else {
        println!("{}", format_response(tool, &response));
    }
    Ok(())
}

fn parse_request(tool: &str, args: &str) -> anyhow::Result<PermissionRequest> {
    let arguments: Value =
        serde_json::from_str(args).with_context(|| format!("Invalid JSON arguments: {args}"))?;
    if !arguments.is_object() {
        anyhow::bail!("Tool arguments must be a JSON object");
    }
    Ok(PermissionRequest::new(tool, arguments).with_call_id("cli"))
}

fn format_response(tool: &str, response: &PermissionResponse) -> String {
    let verdict = match response.decision {
        Decision::Allow => "ALLOW",
        Decision::Deny => "DENY",
        Decision::Ask => "ASK",
    };
    let mut line = format!("{verdict} {tool} (by {})", response.decided_by);
    if let Some(risk) = response.risk_level {
        line.push_str(&format!(" [risk: {risk}]"));
    }
    if !response.message.is_empty() {
        line.push_str(&format!(": {}", response.message));
    }
    if let Some(rule) = &response.matched_rule {
        line.push_str(&format!("\n  rule: {}", rule.pattern));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use ward_core::RiskLevel;

    #[test]
    fn test_parse_request_rejects_non_object() {
        assert!(parse_request("bash", "[1, 2]").is_err());
        assert!(parse_request("bash", "{ nope").is_err());
    }

    #[test]
    fn test_parse_request_reads_arguments() {
        let request = parse_request("bash", r#"{"command": "ls"}"#).unwrap();
        assert_eq!(request.tool_name, "bash");
        assert_eq!(request.str_arg("command"), Some("ls"));
        assert_eq!(request.call_id, "cli");
    }

    #[test]
    fn test_format_response_includes_risk_and_message() {
        let response = PermissionResponse::deny("high_risk", "needs approval").with_risk(RiskLevel::High);
        assert_eq!(
            format_response("bash", &response),
            "DENY bash (by high_risk) [risk: high]: needs approval"
        );
    }

    #[tokio::test]
    async fn test_read_is_allowed_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            rules_path: Some(dir.path().join("rules.json")),
            ..Config::default()
        };
        let request = parse_request("read", r#"{"path": "src/main.rs"}"#).unwrap();
        let response = config.build_enhanced_inspector().check(&request).await.unwrap();
        assert!(response.is_allowed());
    }
}
