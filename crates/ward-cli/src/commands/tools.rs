use ward_core::sandbox_policy::{is_bash_like, is_edit_tool};
use ward_core::{Config, RiskClassifier};
use ward_tools::ToolRegistry;

pub fn run(config: &Config, name: Option<&str>) -> anyhow::Result<()> {
    let tools = super::load_tool_registry();
    let classifier = RiskClassifier::with_overrides(&config.risk_overrides);

    match name {
        Some(name) => print_tool_detail(&tools, &classifier, name)?,
        None => print_tool_list(&tools, &classifier),
    }

    Ok(())
}

fn print_tool_list(tools: &ToolRegistry, classifier: &RiskClassifier) {
    let mut names = tools.names();
    names.sort();

    println!("Loaded tools ({}):", names.len());
    for name in names {
        let description = tools
            .get(&name)
            .map(|tool| tool.description().to_string())
            .unwrap_or_else(|| "unknown tool".to_string());
        println!(
            "{name} [{}, risk: {}] - {description}",
            tool_kind(&name),
            classifier.risk(&name)
        );
    }
}

fn print_tool_detail(
    tools: &ToolRegistry,
    classifier: &RiskClassifier,
    name: &str,
) -> anyhow::Result<()> {
    let tool = tools
        .get(name)
        .ok_or_else(|| anyhow::anyhow!("Unknown tool: {name}"))?;
    let schema = serde_json::to_string_pretty(&tool.parameters_schema())?;

    println!("name: {}", tool.name());
    println!("kind: {}", tool_kind(tool.name()));
    println!("risk: {}", classifier.risk(tool.name()));
    println!("description: {}", tool.description());
    println!("parameters:");
    println!("{schema}");

    Ok(())
}

/// How the sandbox policy layer treats the tool.
fn tool_kind(name: &str) -> &'static str {
    if is_bash_like(name) {
        "shell"
    } else if is_edit_tool(name) {
        "edit"
    } else {
        "generic"
    }
}

#[cfg(test)]
mod tests {
    use super::tool_kind;

    #[test]
    fn test_tool_kind_shell() {
        assert_eq!(tool_kind("bash"), "shell");
    }

    #[test]
    fn test_tool_kind_edit() {
        assert_eq!(tool_kind("write_file"), "edit");
    }

    #[test]
    fn test_tool_kind_generic() {
        assert_eq!(tool_kind("web_search"), "generic");
    }
}
