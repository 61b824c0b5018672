//! The access-controlled tool catalog.
//!
//! Descriptors aggregate tool metadata across every connected server and
//! carry the derived `allowed` flag. The allow-list predicate lives here,
//! exactly once, and is used both when the catalog is built and when a tool
//! is about to be executed.

use rust_mcp_schema::Tool;
use serde_json::Value;
use std::collections::HashMap;
use tracing::warn;

/// The allow-list predicate. An empty list means every tool is allowed;
/// otherwise the tool name must be a member. This is a security boundary:
/// both catalog construction and execution-time re-checks call this exact
/// function so the two paths can never diverge.
pub fn tool_allowed(allow_list: &[String], name: &str) -> bool {
    allow_list.is_empty() || allow_list.iter().any(|allowed| allowed == name)
}

/// Immutable description of one remote operation.
#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    /// JSON parameter schema as the server sent it (`properties`, `required`).
    pub schema: Value,
    /// Name of the owning server.
    pub server: String,
    pub allowed: bool,
}

impl ToolDescriptor {
    pub fn from_tool(
        tool: &Tool,
        server: &str,
        allow_list: &[String],
        hints: &HashMap<String, String>,
    ) -> Self {
        let mut description = tool
            .description
            .clone()
            .unwrap_or_else(|| format!("Call the {} tool", tool.name));
        if let Some(hint) = hints.get(&tool.name) {
            description.push_str("\n\n");
            description.push_str(hint);
        }
        let schema = serde_json::to_value(&tool.input_schema)
            .unwrap_or_else(|_| Value::Object(Default::default()));
        Self {
            name: tool.name.clone(),
            description,
            schema,
            server: server.to_string(),
            allowed: tool_allowed(allow_list, &tool.name),
        }
    }

    pub fn required_parameters(&self) -> Vec<String> {
        self.schema
            .get("required")
            .and_then(Value::as_array)
            .map(|required| {
                required
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn parameter_description(&self, name: &str) -> String {
        self.schema
            .get("properties")
            .and_then(|properties| properties.get(name))
            .and_then(|info| info.get("description"))
            .and_then(Value::as_str)
            .unwrap_or("No description available")
            .to_string()
    }

    /// One line per parameter, with type and required/optional marker.
    pub fn parameter_info(&self) -> String {
        let Some(properties) = self.schema.get("properties").and_then(Value::as_object) else {
            return "No parameters required".to_string();
        };
        if properties.is_empty() {
            return "No parameters required".to_string();
        }

        let required = self.required_parameters();
        let mut lines = Vec::new();
        for (name, info) in properties {
            let param_type = info.get("type").and_then(Value::as_str).unwrap_or("string");
            let description = info
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or("No description");
            let marker = if required.iter().any(|r| r == name) {
                " (REQUIRED)"
            } else {
                " (optional)"
            };
            lines.push(format!("  • {name} ({param_type}){marker}: {description}"));
        }
        lines.join("\n")
    }

    /// Renders the tool for the oracle prompt. Denied tools are never
    /// rendered; callers go through [`ToolCatalog::describe_for_oracle`].
    fn render_for_oracle(&self) -> String {
        let required = self.required_parameters();
        let mut argument_lines = Vec::new();
        let mut example = serde_json::Map::new();

        if let Some(properties) = self.schema.get("properties").and_then(Value::as_object) {
            for (name, info) in properties {
                let param_type = info.get("type").and_then(Value::as_str).unwrap_or("string");
                let description = info
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or("No description");
                let is_required = required.iter().any(|r| r == name);
                let marker = if is_required { "[REQUIRED]" } else { "[OPTIONAL]" };
                argument_lines.push(format!("  - {name} ({param_type}): {description} {marker}"));
                if is_required && example.len() < 3 {
                    example.insert(name.clone(), example_value(param_type, description));
                }
            }
        }

        let parameters = if argument_lines.is_empty() {
            "  (no parameters required)".to_string()
        } else {
            argument_lines.join("\n")
        };
        let example_json = serde_json::to_string(&Value::Object(example))
            .unwrap_or_else(|_| "{}".to_string());

        format!(
            "TOOL: {name}\nPURPOSE: {description}\nPARAMETERS:\n{parameters}\nUSAGE EXAMPLE:\nTOOL: {name}\nARGS: {example_json}\n",
            name = self.name,
            description = self.description,
        )
    }

    /// First non-empty line of the description, shortened for listings.
    fn brief_description(&self) -> String {
        let first_line = self
            .description
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .unwrap_or("No description");
        truncate(first_line, 80)
    }
}

/// Picks a plausible example value for the usage snippet shown to the oracle.
/// Prefers an example embedded in the description ("e.g. BTCUSDT").
fn example_value(param_type: &str, description: &str) -> Value {
    if let Some(example) = example_from_description(description) {
        return Value::String(example);
    }
    match param_type {
        "number" => Value::from(100),
        "integer" => Value::from(100),
        "boolean" => Value::from(true),
        "array" => serde_json::json!(["item1", "item2"]),
        _ => Value::String("value".to_string()),
    }
}

fn example_from_description(description: &str) -> Option<String> {
    let lower = description.to_ascii_lowercase();
    let at = lower.find("e.g.")?;
    let tail = description[at + 4..].trim_start_matches([' ', ':', '"', '\'']);
    let end = tail
        .find(['"', '\'', ')', ',', '\n'])
        .unwrap_or(tail.len());
    let example = tail[..end].trim();
    (!example.is_empty()).then(|| example.to_string())
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let shortened: String = text.chars().take(max.saturating_sub(3)).collect();
        format!("{shortened}...")
    }
}

/// Aggregated tool descriptors across every connected server.
///
/// Duplicate names across servers are permitted; execution resolves to the
/// first allowed match, and the ambiguity is logged when it is introduced.
#[derive(Debug, Default, Clone)]
pub struct ToolCatalog {
    tools: Vec<ToolDescriptor>,
}

impl ToolCatalog {
    /// Replaces one server's descriptors with a fresh listing, re-deriving
    /// `allowed` from the server's current configuration.
    pub fn refresh_server(
        &mut self,
        server: &str,
        allow_list: &[String],
        hints: &HashMap<String, String>,
        tools: &[Tool],
    ) {
        self.tools.retain(|tool| tool.server != server);
        for tool in tools {
            if self.tools.iter().any(|existing| existing.name == tool.name) {
                warn!(
                    tool = %tool.name,
                    server = %server,
                    "duplicate tool name across servers; execution resolves to the first match"
                );
            }
            self.tools
                .push(ToolDescriptor::from_tool(tool, server, allow_list, hints));
        }
    }

    /// First descriptor with the given name, allowed or not.
    pub fn find(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.iter().find(|tool| tool.name == name)
    }

    /// First *allowed* descriptor with the given name; this is the lookup
    /// execution uses.
    pub fn find_allowed(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools
            .iter()
            .find(|tool| tool.name == name && tool.allowed)
    }

    pub fn is_allowed(&self, name: &str) -> bool {
        self.find_allowed(name).is_some()
    }

    pub fn allowed(&self) -> impl Iterator<Item = &ToolDescriptor> {
        self.tools.iter().filter(|tool| tool.allowed)
    }

    pub fn allowed_len(&self) -> usize {
        self.allowed().count()
    }

    /// Renders every allowed tool for the oracle. Denied tools are entirely
    /// absent, so the oracle can never be talked into requesting one.
    pub fn describe_for_oracle(&self) -> String {
        let blocks: Vec<String> = self
            .allowed()
            .map(ToolDescriptor::render_for_oracle)
            .collect();
        if blocks.is_empty() {
            "(no tools are currently available)".to_string()
        } else {
            blocks.join("\n")
        }
    }

    /// Short prose summary of what the allowed tools can do, for refusal
    /// messages. Never mentions denied tools.
    pub fn capability_summary(&self) -> String {
        let allowed: Vec<&ToolDescriptor> = self.allowed().collect();
        if allowed.is_empty() {
            return "specific tasks".to_string();
        }

        let mut capabilities: Vec<String> = Vec::new();
        for tool in allowed.iter().take(5) {
            let first_sentence = tool
                .description
                .split('.')
                .next()
                .unwrap_or("")
                .lines()
                .next()
                .unwrap_or("")
                .trim();
            if !first_sentence.is_empty() {
                capabilities.push(truncate(first_sentence, 60).to_lowercase());
            }
        }
        if capabilities.is_empty() {
            capabilities = allowed
                .iter()
                .take(5)
                .map(|tool| tool.name.replace('_', " "))
                .collect();
        }

        let mut summary = match capabilities.len() {
            1 => capabilities.remove(0),
            2 => format!("{} and {}", capabilities[0], capabilities[1]),
            _ => {
                let (last, rest) = capabilities.split_last().unwrap_or((&capabilities[0], &[]));
                format!("{}, and {}", rest.join(", "), last)
            }
        };
        if allowed.len() > 5 {
            summary.push_str(&format!(" (and {} more)", allowed.len() - 5));
        }
        summary
    }

    /// Bullet list of allowed tools for greeting and help responses.
    pub fn tool_listing(&self) -> Option<String> {
        let lines: Vec<String> = self
            .allowed()
            .map(|tool| format!("• `{}`: {}", tool.name, tool.brief_description()))
            .collect();
        (!lines.is_empty()).then(|| lines.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::testing::tool_fixture;
    use serde_json::json;

    fn price_tool() -> Tool {
        tool_fixture(
            "get_price",
            "Get the latest price for a symbol.",
            json!({
                "type": "object",
                "properties": {
                    "symbol": {"type": "string", "description": "Trading pair, e.g. BTCUSDT"}
                },
                "required": ["symbol"]
            }),
        )
    }

    fn trade_tool() -> Tool {
        tool_fixture(
            "place_order",
            "Place a live trading order.",
            json!({
                "type": "object",
                "properties": {
                    "symbol": {"type": "string", "description": "Trading pair"},
                    "side": {"type": "string", "description": "buy or sell"}
                },
                "required": ["symbol", "side"]
            }),
        )
    }

    #[test]
    fn empty_allow_list_permits_every_tool() {
        assert!(tool_allowed(&[], "anything"));
        assert!(tool_allowed(&["get_price".to_string()], "get_price"));
        assert!(!tool_allowed(&["get_price".to_string()], "place_order"));
    }

    #[test]
    fn denied_tools_are_absent_from_the_oracle_rendering() {
        let mut catalog = ToolCatalog::default();
        catalog.refresh_server(
            "exchange",
            &["get_price".to_string()],
            &HashMap::new(),
            &[price_tool(), trade_tool()],
        );

        let rendering = catalog.describe_for_oracle();
        assert!(rendering.contains("get_price"));
        assert!(!rendering.contains("place_order"));

        assert!(catalog.is_allowed("get_price"));
        assert!(!catalog.is_allowed("place_order"));
        assert!(catalog.find("place_order").is_some());
        assert!(!catalog.find("place_order").map(|t| t.allowed).unwrap_or(true));
    }

    #[test]
    fn refresh_rederives_allowed_after_a_config_change() {
        let mut catalog = ToolCatalog::default();
        catalog.refresh_server("exchange", &[], &HashMap::new(), &[trade_tool()]);
        assert!(catalog.is_allowed("place_order"));

        catalog.refresh_server(
            "exchange",
            &["get_price".to_string()],
            &HashMap::new(),
            &[trade_tool()],
        );
        assert!(!catalog.is_allowed("place_order"));
    }

    #[test]
    fn duplicate_names_resolve_to_the_first_allowed_match() {
        let mut catalog = ToolCatalog::default();
        catalog.refresh_server("alpha", &[], &HashMap::new(), &[price_tool()]);
        catalog.refresh_server("beta", &[], &HashMap::new(), &[price_tool()]);

        let owner = catalog.find_allowed("get_price").map(|t| t.server.clone());
        assert_eq!(owner.as_deref(), Some("alpha"));
    }

    #[test]
    fn tool_hints_are_appended_to_descriptions() {
        let mut hints = HashMap::new();
        hints.insert(
            "get_price".to_string(),
            "For crypto symbols use the full trading pair, e.g. BTC becomes BTCUSDT.".to_string(),
        );
        let mut catalog = ToolCatalog::default();
        catalog.refresh_server("exchange", &[], &hints, &[price_tool()]);

        let descriptor = catalog.find("get_price").expect("descriptor");
        assert!(descriptor.description.contains("BTCUSDT"));
        assert!(catalog.describe_for_oracle().contains("BTC becomes BTCUSDT"));
    }

    #[test]
    fn required_parameters_and_descriptions_come_from_the_schema() {
        let mut catalog = ToolCatalog::default();
        catalog.refresh_server("exchange", &[], &HashMap::new(), &[trade_tool()]);

        let descriptor = catalog.find("place_order").expect("descriptor");
        let mut required = descriptor.required_parameters();
        required.sort();
        assert_eq!(required, vec!["side".to_string(), "symbol".to_string()]);
        assert_eq!(descriptor.parameter_description("side"), "buy or sell");
        assert!(descriptor.parameter_info().contains("(REQUIRED)"));
    }

    #[test]
    fn capability_summary_never_names_denied_tools() {
        let mut catalog = ToolCatalog::default();
        catalog.refresh_server(
            "exchange",
            &["get_price".to_string()],
            &HashMap::new(),
            &[price_tool(), trade_tool()],
        );

        let summary = catalog.capability_summary();
        assert!(summary.contains("price"));
        assert!(!summary.contains("order"));
    }

    #[test]
    fn empty_catalog_has_placeholder_rendering_and_summary() {
        let catalog = ToolCatalog::default();
        assert_eq!(
            catalog.describe_for_oracle(),
            "(no tools are currently available)"
        );
        assert_eq!(catalog.capability_summary(), "specific tasks");
        assert!(catalog.tool_listing().is_none());
    }
}
