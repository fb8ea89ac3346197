//! Tool Registry & Dispatcher.
//!
//! The registry is a static declarative catalog of ~6 spreadsheet
//! operations; the dispatcher routes a canonical [`ToolCall`] to the
//! [`SpreadsheetBackend`], turns results (and errors) into tool-response
//! messages, and — for mutating calls — writes an [`crate::undo::UndoAction`]
//! record before returning success.

use serde_json::{Map, Value, json};
use std::sync::Arc;

use crate::Result;
use crate::backend::{MacroAction, SpreadsheetBackend};
use crate::config::Dialect;
use crate::types::{Message, ToolCall};
use crate::undo::{UndoAction, UndoJournal};

// ============================================================================
// SCHEMA HELPERS
// ============================================================================

/// Map a friendly type alias onto a JSON Schema type string.
fn type_to_json_schema(type_str: &str) -> Value {
    let schema_type = match type_str.to_lowercase().as_str() {
        "str" | "string" => "string",
        "int" | "integer" | "i32" | "i64" | "u32" | "u64" => "integer",
        "number" | "float" | "f32" | "f64" => "number",
        "bool" | "boolean" => "boolean",
        "array" | "list" | "vec" => "array",
        "object" | "dict" | "map" => "object",
        _ => "string",
    };
    json!({ "type": schema_type })
}

/// A single parameter declaration used to build a [`ToolDeclaration`]'s
/// schema without hand-writing raw JSON Schema at every call site.
pub struct Param {
    pub name: &'static str,
    pub type_hint: &'static str,
    pub description: &'static str,
    pub required: bool,
    pub enum_values: Option<Vec<&'static str>>,
}

impl Param {
    pub fn new(name: &'static str, type_hint: &'static str, description: &'static str) -> Self {
        Self { name, type_hint, description, required: true, enum_values: None }
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn with_enum(mut self, values: Vec<&'static str>) -> Self {
        self.enum_values = Some(values);
        self
    }
}

fn build_schema(params: &[Param]) -> Value {
    let mut properties = Map::new();
    let mut required = Vec::new();

    for p in params {
        let mut schema = type_to_json_schema(p.type_hint);
        schema["description"] = json!(p.description);
        if let Some(values) = &p.enum_values {
            schema["enum"] = json!(values);
        }
        properties.insert(p.name.to_string(), schema);
        if p.required {
            required.push(p.name);
        }
    }

    json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

// ============================================================================
// TOOL DECLARATION
// ============================================================================

/// `{name, description, parameters-schema}` — the declarative shape of a
/// registered tool.
#[derive(Debug, Clone)]
pub struct ToolDeclaration {
    pub name: String,
    pub description: String,
    pub parameters_schema: Value,
}

impl ToolDeclaration {
    pub fn new(name: impl Into<String>, description: impl Into<String>, params: &[Param]) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters_schema: build_schema(params),
        }
    }

    /// OpenAI / Ollama-shaped function declaration.
    pub fn to_openai_format(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.parameters_schema,
            }
        })
    }

    /// Gemini `functionDeclarations` entry shape.
    pub fn to_gemini_format(&self) -> Value {
        json!({
            "name": self.name,
            "description": self.description,
            "parameters": self.parameters_schema,
        })
    }
}

/// Names of the registry's read-only "query" tools (vs. mutating "action"
/// tools). Only query tools are eligible for parallel dispatch.
const QUERY_TOOLS: &[&str] = &[
    "list_sheets",
    "query_batch",
    "get_range_values",
    "get_cell_formula",
    "get_active_cell",
];

/// `IsQueryTool(name)`.
pub fn is_query_tool(name: &str) -> bool {
    QUERY_TOOLS.contains(&name)
}

/// The static registry: ~6 tools consolidating reads plus the `execute_macro`
/// mutation dispatcher.
pub struct ToolRegistry {
    declarations: Vec<ToolDeclaration>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        let declarations = vec![
            ToolDeclaration::new("list_sheets", "List all sheet names in the workbook.", &[]),
            ToolDeclaration::new(
                "query_batch",
                "Aggregate multiple read-only queries (headers, row count, used range, sample data) for a sheet in one round-trip.",
                &[Param::new("sheet", "string", "Sheet name to query").optional()],
            ),
            ToolDeclaration::new(
                "get_range_values",
                "Read cell values for a range.",
                &[
                    Param::new("sheet", "string", "Sheet name"),
                    Param::new("range", "string", "A1-style range, e.g. A1:C10"),
                ],
            ),
            ToolDeclaration::new(
                "get_cell_formula",
                "Read the formula (if any) behind a single cell.",
                &[
                    Param::new("sheet", "string", "Sheet name"),
                    Param::new("cell", "string", "A1-style cell reference"),
                ],
            ),
            ToolDeclaration::new("get_active_cell", "Get the sheet and cell currently selected in the UI.", &[]),
            ToolDeclaration::new(
                "execute_macro",
                "Apply a batch of typed mutating sub-actions (write_cell, write_range, create_sheet, format_range, sort_range, create_chart, etc.) to the workbook.",
                &[Param::new("actions", "array", "List of typed macro sub-actions to apply in order")],
            ),
        ];
        Self { declarations }
    }

    pub fn declarations(&self) -> &[ToolDeclaration] {
        &self.declarations
    }

    /// `GetToolsForProvider(dialect)`.
    pub fn for_dialect(&self, dialect: Dialect) -> Vec<Value> {
        self.declarations
            .iter()
            .map(|d| match dialect {
                Dialect::Gemini => d.to_gemini_format(),
                Dialect::OpenAI | Dialect::Ollama => d.to_openai_format(),
            })
            .collect()
    }

    pub fn names(&self) -> Vec<&str> {
        self.declarations.iter().map(|d| d.name.as_str()).collect()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// DISPATCHER
// ============================================================================

/// Routes tool calls to the [`SpreadsheetBackend`] and formats results (or
/// errors) as tool-response messages. Mutating dispatches write an
/// [`UndoAction`] to the journal before returning.
pub struct Dispatcher {
    backend: Arc<dyn SpreadsheetBackend>,
}

impl Dispatcher {
    pub fn new(backend: Arc<dyn SpreadsheetBackend>) -> Self {
        Self { backend }
    }

    /// Dispatch a single read-only query tool call.
    pub async fn dispatch_query(&self, call: &ToolCall) -> Message {
        let result = self.run_query(call).await;
        Message::tool_result(&call.id, result_to_content(result))
    }

    /// Run a single query tool call directly, bypassing the tool-response
    /// message wrapping `dispatch_query` does — used by the agent loop when
    /// it wants a raw `Value` (e.g. to route through the Task Orchestrator's
    /// cache).
    pub(crate) async fn run_query(&self, call: &ToolCall) -> Result<Value> {
        match call.name.as_str() {
            "list_sheets" => Ok(json!(self.backend.list_sheets().await?)),
            "query_batch" => {
                let sheet = call.input.get("sheet").and_then(|v| v.as_str());
                self.backend.query_batch(sheet).await
            }
            "get_range_values" => {
                let sheet = required_str(&call.input, "sheet")?;
                let range = required_str(&call.input, "range")?;
                self.backend.get_range_values(&sheet, &range).await
            }
            "get_cell_formula" => {
                let sheet = required_str(&call.input, "sheet")?;
                let cell = required_str(&call.input, "cell")?;
                Ok(json!(self.backend.get_cell_formula(&sheet, &cell).await?))
            }
            "get_active_cell" => {
                let (sheet, cell) = self.backend.get_active_cell().await?;
                Ok(json!({ "sheet": sheet, "cell": cell }))
            }
            other => Err(crate::Error::tool(format!("not a query tool: {other}"))),
        }
    }

    /// Dispatch a mutating `execute_macro` call, journaling one
    /// [`UndoAction`] per sub-action.
    ///
    /// On partial failure (sub-action N fails after 0..N-1 succeeded), the
    /// already-applied actions are compensated immediately in reverse order
    /// so the batch never leaves a half-applied mutation behind, and the
    /// error is folded back as tool-response content rather than raised.
    pub async fn dispatch_macro(
        &self,
        call: &ToolCall,
        conversation_id: &str,
        batch_id: i64,
        journal: &UndoJournal,
    ) -> Result<Message> {
        let actions: Vec<MacroAction> = match call.input.get("actions") {
            Some(v) => serde_json::from_value(v.clone())
                .map_err(|e| crate::Error::tool(format!("invalid execute_macro arguments: {e}")))?,
            None => return Ok(Message::tool_result(&call.id, json!({ "error": "missing 'actions' argument" }))),
        };

        let mut applied: Vec<UndoAction> = Vec::new();
        let mut results = Vec::new();

        for action in &actions {
            match self.backend.apply_macro_action(action).await {
                Ok((old_state, result)) => {
                    if action.is_undoable() {
                        let record = journal
                            .record(conversation_id, batch_id, action, old_state)
                            .await?;
                        applied.push(record);
                    }
                    results.push(result);
                }
                Err(e) => {
                    // Compensate everything this call already applied, in
                    // reverse order, before surfacing the failure.
                    for record in applied.iter().rev() {
                        let _ = self
                            .backend
                            .apply_inverse(&record.op_type, &record.sheet, &record.cell_or_range, &record.undo_data)
                            .await;
                        journal.discard(record).await?;
                    }
                    return Ok(Message::tool_result(
                        &call.id,
                        json!({ "error": e.to_string(), "completed": results.len() }),
                    ));
                }
            }
        }

        Ok(Message::tool_result(&call.id, json!({ "results": results })))
    }
}

fn required_str(input: &Value, key: &str) -> Result<String> {
    input
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| crate::Error::tool(format!("missing required argument: {key}")))
}

fn result_to_content(result: Result<Value>) -> Value {
    match result {
        Ok(v) => v,
        Err(e) => json!({ "error": e.to_string() }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockSpreadsheetBackend;
    use crate::undo::UndoJournal;

    fn call(name: &str, input: Value) -> ToolCall {
        ToolCall::new("call_1", name, input)
    }

    #[test]
    fn test_is_query_tool() {
        assert!(is_query_tool("list_sheets"));
        assert!(is_query_tool("get_range_values"));
        assert!(!is_query_tool("execute_macro"));
    }

    #[test]
    fn test_registry_has_six_tools() {
        let registry = ToolRegistry::new();
        assert_eq!(registry.declarations().len(), 6);
        assert!(registry.names().contains(&"execute_macro"));
    }

    #[test]
    fn test_for_dialect_openai_shape() {
        let registry = ToolRegistry::new();
        let tools = registry.for_dialect(Dialect::OpenAI);
        assert_eq!(tools[0]["type"], "function");
        assert!(tools[0]["function"]["name"].is_string());
    }

    #[test]
    fn test_for_dialect_gemini_shape() {
        let registry = ToolRegistry::new();
        let tools = registry.for_dialect(Dialect::Gemini);
        assert!(tools[0]["name"].is_string());
        assert!(tools[0].get("type").is_none());
    }

    #[tokio::test]
    async fn test_dispatch_query_list_sheets() {
        let backend = Arc::new(MockSpreadsheetBackend::new());
        let dispatcher = Dispatcher::new(backend);
        let msg = dispatcher.dispatch_query(&call("list_sheets", json!({}))).await;
        assert_eq!(msg.role, crate::types::MessageRole::Tool);
    }

    #[tokio::test]
    async fn test_dispatch_macro_write_cell_journals_undo() {
        let backend = Arc::new(MockSpreadsheetBackend::new());
        let dispatcher = Dispatcher::new(backend.clone());
        let journal = UndoJournal::new_in_memory();

        let macro_call = call(
            "execute_macro",
            json!({ "actions": [{ "action": "write_cell", "sheet": "Sheet1", "cell": "A1", "value": 42 }] }),
        );
        dispatcher.dispatch_macro(&macro_call, "conv-1", 1, &journal).await.unwrap();

        let records = journal.records_for_batch("conv-1", 1).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].op_type, "write_cell");
        assert_eq!(records[0].sheet, "Sheet1");
    }

    #[tokio::test]
    async fn test_dispatch_macro_partial_failure_compensates() {
        let backend = Arc::new(MockSpreadsheetBackend::new());
        let dispatcher = Dispatcher::new(backend.clone());
        let journal = UndoJournal::new_in_memory();

        let macro_call = call(
            "execute_macro",
            json!({ "actions": [
                { "action": "create_sheet", "name": "Plan1" },
                { "action": "create_sheet", "name": "Plan1" }
            ] }),
        );
        dispatcher.dispatch_macro(&macro_call, "conv-1", 1, &journal).await.unwrap();

        // Second create_sheet("Plan1") fails (duplicate); first should be compensated away.
        assert!(!backend.list_sheets().await.unwrap().contains(&"Plan1".to_string()));
        assert_eq!(journal.records_for_batch("conv-1", 1).await.unwrap().len(), 0);
    }
}
