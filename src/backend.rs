//! `SpreadsheetBackend`: the opaque capability the dispatcher drives.
//!
//! The binary file format, cell formatting, chart rendering, and pivot-table
//! plumbing are explicitly out of scope for this crate (see PURPOSE & SCOPE)
//! — they live behind this narrow trait. Only a [`MockSpreadsheetBackend`]
//! (used by tests) is provided here.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::Result;

/// A single cell address, e.g. `"A1"`.
pub type CellRef = String;
/// A range address, e.g. `"A1:C10"`.
pub type RangeRef = String;

/// A typed sub-action dispatched through `execute_macro`.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum MacroAction {
    WriteCell { sheet: String, cell: CellRef, value: Value },
    WriteRange { sheet: String, range: RangeRef, values: Vec<Vec<Value>> },
    CreateSheet { name: String },
    DeleteSheet { name: String },
    RenameSheet { old_name: String, new_name: String },
    MergeCells { sheet: String, range: RangeRef },
    InsertRows { sheet: String, row: u32, count: u32 },
    DeleteRows { sheet: String, row: u32, count: u32 },
    ClearRange { sheet: String, range: RangeRef },
    SortRange { sheet: String, range: RangeRef, column: u32, ascending: bool },
    SetColumnWidth { sheet: String, column: u32, width: f64 },
    SetRowHeight { sheet: String, row: u32, height: f64 },
    FormatRange { sheet: String, range: RangeRef, format: Value },
    CreateChart { sheet: String, range: RangeRef, chart_type: String },
}

impl MacroAction {
    /// The operation-type tag used in undo journal records.
    pub fn op_type(&self) -> &'static str {
        match self {
            MacroAction::WriteCell { .. } => "write_cell",
            MacroAction::WriteRange { .. } => "write_range",
            MacroAction::CreateSheet { .. } => "create_sheet",
            MacroAction::DeleteSheet { .. } => "delete_sheet",
            MacroAction::RenameSheet { .. } => "rename_sheet",
            MacroAction::MergeCells { .. } => "merge_cells",
            MacroAction::InsertRows { .. } => "insert_rows",
            MacroAction::DeleteRows { .. } => "delete_rows",
            MacroAction::ClearRange { .. } => "clear_range",
            MacroAction::SortRange { .. } => "sort_range",
            MacroAction::SetColumnWidth { .. } => "set_column_width",
            MacroAction::SetRowHeight { .. } => "set_row_height",
            MacroAction::FormatRange { .. } => "format_range",
            MacroAction::CreateChart { .. } => "create_chart",
        }
    }

    /// Is this action a mutation at all? (`create_chart` is the one
    /// execute_macro sub-action with no meaningful undo.)
    pub fn is_undoable(&self) -> bool {
        !matches!(self, MacroAction::CreateChart { .. })
    }
}

/// The narrow capability interface the dispatcher drives. A single mutex
/// guards all calls (see CONCURRENCY & RESOURCE MODEL — the backend handle
/// is shared and not assumed thread-safe).
#[async_trait]
pub trait SpreadsheetBackend: Send + Sync {
    async fn list_sheets(&self) -> Result<Vec<String>>;
    async fn query_batch(&self, sheet: Option<&str>) -> Result<Value>;
    async fn get_range_values(&self, sheet: &str, range: &RangeRef) -> Result<Value>;
    async fn get_cell_formula(&self, sheet: &str, cell: &CellRef) -> Result<Option<String>>;
    async fn get_active_cell(&self) -> Result<(String, CellRef)>;

    /// Apply one macro sub-action, returning its pre-state snapshot (for the
    /// Undo Journal) and the user-visible result payload.
    async fn apply_macro_action(&self, action: &MacroAction) -> Result<(Value, Value)>;

    /// Apply a previously-captured inverse snapshot back onto the sheet.
    async fn apply_inverse(&self, op_type: &str, sheet: &str, cell_or_range: &str, undo_data: &Value) -> Result<()>;
}

/// An in-memory, single-sheet-map backend used by tests and the seed
/// end-to-end scenarios. Cells are stored as raw JSON values; formulas are
/// tracked in a side map.
#[derive(Default)]
pub struct MockSpreadsheetBackend {
    sheets: Mutex<HashMap<String, HashMap<CellRef, Value>>>,
    formulas: Mutex<HashMap<(String, CellRef), String>>,
    active_cell: Mutex<(String, CellRef)>,
    merges: Mutex<HashMap<String, Vec<RangeRef>>>,
    column_widths: Mutex<HashMap<(String, u32), f64>>,
    row_heights: Mutex<HashMap<(String, u32), f64>>,
}

impl MockSpreadsheetBackend {
    pub fn new() -> Self {
        let mut sheets = HashMap::new();
        sheets.insert("Sheet1".to_string(), HashMap::new());
        Self {
            sheets: Mutex::new(sheets),
            formulas: Mutex::new(HashMap::new()),
            active_cell: Mutex::new(("Sheet1".to_string(), "A1".to_string())),
            merges: Mutex::new(HashMap::new()),
            column_widths: Mutex::new(HashMap::new()),
            row_heights: Mutex::new(HashMap::new()),
        }
    }

    fn cell(sheets: &HashMap<String, HashMap<CellRef, Value>>, sheet: &str, cell: &str) -> Value {
        sheets
            .get(sheet)
            .and_then(|s| s.get(cell))
            .cloned()
            .unwrap_or(Value::Null)
    }
}

/// Cells created through `write_range` (and row-shifting ops below) use the
/// `R{row}C{col}` key form; cells addressed by raw A1 notation (`write_cell`)
/// don't carry enough structure to be reindexed and are left alone by row
/// insert/delete, matching this backend's best-effort-outside-the-happy-path
/// scope (see the module doc comment).
fn parse_row_col(cell: &str) -> Option<(u32, u32)> {
    let rest = cell.strip_prefix('R')?;
    let (row_str, col_str) = rest.split_once('C')?;
    Some((row_str.parse().ok()?, col_str.parse().ok()?))
}

fn shift_rows(cells: &mut HashMap<CellRef, Value>, from_row: u32, delta: i64) {
    let moved: Vec<(CellRef, u32, u32, Value)> = cells
        .iter()
        .filter_map(|(k, v)| {
            let (row, col) = parse_row_col(k)?;
            (row >= from_row).then(|| (k.clone(), row, col, v.clone()))
        })
        .collect();

    for (old_key, row, col, value) in moved {
        cells.remove(&old_key);
        let new_row = (row as i64 + delta).max(0) as u32;
        cells.insert(format!("R{new_row}C{col}"), value);
    }
}

fn extract_rows(cells: &mut HashMap<CellRef, Value>, row: u32, count: u32) -> HashMap<CellRef, Value> {
    let keys: Vec<CellRef> = cells
        .keys()
        .filter(|k| parse_row_col(k).is_some_and(|(r, _)| r >= row && r < row + count))
        .cloned()
        .collect();

    let mut removed = HashMap::new();
    for key in keys {
        if let Some(value) = cells.remove(&key) {
            removed.insert(key, value);
        }
    }
    removed
}

#[async_trait]
impl SpreadsheetBackend for MockSpreadsheetBackend {
    async fn list_sheets(&self) -> Result<Vec<String>> {
        Ok(self.sheets.lock().unwrap().keys().cloned().collect())
    }

    async fn query_batch(&self, sheet: Option<&str>) -> Result<Value> {
        let sheets = self.sheets.lock().unwrap();
        let target = sheet.unwrap_or("Sheet1");
        let data = sheets.get(target).cloned().unwrap_or_default();
        Ok(serde_json::json!({
            "sheet": target,
            "row_count": data.len(),
            "used_range": data.keys().cloned().collect::<Vec<_>>(),
        }))
    }

    async fn get_range_values(&self, sheet: &str, range: &RangeRef) -> Result<Value> {
        let sheets = self.sheets.lock().unwrap();
        let data = sheets
            .get(sheet)
            .ok_or_else(|| crate::Error::backend(format!("sheet not found: {sheet}")))?;
        Ok(serde_json::json!({ "range": range, "values": data }))
    }

    async fn get_cell_formula(&self, sheet: &str, cell: &CellRef) -> Result<Option<String>> {
        Ok(self
            .formulas
            .lock()
            .unwrap()
            .get(&(sheet.to_string(), cell.clone()))
            .cloned())
    }

    async fn get_active_cell(&self) -> Result<(String, CellRef)> {
        Ok(self.active_cell.lock().unwrap().clone())
    }

    async fn apply_macro_action(&self, action: &MacroAction) -> Result<(Value, Value)> {
        match action {
            MacroAction::WriteCell { sheet, cell, value } => {
                let mut sheets = self.sheets.lock().unwrap();
                let old = Self::cell(&sheets, sheet, cell);
                sheets.entry(sheet.clone()).or_default().insert(cell.clone(), value.clone());
                Ok((old, serde_json::json!({ "written": true })))
            }
            MacroAction::WriteRange { sheet, range: _, values } => {
                let mut sheets = self.sheets.lock().unwrap();
                let entry = sheets.entry(sheet.clone()).or_default();
                let old = serde_json::to_value(&*entry).unwrap_or(Value::Null);
                for (r, row) in values.iter().enumerate() {
                    for (c, v) in row.iter().enumerate() {
                        let cell = format!("R{r}C{c}");
                        entry.insert(cell, v.clone());
                    }
                }
                Ok((old, serde_json::json!({ "written": true })))
            }
            MacroAction::CreateSheet { name } => {
                let mut sheets = self.sheets.lock().unwrap();
                if sheets.contains_key(name) {
                    return Err(crate::Error::backend(format!("sheet already exists: {name}")));
                }
                sheets.insert(name.clone(), HashMap::new());
                Ok((serde_json::json!({ "name": name }), serde_json::json!({ "created": name })))
            }
            MacroAction::DeleteSheet { name } => {
                let mut sheets = self.sheets.lock().unwrap();
                let snapshot = sheets
                    .remove(name)
                    .ok_or_else(|| crate::Error::backend(format!("sheet not found: {name}")))?;
                Ok((
                    serde_json::to_value(snapshot).unwrap_or(Value::Null),
                    serde_json::json!({ "deleted": name }),
                ))
            }
            MacroAction::RenameSheet { old_name, new_name } => {
                let mut sheets = self.sheets.lock().unwrap();
                let data = sheets
                    .remove(old_name)
                    .ok_or_else(|| crate::Error::backend(format!("sheet not found: {old_name}")))?;
                sheets.insert(new_name.clone(), data);
                Ok((
                    serde_json::json!({ "old_name": old_name }),
                    serde_json::json!({ "renamed_to": new_name }),
                ))
            }
            MacroAction::ClearRange { sheet, range } => {
                let mut sheets = self.sheets.lock().unwrap();
                let entry = sheets.entry(sheet.clone()).or_default();
                let old = serde_json::to_value(&*entry).unwrap_or(Value::Null);
                entry.clear();
                Ok((old, serde_json::json!({ "cleared": range })))
            }
            MacroAction::MergeCells { sheet, range } => {
                let mut merges = self.merges.lock().unwrap();
                let entry = merges.entry(sheet.clone()).or_default();
                let old = serde_json::to_value(&*entry).unwrap_or(Value::Null);
                entry.push(range.clone());
                Ok((old, serde_json::json!({ "merged": range })))
            }
            MacroAction::InsertRows { sheet, row, count } => {
                let mut sheets = self.sheets.lock().unwrap();
                let entry = sheets.entry(sheet.clone()).or_default();
                shift_rows(entry, *row, *count as i64);
                Ok((
                    serde_json::json!({ "row": row, "count": count }),
                    serde_json::json!({ "inserted": count }),
                ))
            }
            MacroAction::DeleteRows { sheet, row, count } => {
                let mut sheets = self.sheets.lock().unwrap();
                let entry = sheets.entry(sheet.clone()).or_default();
                let removed = extract_rows(entry, *row, *count);
                shift_rows(entry, *row + *count, -(*count as i64));
                Ok((
                    serde_json::json!({ "row": row, "count": count, "contents": removed }),
                    serde_json::json!({ "deleted": count }),
                ))
            }
            MacroAction::SortRange { sheet, range: _, column: _, ascending: _ } => {
                // The mock's cell map carries no column/row ordering to sort
                // by, so the forward op is a pass-through; the full pre-sort
                // snapshot still lets undo restore exact prior state.
                let sheets = self.sheets.lock().unwrap();
                let snapshot = sheets.get(sheet).cloned().unwrap_or_default();
                let old = serde_json::to_value(&snapshot).unwrap_or(Value::Null);
                Ok((old, serde_json::json!({ "sorted": true })))
            }
            MacroAction::SetColumnWidth { sheet, column, width } => {
                let mut widths = self.column_widths.lock().unwrap();
                let key = (sheet.clone(), *column);
                let old = widths.get(&key).copied();
                widths.insert(key, *width);
                Ok((old.map(|w| serde_json::json!(w)).unwrap_or(Value::Null), serde_json::json!({ "width": width })))
            }
            MacroAction::SetRowHeight { sheet, row, height } => {
                let mut heights = self.row_heights.lock().unwrap();
                let key = (sheet.clone(), *row);
                let old = heights.get(&key).copied();
                heights.insert(key, *height);
                Ok((old.map(|h| serde_json::json!(h)).unwrap_or(Value::Null), serde_json::json!({ "height": height })))
            }
            MacroAction::FormatRange { range, .. } => {
                // Best-effort: no formatting state is tracked, so this is the
                // one op type whose inverse is intentionally a no-op.
                let _ = range;
                Ok((Value::Null, serde_json::json!({ "ok": true })))
            }
            MacroAction::CreateChart { .. } => Ok((Value::Null, serde_json::json!({ "ok": true }))),
        }
    }

    async fn apply_inverse(&self, op_type: &str, sheet: &str, cell_or_range: &str, undo_data: &Value) -> Result<()> {
        match op_type {
            "write_cell" => {
                let mut sheets = self.sheets.lock().unwrap();
                sheets
                    .entry(sheet.to_string())
                    .or_default()
                    .insert(cell_or_range.to_string(), undo_data.clone());
            }
            "create_sheet" => {
                self.sheets.lock().unwrap().remove(sheet);
            }
            "delete_sheet" => {
                let restored: HashMap<CellRef, Value> =
                    serde_json::from_value(undo_data.clone()).unwrap_or_default();
                self.sheets.lock().unwrap().insert(sheet.to_string(), restored);
            }
            "rename_sheet" => {
                let old_name = undo_data
                    .get("old_name")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| crate::Error::undo("missing old_name in undo data"))?;
                let mut sheets = self.sheets.lock().unwrap();
                if let Some(data) = sheets.remove(sheet) {
                    sheets.insert(old_name.to_string(), data);
                }
            }
            "write_range" | "clear_range" | "sort_range" => {
                let restored: HashMap<CellRef, Value> =
                    serde_json::from_value(undo_data.clone()).unwrap_or_default();
                self.sheets.lock().unwrap().insert(sheet.to_string(), restored);
            }
            "merge_cells" => {
                let restored: Vec<RangeRef> = serde_json::from_value(undo_data.clone()).unwrap_or_default();
                self.merges.lock().unwrap().insert(sheet.to_string(), restored);
            }
            "insert_rows" => {
                let row = undo_data.get("row").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
                let count = undo_data.get("count").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
                let mut sheets = self.sheets.lock().unwrap();
                let entry = sheets.entry(sheet.to_string()).or_default();
                extract_rows(entry, row, count);
                shift_rows(entry, row + count, -(count as i64));
            }
            "delete_rows" => {
                let row = undo_data.get("row").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
                let count = undo_data.get("count").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
                let contents: HashMap<CellRef, Value> = undo_data
                    .get("contents")
                    .cloned()
                    .and_then(|v| serde_json::from_value(v).ok())
                    .unwrap_or_default();
                let mut sheets = self.sheets.lock().unwrap();
                let entry = sheets.entry(sheet.to_string()).or_default();
                shift_rows(entry, row, count as i64);
                entry.extend(contents);
            }
            "set_column_width" => {
                let column: u32 = cell_or_range.parse().unwrap_or(0);
                let mut widths = self.column_widths.lock().unwrap();
                match undo_data.as_f64() {
                    Some(w) => { widths.insert((sheet.to_string(), column), w); }
                    None => { widths.remove(&(sheet.to_string(), column)); }
                }
            }
            "set_row_height" => {
                let row: u32 = cell_or_range.parse().unwrap_or(0);
                let mut heights = self.row_heights.lock().unwrap();
                match undo_data.as_f64() {
                    Some(h) => { heights.insert((sheet.to_string(), row), h); }
                    None => { heights.remove(&(sheet.to_string(), row)); }
                }
            }
            _ => {
                // Best-effort ops with no tracked state (format_range,
                // create_chart): nothing to restore.
            }
        }
        Ok(())
    }
}
