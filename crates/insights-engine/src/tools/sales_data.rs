use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use serde_json::Value;
use tracing::{info, instrument, warn};

use insights_core::planner::QueryPlanner;
use insights_core::tools::{LocalTool, ToolArgs, ToolError};

pub const SALES_DATA_TOOL: &str = "sales_data_insights";

/// System prompt for the query planner: the `order_data` table layout and
/// the aggregation rules that follow from it.
pub const SALES_SCHEMA_PROMPT: &str = r#"You write SQLite queries against one table, order_data.
Columns:
  Number_of_Orders INTEGER            orders processed
  Sum_of_Order_Value_USD REAL         total order value in USD
  Sum_of_Number_of_Items REAL         items across the orders
  Number_of_Orders_with_Discount INTEGER
  Sum_of_Discount_Percentage REAL     divide by a count for an average discount
  Sum_of_Shipping_Cost_USD REAL
  Number_of_Orders_Returned INTEGER
  Number_of_Orders_Cancelled INTEGER  cancelled before shipping
  Sum_of_Time_to_Fulfillment REAL
  Number_of_Orders_Repeat_Customers INTEGER
  Year INTEGER, Month INTEGER, Day INTEGER, Date TIMESTAMP
  Day_of_Week INTEGER                 0 is Monday
  main_category TEXT, sub_category TEXT, product_type TEXT, Region TEXT

Rows are pre-aggregated, so every query aggregates with GROUP BY.
Never use AVG(). An average is a SUM divided by the SUM of its count, e.g.
  SUM(Sum_of_Order_Value_USD)/SUM(Number_of_Orders) AS Avg_Order_Value
Multiply ratios by 1.0 to force float division.
Use DISTINCT when listing categories, days or other entities.
If the question cannot be answered from this table, reply with a sentence
starting with "Error:" instead of a query."#;

/// Answers sales questions by asking a planner for SQL and running it
/// read-only against the sales database.
pub struct SalesDataTool {
    planner: Arc<dyn QueryPlanner>,
    db_path: PathBuf,
}

impl SalesDataTool {
    pub fn new(planner: Arc<dyn QueryPlanner>, db_path: PathBuf) -> Self {
        Self { planner, db_path }
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }
}

#[async_trait]
impl LocalTool for SalesDataTool {
    fn name(&self) -> &str {
        SALES_DATA_TOOL
    }

    fn description(&self) -> &str {
        "Get data insights about the Contoso sales data: total sales, return rates, \
         discounts given and more, by date, product category or region. Questions that \
         cannot be answered come back with an error message, otherwise the data is returned."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "required": ["question"],
            "properties": {
                "question": {
                    "type": "string",
                    "description": "Natural language question about the sales data"
                }
            }
        })
    }

    #[instrument(skip_all, fields(tool = SALES_DATA_TOOL))]
    async fn invoke(&self, args: ToolArgs) -> Result<Value, ToolError> {
        let start = Instant::now();
        let question = args
            .get("question")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::InvalidArguments("question is required".into()))?;

        let query = self
            .planner
            .plan_query(question)
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("query planning failed: {e}")))?;
        info!(question, query = %query, "planned query");

        if query.to_lowercase().starts_with("error") {
            return Ok(result(None, Some(query.clone()), &query));
        }

        let path = self.db_path.clone();
        let sql = query.clone();
        let rows = tokio::task::spawn_blocking(move || query_records(&path, &sql))
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("query task failed: {e}")))?;

        let elapsed_ms = start.elapsed().as_millis() as u64;
        match rows {
            Ok(records) => {
                info!(rows = records.len(), elapsed_ms, "query executed");
                Ok(result(Some(records), None, &query))
            }
            Err(e) => {
                warn!(error = %e, elapsed_ms, "query failed");
                Ok(result(None, Some(e.to_string()), &query))
            }
        }
    }
}

fn result(data: Option<Vec<Value>>, error: Option<String>, query: &str) -> Value {
    serde_json::json!({
        "data": data,
        "error": error,
        "query": query,
    })
}

/// Run `query` on a read-only connection and return one JSON object per row.
fn query_records(path: &Path, query: &str) -> Result<Vec<Value>, rusqlite::Error> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    let mut stmt = conn.prepare(query)?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

    let mut rows = stmt.query([])?;
    let mut records = Vec::new();
    while let Some(row) = rows.next()? {
        let mut record = serde_json::Map::with_capacity(columns.len());
        for (i, name) in columns.iter().enumerate() {
            record.insert(name.clone(), json_value(row.get_ref(i)?));
        }
        records.push(Value::Object(record));
    }
    Ok(records)
}

fn json_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f).map_or(Value::Null, Value::Number),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(format!("<blob: {} bytes>", b.len())),
    }
}
