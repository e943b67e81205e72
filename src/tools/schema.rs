use serde_json::{json, Map, Value};

use crate::models::QueryParam;
use crate::services::ConnectionManager;

use super::{optional_bool, optional_str, required_str};

pub async fn list_schemas(
    manager: &ConnectionManager,
    args: &Map<String, Value>,
) -> Result<Value, String> {
    let include_system = optional_bool(args, "includeSystem", false);
    let sql = if include_system {
        "SELECT schema_name, schema_owner, \
         CASE WHEN schema_name LIKE 'pg_%' OR schema_name = 'information_schema' \
              THEN 'system' ELSE 'user' END AS schema_type \
         FROM information_schema.schemata \
         ORDER BY schema_name"
    } else {
        "SELECT schema_name, schema_owner, 'user' AS schema_type \
         FROM information_schema.schemata \
         WHERE schema_name NOT LIKE 'pg_%' AND schema_name <> 'information_schema' \
         ORDER BY schema_name"
    };
    let result = manager
        .execute_query(sql, &[])
        .await
        .map_err(|e| e.to_string())?;
    Ok(Value::Array(result.rows))
}

pub async fn list_tables(
    manager: &ConnectionManager,
    args: &Map<String, Value>,
) -> Result<Value, String> {
    let schema = optional_str(args, "schema", "public");
    let include_views = optional_bool(args, "includeViews", false);
    let sql = if include_views {
        "SELECT c.relname AS table_name, \
         CASE c.relkind \
              WHEN 'r' THEN 'table' WHEN 'p' THEN 'partitioned table' \
              WHEN 'v' THEN 'view' WHEN 'm' THEN 'materialized view' \
         END AS table_type, \
         c.reltuples::bigint AS estimated_row_count, \
         pg_size_pretty(pg_total_relation_size(c.oid)) AS total_size \
         FROM pg_class c \
         JOIN pg_namespace n ON n.oid = c.relnamespace \
         WHERE n.nspname = $1 AND c.relkind IN ('r', 'p', 'v', 'm') \
         ORDER BY c.relname"
    } else {
        "SELECT c.relname AS table_name, \
         CASE c.relkind \
              WHEN 'r' THEN 'table' WHEN 'p' THEN 'partitioned table' \
         END AS table_type, \
         c.reltuples::bigint AS estimated_row_count, \
         pg_size_pretty(pg_total_relation_size(c.oid)) AS total_size \
         FROM pg_class c \
         JOIN pg_namespace n ON n.oid = c.relnamespace \
         WHERE n.nspname = $1 AND c.relkind IN ('r', 'p') \
         ORDER BY c.relname"
    };
    let result = manager
        .execute_query(sql, &[QueryParam::Text(schema.to_string())])
        .await
        .map_err(|e| e.to_string())?;
    Ok(Value::Array(result.rows))
}

pub async fn describe_table(
    manager: &ConnectionManager,
    args: &Map<String, Value>,
) -> Result<Value, String> {
    let schema = optional_str(args, "schema", "public").to_string();
    let table = required_str(args, "table")?.to_string();
    let params = [
        QueryParam::Text(schema.clone()),
        QueryParam::Text(table.clone()),
    ];

    let columns_sql = "SELECT column_name, data_type, is_nullable, column_default, \
         character_maximum_length, numeric_precision, numeric_scale \
         FROM information_schema.columns \
         WHERE table_schema = $1 AND table_name = $2 \
         ORDER BY ordinal_position";

    let constraints_sql = "SELECT tc.constraint_name, tc.constraint_type, kcu.column_name \
         FROM information_schema.table_constraints tc \
         LEFT JOIN information_schema.key_column_usage kcu \
           ON kcu.constraint_name = tc.constraint_name \
          AND kcu.table_schema = tc.table_schema \
          AND kcu.table_name = tc.table_name \
         WHERE tc.table_schema = $1 AND tc.table_name = $2 \
         ORDER BY tc.constraint_name, kcu.ordinal_position";

    let indexes_sql = "SELECT indexname, indexdef \
         FROM pg_indexes \
         WHERE schemaname = $1 AND tablename = $2 \
         ORDER BY indexname";

    let (columns, constraints, indexes) = tokio::join!(
        manager.execute_query(columns_sql, &params),
        manager.execute_query(constraints_sql, &params),
        manager.execute_query(indexes_sql, &params),
    );
    let columns = columns.map_err(|e| e.to_string())?;
    let constraints = constraints.map_err(|e| e.to_string())?;
    let indexes = indexes.map_err(|e| e.to_string())?;

    if columns.rows.is_empty() {
        return Err(format!("Table {schema}.{table} not found"));
    }

    Ok(json!({
        "table": { "schema": schema, "name": table },
        "columns": columns.rows,
        "constraints": merge_constraints(&constraints.rows),
        "indexes": indexes.rows,
    }))
}

/// Collapse one row per (constraint, column) into one object per constraint
/// with a column name array, preserving first-seen order.
fn merge_constraints(rows: &[Value]) -> Vec<Value> {
    let mut order: Vec<String> = Vec::new();
    let mut merged: std::collections::HashMap<String, Value> = std::collections::HashMap::new();

    for row in rows {
        let Some(name) = row.get("constraint_name").and_then(Value::as_str) else {
            continue;
        };
        let constraint_type = row
            .get("constraint_type")
            .and_then(Value::as_str)
            .unwrap_or("");
        let column = row.get("column_name").and_then(Value::as_str);

        let entry = merged.entry(name.to_string()).or_insert_with(|| {
            order.push(name.to_string());
            json!({ "name": name, "type": constraint_type, "columns": [] })
        });
        if let (Some(column), Some(columns)) =
            (column, entry["columns"].as_array_mut())
        {
            columns.push(Value::String(column.to_string()));
        }
    }

    order
        .into_iter()
        .filter_map(|name| merged.remove(&name))
        .collect()
}

pub async fn list_databases(manager: &ConnectionManager) -> Result<Value, String> {
    let sql = "SELECT d.datname AS name, \
         pg_get_userbyid(d.datdba) AS owner, \
         pg_encoding_to_char(d.encoding) AS encoding, \
         d.datcollate AS collation, \
         pg_size_pretty(pg_database_size(d.datname)) AS size \
         FROM pg_database d \
         WHERE NOT d.datistemplate \
         ORDER BY d.datname";
    let result = manager
        .execute_query(sql, &[])
        .await
        .map_err(|e| e.to_string())?;
    Ok(Value::Array(result.rows))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_constraints_groups_columns() {
        let rows = vec![
            json!({"constraint_name": "users_pkey", "constraint_type": "PRIMARY KEY", "column_name": "id"}),
            json!({"constraint_name": "users_email_key", "constraint_type": "UNIQUE", "column_name": "email"}),
            json!({"constraint_name": "users_email_key", "constraint_type": "UNIQUE", "column_name": "tenant_id"}),
        ];
        let merged = merge_constraints(&rows);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0]["name"], "users_pkey");
        assert_eq!(merged[0]["columns"], json!(["id"]));
        assert_eq!(merged[1]["columns"], json!(["email", "tenant_id"]));
    }

    #[test]
    fn test_merge_constraints_tolerates_missing_columns() {
        let rows = vec![json!({
            "constraint_name": "orders_check",
            "constraint_type": "CHECK",
            "column_name": null
        })];
        let merged = merge_constraints(&rows);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0]["columns"], json!([]));
    }
}
