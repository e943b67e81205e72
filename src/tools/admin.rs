use serde_json::{json, Map, Value};

use crate::models::QueryParam;
use crate::services::ConnectionManager;

use super::{optional_bool, optional_f64, optional_i64, optional_str, required_str};

pub async fn get_connection_status(manager: &ConnectionManager) -> Result<Value, String> {
    serde_json::to_value(manager.get_status().await).map_err(|e| e.to_string())
}

pub async fn get_database_version(manager: &ConnectionManager) -> Result<Value, String> {
    let result = manager
        .execute_query("SELECT version() AS version", &[])
        .await
        .map_err(|e| e.to_string())?;
    let version = result
        .rows
        .first()
        .and_then(|row| row.get("version"))
        .and_then(Value::as_str)
        .ok_or_else(|| "server returned no version row".to_string())?;
    Ok(Value::String(version.to_string()))
}

pub async fn get_database_size(
    manager: &ConnectionManager,
    args: &Map<String, Value>,
) -> Result<Value, String> {
    let limit = optional_i64(args, "limit", 10).max(1);

    let database_sql = "SELECT current_database() AS name, \
         pg_size_pretty(pg_database_size(current_database())) AS size";
    let tables_sql = "SELECT n.nspname AS schema, c.relname AS table, \
         pg_size_pretty(pg_total_relation_size(c.oid)) AS total_size, \
         pg_total_relation_size(c.oid) AS size_bytes \
         FROM pg_class c \
         JOIN pg_namespace n ON n.oid = c.relnamespace \
         WHERE c.relkind IN ('r', 'p', 'm') \
           AND n.nspname NOT LIKE 'pg_%' AND n.nspname <> 'information_schema' \
         ORDER BY pg_total_relation_size(c.oid) DESC \
         LIMIT $1";

    let tables_params = [QueryParam::Int(limit)];
    let (database, tables) = tokio::join!(
        manager.execute_query(database_sql, &[]),
        manager.execute_query(tables_sql, &tables_params),
    );
    let database = database.map_err(|e| e.to_string())?;
    let tables = tables.map_err(|e| e.to_string())?;

    Ok(json!({
        "database": database.rows.first().cloned().unwrap_or(Value::Null),
        "largestTables": tables.rows,
    }))
}

pub async fn get_table_stats(
    manager: &ConnectionManager,
    args: &Map<String, Value>,
) -> Result<Value, String> {
    let schema = optional_str(args, "schema", "public").to_string();
    let table = required_str(args, "table")?.to_string();

    let sql = "SELECT schemaname, relname, seq_scan, seq_tup_read, idx_scan, idx_tup_fetch, \
         n_tup_ins, n_tup_upd, n_tup_del, n_live_tup, n_dead_tup, \
         last_vacuum::text, last_autovacuum::text, last_analyze::text, last_autoanalyze::text \
         FROM pg_stat_user_tables \
         WHERE schemaname = $1 AND relname = $2";
    let result = manager
        .execute_query(
            sql,
            &[QueryParam::Text(schema.clone()), QueryParam::Text(table.clone())],
        )
        .await
        .map_err(|e| e.to_string())?;

    match result.rows.into_iter().next() {
        Some(row) => Ok(row),
        None => Ok(json!({
            "error": format!("No statistics found for {schema}.{table}")
        })),
    }
}

pub async fn list_active_connections(
    manager: &ConnectionManager,
    args: &Map<String, Value>,
) -> Result<Value, String> {
    let include_idle = optional_bool(args, "includeIdle", false);
    let sql = if include_idle {
        "SELECT pid, usename, datname, client_addr::text, state, \
         backend_start::text, query_start::text, left(query, 200) AS query \
         FROM pg_stat_activity \
         WHERE pid <> pg_backend_pid() \
         ORDER BY backend_start"
    } else {
        "SELECT pid, usename, datname, client_addr::text, state, \
         backend_start::text, query_start::text, left(query, 200) AS query \
         FROM pg_stat_activity \
         WHERE pid <> pg_backend_pid() AND state <> 'idle' \
         ORDER BY backend_start"
    };
    let result = manager
        .execute_query(sql, &[])
        .await
        .map_err(|e| e.to_string())?;
    Ok(Value::Array(result.rows))
}

pub async fn list_long_running_queries(
    manager: &ConnectionManager,
    args: &Map<String, Value>,
) -> Result<Value, String> {
    let min_duration = optional_f64(args, "minDurationSeconds", 5.0).max(0.0);
    let sql = "SELECT pid, usename, datname, state, \
         extract(epoch FROM (now() - query_start)) AS duration_seconds, \
         query_start::text, left(query, 200) AS query \
         FROM pg_stat_activity \
         WHERE state = 'active' AND pid <> pg_backend_pid() \
           AND now() - query_start > make_interval(secs => $1) \
         ORDER BY query_start";
    let result = manager
        .execute_query(sql, &[QueryParam::Float(min_duration)])
        .await
        .map_err(|e| e.to_string())?;
    Ok(Value::Array(result.rows))
}
