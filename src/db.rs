use log::{debug, error, info, warn};
use serde_json::{json, Value};
use sqlx::mysql::{MySqlArguments, MySqlRow};
use sqlx::{Column, MySql, Pool, Row, TypeInfo};
use std::time::Duration;

use crate::error::DbError;

/// Statement keywords refused while the server runs in read-only mode.
const FORBIDDEN_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "DROP", "CREATE", "ALTER", "TRUNCATE", "GRANT", "REVOKE",
];

#[derive(Debug)]
pub struct SchemaResult {
    pub description: String,
    pub schemas: Vec<Value>,
}

#[derive(Debug)]
pub struct QueryResult {
    pub rows: Vec<Value>,
    pub row_count: usize,
    pub truncated: bool,
}

#[derive(Debug)]
pub struct InsertResult {
    pub last_insert_id: u64,
}

#[derive(Debug)]
pub struct MutationResult {
    pub affected_rows: u64,
}

/// Validates that an identifier (table, database or column name) contains
/// only alphanumeric characters or underscores. This is what makes it safe
/// to interpolate identifiers into statements where parameters cannot be
/// used (USE, SHOW INDEX, INSERT/UPDATE/DELETE targets).
pub fn is_valid_identifier(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_alphanumeric() || c == '_')
}

fn valid_identifier(name: &str) -> Result<&str, DbError> {
    if is_valid_identifier(name) {
        Ok(name)
    } else {
        Err(DbError::InvalidIdentifier(name.to_string()))
    }
}

/// Rejects statements other than plain SELECTs. Keyword screening works on
/// word boundaries so that column names like `created_at` do not trip the
/// CREATE filter.
pub fn validate_read_only(query: &str) -> Result<(), DbError> {
    let upper = query.trim().to_uppercase();
    let mut tokens = upper.split(|c: char| !c.is_alphanumeric() && c != '_');
    match tokens.next() {
        Some("SELECT") => {}
        _ => {
            return Err(DbError::ReadOnlyViolation(
                "Only SELECT queries are allowed. \
                 Start the server with --allow-dangerous-queries to execute other statements."
                    .to_string(),
            ));
        }
    }
    for token in tokens {
        if FORBIDDEN_KEYWORDS.contains(&token) {
            return Err(DbError::ReadOnlyViolation(format!(
                "Query contains forbidden keyword: {token}. \
                 Start the server with --allow-dangerous-queries to allow such queries."
            )));
        }
    }
    Ok(())
}

pub async fn connect_with_retry(database_url: &str) -> Result<Pool<MySql>, DbError> {
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY_MS: u64 = 1000;
    let mut retry_count = 0;

    loop {
        match sqlx::mysql::MySqlPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
        {
            Ok(pool) => {
                info!("Successfully connected to MySQL database");
                return Ok(pool);
            }
            Err(e) => {
                retry_count += 1;
                if retry_count >= MAX_RETRIES {
                    error!("Failed to connect to database after {MAX_RETRIES} retries: {e}");
                    return Err(DbError::ConnectionError(e));
                }
                warn!("Database connection failed (attempt {retry_count}/{MAX_RETRIES}): {e}");
                info!("Retrying in {RETRY_DELAY_MS}ms...");
                tokio::time::sleep(Duration::from_millis(RETRY_DELAY_MS)).await;
            }
        }
    }
}

async fn current_database(pool: &Pool<MySql>) -> Result<String, DbError> {
    let current: Option<String> = sqlx::query_scalar("SELECT DATABASE()")
        .fetch_one(pool)
        .await?;
    current.ok_or(DbError::NoDatabaseSelected)
}

pub async fn get_schema(table_name: String, pool: &Pool<MySql>) -> Result<SchemaResult, DbError> {
    debug!("Getting schema for: {table_name}");
    let current_db = current_database(pool).await?;

    if table_name == "all-tables" {
        let tables_query = "SELECT table_name FROM information_schema.tables \
                            WHERE table_schema = ? AND table_type = 'BASE TABLE'";
        let tables = sqlx::query(tables_query)
            .bind(&current_db)
            .fetch_all(pool)
            .await?;

        let mut schemas = Vec::new();
        for table_row in tables {
            let name: String = table_row.try_get("table_name")?;
            if !is_valid_identifier(&name) {
                // SHOW INDEX interpolates the name, so skip anything unusual.
                warn!("Skipping table with non-standard name: {name}");
                continue;
            }
            match table_schema(pool, &current_db, &name).await {
                Ok(schema) => schemas.push(schema),
                Err(e) => warn!("Failed to get schema for table {name}: {e}"),
            }
        }

        info!("Retrieved schemas for {} tables", schemas.len());
        Ok(SchemaResult {
            description: format!("Retrieved schemas for {} tables.", schemas.len()),
            schemas,
        })
    } else {
        valid_identifier(&table_name)?;
        let schema = table_schema(pool, &current_db, &table_name).await?;
        info!("Retrieved schema for table '{table_name}'");
        Ok(SchemaResult {
            description: format!("Retrieved schema for table '{table_name}'."),
            schemas: vec![schema],
        })
    }
}

async fn table_schema(
    pool: &Pool<MySql>,
    current_db: &str,
    table_name: &str,
) -> Result<Value, DbError> {
    // Values in WHERE clauses are bound, which is safe from injection.
    let table_info_query =
        "SELECT table_name FROM information_schema.tables WHERE table_name = ? AND table_schema = ?";
    let table_info = sqlx::query(table_info_query)
        .bind(table_name)
        .bind(current_db)
        .fetch_optional(pool)
        .await?;

    if table_info.is_none() {
        return Err(DbError::NotFound(format!(
            "Table '{table_name}' does not exist in database '{current_db}'"
        )));
    }

    let columns_query =
        "SELECT column_name, data_type, is_nullable, column_default, column_key, extra, column_comment \
         FROM information_schema.columns \
         WHERE table_name = ? AND table_schema = ? \
         ORDER BY ordinal_position";
    let columns = sqlx::query(columns_query)
        .bind(table_name)
        .bind(current_db)
        .fetch_all(pool)
        .await?;

    // SHOW INDEX takes the table as an identifier. Both names are validated
    // before we get here, so the interpolation is safe.
    let indexes_query = format!("SHOW INDEX FROM `{current_db}`.`{table_name}`");
    let indexes = sqlx::query(&indexes_query).fetch_all(pool).await?;

    let column_info: Vec<Value> = columns
        .into_iter()
        .map(|row| {
            json!({
                "name": row.try_get::<String, _>("column_name").unwrap_or_default(),
                "type": row.try_get::<String, _>("data_type").unwrap_or_default(),
                "nullable": row.try_get::<String, _>("is_nullable").unwrap_or_default() == "YES",
                "default": row.try_get::<Option<String>, _>("column_default").unwrap_or_default(),
                "key": row.try_get::<String, _>("column_key").unwrap_or_default(),
                "extra": row.try_get::<String, _>("extra").unwrap_or_default(),
                "comment": row.try_get::<String, _>("column_comment").unwrap_or_default(),
            })
        })
        .collect();

    let index_info: Vec<Value> = indexes
        .into_iter()
        .map(|row| {
            json!({
                "name": row.try_get::<String, _>("Key_name").unwrap_or_default(),
                "column": row.try_get::<String, _>("Column_name").unwrap_or_default(),
                "unique": row.try_get::<i32, _>("Non_unique").unwrap_or(1) == 0,
                "type": row.try_get::<String, _>("Index_type").unwrap_or_default(),
            })
        })
        .collect();

    Ok(json!({
        "table_name": table_name,
        "columns": column_info,
        "indexes": index_info
    }))
}

pub async fn execute_query(
    query: String,
    database: Option<String>,
    pool: &Pool<MySql>,
    allow_dangerous_queries: bool,
    max_rows: usize,
) -> Result<QueryResult, DbError> {
    if !allow_dangerous_queries {
        validate_read_only(&query)?;
    }

    debug!("Executing query: {query}");

    let mut rows = if let Some(db) = database {
        valid_identifier(&db)?;
        debug!("Setting database context to: {db}");

        let mut conn = pool.acquire().await.map_err(DbError::ConnectionError)?;
        let use_query = format!("USE `{db}`");
        sqlx::query(&use_query).execute(&mut *conn).await?;
        sqlx::query(&query).fetch_all(&mut *conn).await?
    } else {
        sqlx::query(&query).fetch_all(pool).await?
    };

    let truncated = rows.len() > max_rows;
    if truncated {
        rows.truncate(max_rows);
    }

    let results: Vec<Value> = rows.iter().map(row_to_json).collect();
    let row_count = results.len();
    info!("Query returned {row_count} rows (truncated: {truncated})");

    Ok(QueryResult {
        rows: results,
        row_count,
        truncated,
    })
}

fn row_to_json(row: &MySqlRow) -> Value {
    let mut row_data = serde_json::Map::new();
    for (i, column) in row.columns().iter().enumerate() {
        let column_name = column.name();
        let type_name = column.type_info().name();

        let value_json = match type_name {
            "BOOLEAN" | "TINYINT" => {
                // tinyint(1) decodes as bool, wider tinyints as integers
                if let Ok(v) = row.try_get::<Option<bool>, _>(i) {
                    json!(v)
                } else {
                    json!(row.try_get::<Option<i64>, _>(i).unwrap_or(None))
                }
            }
            "SMALLINT" | "MEDIUMINT" | "INT" | "INTEGER" | "BIGINT" => {
                json!(row.try_get::<Option<i64>, _>(i).unwrap_or(None))
            }
            "TINYINT UNSIGNED" | "SMALLINT UNSIGNED" | "MEDIUMINT UNSIGNED" | "INT UNSIGNED"
            | "BIGINT UNSIGNED" => {
                json!(row.try_get::<Option<u64>, _>(i).unwrap_or(None))
            }
            "FLOAT" => {
                json!(row.try_get::<Option<f32>, _>(i).unwrap_or(None))
            }
            "DOUBLE" | "REAL" => {
                json!(row.try_get::<Option<f64>, _>(i).unwrap_or(None))
            }
            "DECIMAL" | "NUMERIC" => {
                // Serialized as string to preserve precision
                match row.try_get::<Option<sqlx::types::BigDecimal>, _>(i) {
                    Ok(v) => json!(v.map(|d| d.to_string())),
                    Err(_) => Value::Null,
                }
            }
            "DATE" => {
                json!(row
                    .try_get::<Option<chrono::NaiveDate>, _>(i)
                    .map(|v| v.map(|d| d.to_string()))
                    .unwrap_or(None))
            }
            "TIME" => {
                json!(row
                    .try_get::<Option<chrono::NaiveTime>, _>(i)
                    .map(|v| v.map(|t| t.to_string()))
                    .unwrap_or(None))
            }
            "DATETIME" => {
                json!(row
                    .try_get::<Option<chrono::NaiveDateTime>, _>(i)
                    .map(|v| v.map(|dt| dt.to_string()))
                    .unwrap_or(None))
            }
            "TIMESTAMP" => {
                json!(row
                    .try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(i)
                    .map(|v| v.map(|ts| ts.to_rfc3339()))
                    .unwrap_or(None))
            }
            _ => {
                // VARCHAR, TEXT, JSON, ENUM and friends all decode as strings
                json!(row.try_get::<Option<String>, _>(i).unwrap_or(None))
            }
        };

        row_data.insert(column_name.to_string(), value_json);
    }
    Value::Object(row_data)
}

fn require_object<'a>(
    value: &'a Value,
    what: &str,
) -> Result<&'a serde_json::Map<String, Value>, DbError> {
    let map = value
        .as_object()
        .ok_or_else(|| DbError::InvalidInput(format!("{what} must be an object")))?;
    if map.is_empty() {
        return Err(DbError::InvalidInput(format!("{what} object is empty")));
    }
    for key in map.keys() {
        valid_identifier(key)?;
    }
    Ok(map)
}

fn bind_value<'q>(
    query: sqlx::query::Query<'q, MySql, MySqlArguments>,
    value: &'q Value,
) -> Result<sqlx::query::Query<'q, MySql, MySqlArguments>, DbError> {
    Ok(match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                query.bind(i)
            } else if let Some(u) = n.as_u64() {
                query.bind(u)
            } else if let Some(f) = n.as_f64() {
                query.bind(f)
            } else {
                return Err(DbError::InvalidInput(format!("Unsupported number: {n}")));
            }
        }
        Value::String(s) => query.bind(s.as_str()),
        other => {
            return Err(DbError::InvalidInput(format!(
                "Cannot bind nested value {other} as a parameter"
            )));
        }
    })
}

fn insert_statement(table_name: &str, columns: &[&String]) -> String {
    let column_list: Vec<String> = columns.iter().map(|c| format!("`{c}`")).collect();
    let placeholders: Vec<&str> = columns.iter().map(|_| "?").collect();
    format!(
        "INSERT INTO `{}` ({}) VALUES ({})",
        table_name,
        column_list.join(", "),
        placeholders.join(", ")
    )
}

fn update_statement(table_name: &str, set_columns: &[&String], where_columns: &[&String]) -> String {
    let set_clause: Vec<String> = set_columns.iter().map(|c| format!("`{c}` = ?")).collect();
    let where_clause: Vec<String> = where_columns.iter().map(|c| format!("`{c}` = ?")).collect();
    format!(
        "UPDATE `{}` SET {} WHERE {}",
        table_name,
        set_clause.join(", "),
        where_clause.join(" AND ")
    )
}

fn delete_statement(table_name: &str, where_columns: &[&String]) -> String {
    let where_clause: Vec<String> = where_columns.iter().map(|c| format!("`{c}` = ?")).collect();
    format!(
        "DELETE FROM `{}` WHERE {}",
        table_name,
        where_clause.join(" AND ")
    )
}

pub async fn insert_data(
    table_name: String,
    data: Value,
    pool: &Pool<MySql>,
) -> Result<InsertResult, DbError> {
    valid_identifier(&table_name)?;
    let data_map = require_object(&data, "Data")?;

    let columns: Vec<&String> = data_map.keys().collect();
    let query = insert_statement(&table_name, &columns);

    let mut query_builder = sqlx::query(&query);
    for column in &columns {
        query_builder = bind_value(query_builder, &data_map[*column])?;
    }

    debug!("Executing insert query: {query}");
    let result = query_builder.execute(pool).await?;

    Ok(InsertResult {
        last_insert_id: result.last_insert_id(),
    })
}

pub async fn update_data(
    table_name: String,
    data: Value,
    conditions: Value,
    pool: &Pool<MySql>,
) -> Result<MutationResult, DbError> {
    valid_identifier(&table_name)?;
    let data_map = require_object(&data, "Data")?;
    let conditions_map = require_object(&conditions, "Conditions")?;

    let set_columns: Vec<&String> = data_map.keys().collect();
    let where_columns: Vec<&String> = conditions_map.keys().collect();
    let query = update_statement(&table_name, &set_columns, &where_columns);

    let mut query_builder = sqlx::query(&query);
    for column in &set_columns {
        query_builder = bind_value(query_builder, &data_map[*column])?;
    }
    for column in &where_columns {
        query_builder = bind_value(query_builder, &conditions_map[*column])?;
    }

    debug!("Executing update query: {query}");
    let result = query_builder.execute(pool).await?;

    Ok(MutationResult {
        affected_rows: result.rows_affected(),
    })
}

pub async fn delete_data(
    table_name: String,
    conditions: Value,
    pool: &Pool<MySql>,
) -> Result<MutationResult, DbError> {
    valid_identifier(&table_name)?;
    let conditions_map = require_object(&conditions, "Conditions")?;

    let where_columns: Vec<&String> = conditions_map.keys().collect();
    let query = delete_statement(&table_name, &where_columns);

    let mut query_builder = sqlx::query(&query);
    for column in &where_columns {
        query_builder = bind_value(query_builder, &conditions_map[*column])?;
    }

    debug!("Executing delete query: {query}");
    let result = query_builder.execute(pool).await?;

    Ok(MutationResult {
        affected_rows: result.rows_affected(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_is_valid_identifier() {
        assert!(is_valid_identifier("users"));
        assert!(is_valid_identifier("my_table_123"));
        assert!(is_valid_identifier("_hidden"));
        assert!(is_valid_identifier("CamelCase"));
        assert!(is_valid_identifier("123"));

        assert!(!is_valid_identifier(""));
        assert!(!is_valid_identifier("users; DROP TABLE users"));
        assert!(!is_valid_identifier("users--"));
        assert!(!is_valid_identifier("table with spaces"));
        assert!(!is_valid_identifier("table-with-dashes"));
    }

    #[test]
    fn read_only_accepts_plain_selects() {
        assert!(validate_read_only("SELECT * FROM users").is_ok());
        assert!(validate_read_only("  select id from orders  ").is_ok());
        assert!(validate_read_only("SELECT COUNT(*) FROM t WHERE x = 1").is_ok());
    }

    #[test]
    fn read_only_matches_keywords_on_word_boundaries() {
        // Column names containing a forbidden keyword as a substring are fine.
        assert!(validate_read_only("SELECT created_at, updated_at FROM posts").is_ok());
        assert!(validate_read_only("SELECT insert_count FROM stats").is_ok());
    }

    #[test]
    fn read_only_rejects_non_select_statements() {
        assert!(matches!(
            validate_read_only("INSERT INTO users VALUES (1)"),
            Err(DbError::ReadOnlyViolation(_))
        ));
        assert!(matches!(
            validate_read_only("SHOW TABLES"),
            Err(DbError::ReadOnlyViolation(_))
        ));
        assert!(matches!(
            validate_read_only(""),
            Err(DbError::ReadOnlyViolation(_))
        ));
    }

    #[test]
    fn read_only_rejects_embedded_keywords() {
        assert!(matches!(
            validate_read_only("SELECT 1; DROP TABLE users"),
            Err(DbError::ReadOnlyViolation(_))
        ));
        assert!(matches!(
            validate_read_only("SELECT * FROM t WHERE x = 1 UNION SELECT 1 INTO OUTFILE '/tmp/x'; GRANT ALL ON *.* TO 'x'"),
            Err(DbError::ReadOnlyViolation(_))
        ));
    }

    #[test]
    fn builds_insert_statement() {
        let a = "age".to_string();
        let n = "name".to_string();
        assert_eq!(
            insert_statement("users", &[&n, &a]),
            "INSERT INTO `users` (`name`, `age`) VALUES (?, ?)"
        );
    }

    #[test]
    fn builds_update_statement() {
        let name = "name".to_string();
        let id = "id".to_string();
        assert_eq!(
            update_statement("users", &[&name], &[&id]),
            "UPDATE `users` SET `name` = ? WHERE `id` = ?"
        );
    }

    #[test]
    fn builds_delete_statement_with_multiple_conditions() {
        let id = "id".to_string();
        let tenant = "tenant".to_string();
        assert_eq!(
            delete_statement("sessions", &[&id, &tenant]),
            "DELETE FROM `sessions` WHERE `id` = ? AND `tenant` = ?"
        );
    }

    #[test]
    fn require_object_validates_shape_and_keys() {
        assert!(require_object(&json!({"a": 1}), "Data").is_ok());
        assert!(matches!(
            require_object(&json!([1, 2]), "Data"),
            Err(DbError::InvalidInput(_))
        ));
        assert!(matches!(
            require_object(&json!({}), "Conditions"),
            Err(DbError::InvalidInput(_))
        ));
        assert!(matches!(
            require_object(&json!({"bad key": 1}), "Data"),
            Err(DbError::InvalidIdentifier(_))
        ));
    }

    #[test]
    fn bind_value_rejects_nested_structures() {
        let query = sqlx::query("SELECT ?");
        let nested = json!({"a": [1, 2]});
        assert!(matches!(
            bind_value(query, &nested),
            Err(DbError::InvalidInput(_))
        ));
    }
}
