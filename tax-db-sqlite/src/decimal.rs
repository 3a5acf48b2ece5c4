//! Decimal columns are stored as TEXT so amounts and rates round-trip
//! exactly. Reading also accepts INTEGER and REAL values written by hand or
//! by other tools.

use std::str::FromStr;

use rust_decimal::Decimal;
use sqlx::{Row, TypeInfo, ValueRef};
use tax_core::RepositoryError;

/// Get a decimal value from a row, handling TEXT, INTEGER and REAL SQLite types.
pub fn get_decimal(
    row: &sqlx::sqlite::SqliteRow,
    column: &str,
) -> Result<Decimal, RepositoryError> {
    let value_ref = row
        .try_get_raw(column)
        .map_err(|e| RepositoryError::Database(format!("Column '{}' not found: {}", column, e)))?;

    if value_ref.is_null() {
        return Err(RepositoryError::Database(format!(
            "Column '{}' is NULL",
            column
        )));
    }

    let type_info = value_ref.type_info();
    let type_name = type_info.name();

    match type_name {
        "TEXT" => {
            let val: String = row.try_get(column).map_err(|e| {
                RepositoryError::Database(format!("Failed to get TEXT from '{}': {}", column, e))
            })?;
            Decimal::from_str(val.trim()).map_err(|e| {
                RepositoryError::Database(format!(
                    "Failed to parse '{}' in '{}' as Decimal: {}",
                    val, column, e
                ))
            })
        }
        "INTEGER" => {
            let val: i64 = row.try_get(column).map_err(|e| {
                RepositoryError::Database(format!(
                    "Failed to get INTEGER from '{}': {}",
                    column, e
                ))
            })?;
            Ok(Decimal::from(val))
        }
        "REAL" => {
            let val: f64 = row.try_get(column).map_err(|e| {
                RepositoryError::Database(format!("Failed to get REAL from '{}': {}", column, e))
            })?;
            Decimal::try_from(val).map_err(|e| {
                RepositoryError::Database(format!("Failed to convert {} to Decimal: {}", val, e))
            })
        }
        _ => Err(RepositoryError::Database(format!(
            "Unexpected type '{}' for column '{}'",
            type_name, column
        ))),
    }
}

/// Get an optional decimal value from a row, returning None for NULL values.
pub fn get_optional_decimal(
    row: &sqlx::sqlite::SqliteRow,
    column: &str,
) -> Result<Option<Decimal>, RepositoryError> {
    let value_ref = row
        .try_get_raw(column)
        .map_err(|e| RepositoryError::Database(format!("Column '{}' not found: {}", column, e)))?;

    if value_ref.is_null() {
        return Ok(None);
    }

    get_decimal(row, column).map(Some)
}

/// Convert a Decimal to its canonical TEXT form for storage.
pub fn decimal_to_text(d: Decimal) -> String {
    d.normalize().to_string()
}
