//! Write one field of a local record.

use anyhow::{Context, Result};
use classsync_types::{Collection, RecordKey};
use serde_json::Value;

use crate::config::DataDir;

/// Run the edit command.
pub async fn run(
    data: &DataDir,
    collection: Collection,
    id: &str,
    field: &str,
    value: &str,
) -> Result<()> {
    let engine = data.open_engine().await?;
    let key = RecordKey::new(collection, id);
    let dot = engine
        .record_local_change(key.clone(), field, parse_value(value))
        .await
        .context("Failed to write record")?;

    println!("Updated {key}.{field} (change #{})", dot.counter);
    Ok(())
}

/// Parse `input` as JSON, falling back to a plain string.
pub fn parse_value(input: &str) -> Value {
    serde_json::from_str(input).unwrap_or_else(|_| Value::String(input.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use classsync_client::{DataStore, JsonFileStore};
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn parse_value_prefers_json() {
        assert_eq!(parse_value("4"), json!(4));
        assert_eq!(parse_value("{\"grade\":\"B\"}"), json!({"grade": "B"}));
        assert_eq!(parse_value("Math A"), json!("Math A"));
    }

    #[tokio::test]
    async fn edit_writes_record_and_advances_clock() {
        let dir = tempdir().unwrap();
        let data = DataDir::new(dir.path());
        crate::commands::init::run(&data, "Laptop").await.unwrap();
        let me = data.identity().await.unwrap().device_id();

        run(&data, Collection::Classes, "c1", "name", "Math A").await.unwrap();
        run(&data, Collection::Classes, "c1", "room", "12").await.unwrap();

        let records = JsonFileStore::new(data.records_path()).snapshot().await.unwrap();
        let key = RecordKey::new(Collection::Classes, "c1");
        assert_eq!(records.get_field(&key, "name").unwrap().value, json!("Math A"));
        assert_eq!(records.get_field(&key, "room").unwrap().value, json!(12));

        let state = data.load_state().await.unwrap();
        assert_eq!(state.vector_clock.get(&me), 2);
    }
}
