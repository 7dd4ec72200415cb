use anyhow::{Context, Result, anyhow, bail};
use aws_lambda_events::sqs::{BatchItemFailure, SqsBatchResponse, SqsEvent, SqsMessage};
use aws_sdk_dynamodb as dynamodb;
use aws_sdk_dynamodb::types::AttributeValue;
use lambda_runtime::tracing;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::str::FromStr;

pub type Attributes = HashMap<String, AttributeValue>;

#[derive(Serialize)]
struct Item {
    id: String,
}

impl Item {
    fn new() -> Item {
        Item {
            id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

/// How a queue record is turned into an item.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ItemMode {
    /// Write `{"id": <uuid v4>}` for every record.
    #[default]
    Uuid,
    /// Write the record body, a JSON object, attribute for attribute.
    Body,
    /// Only log the record.
    Log,
}

impl FromStr for ItemMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<ItemMode> {
        match s.trim().to_ascii_lowercase().as_str() {
            "uuid" => Ok(ItemMode::Uuid),
            "body" => Ok(ItemMode::Body),
            "log" => Ok(ItemMode::Log),
            other => bail!("unknown ITEM_MODE {other:?}, expected uuid, body or log"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub table: String,
    pub mode: ItemMode,
    pub report_failures: bool,
}

impl Config {
    pub fn from_env() -> Result<Config> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Config> {
        let table = lookup("DYNAMO_TABLE").ok_or_else(|| anyhow!("DYNAMO_TABLE is not set"))?;

        let mode = lookup("ITEM_MODE")
            .map(|value| value.parse::<ItemMode>())
            .transpose()?
            .unwrap_or_default();

        let report_failures = lookup("REPORT_BATCH_FAILURES")
            .map(|value| parse_flag(&value))
            .transpose()
            .context("invalid REPORT_BATCH_FAILURES")?
            .unwrap_or(true);

        Ok(Config {
            table,
            mode,
            report_failures,
        })
    }
}

fn parse_flag(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        other => bail!("expected a boolean, got {other:?}"),
    }
}

/// Single-item writes against a key-value table.
pub trait ItemStore: Sync {
    fn put(&self, table: &str, item: Attributes) -> impl Future<Output = Result<()>> + Send;
}

impl ItemStore for dynamodb::Client {
    async fn put(&self, table: &str, item: Attributes) -> Result<()> {
        self.put_item()
            .table_name(table)
            .set_item(Some(item))
            .send()
            .await
            .map_err(|e| e.into_service_error())?;

        Ok(())
    }
}

pub struct Process<'a, S> {
    store: &'a S,
    config: &'a Config,
}

impl<'a, S: ItemStore> Process<'a, S> {
    pub fn new(store: &'a S, config: &'a Config) -> Process<'a, S> {
        Process { store, config }
    }

    /// Processes every message in delivery order and returns the ones that failed.
    pub async fn run(&self, messages: &[SqsMessage]) -> Vec<BatchItemFailure> {
        let mut failures = Vec::new();

        for message in messages {
            let message_id = message.message_id.as_deref();
            tracing::info!(message_id = message_id.unwrap_or_default(), "Processing record");

            let Err(err) = self.process(message).await else {
                continue;
            };

            match message_id {
                Some(id) => {
                    tracing::error!(message_id = id, "{:#}", err);
                    failures.push(BatchItemFailure {
                        item_identifier: id.to_string(),
                    });
                }
                None => tracing::error!("Record without message ID cannot be retried: {:#}", err),
            }
        }

        failures
    }

    async fn process(&self, message: &SqsMessage) -> Result<()> {
        let Some(item) = self.item(message).context("Got error marshalling map")? else {
            return Ok(());
        };

        self.store
            .put(&self.config.table, item)
            .await
            .context("Got error calling PutItem")
    }

    fn item(&self, message: &SqsMessage) -> Result<Option<Attributes>> {
        match self.config.mode {
            ItemMode::Uuid => Ok(Some(serde_dynamo::aws_sdk_dynamodb_1::to_item(Item::new())?)),
            ItemMode::Body => {
                let body = message
                    .body
                    .as_deref()
                    .ok_or_else(|| anyhow!("record has no body"))?;
                let value: serde_json::Value = serde_json::from_str(body)?;

                Ok(Some(serde_dynamo::aws_sdk_dynamodb_1::to_item(value)?))
            }
            ItemMode::Log => Ok(None),
        }
    }
}

/// Handles one SQS invocation. Never fails: records whose item could not be
/// written are returned as batch item failures unless reporting is disabled.
pub async fn handle<S: ItemStore>(store: &S, config: &Config, event: SqsEvent) -> SqsBatchResponse {
    let messages = &event.records;
    tracing::info!("Number of messages received: {}", messages.len());

    let failures = Process::new(store, config).run(messages).await;
    tracing::info!("Number of failures: {}", failures.len());

    let batch_item_failures = if config.report_failures {
        failures
    } else {
        if !failures.is_empty() {
            tracing::warn!("Dropping {} failed records, reporting is disabled", failures.len());
        }
        Vec::new()
    };

    SqsBatchResponse {
        batch_item_failures,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingStore {
        puts: Mutex<Vec<(String, Attributes)>>,
        fail: bool,
    }

    impl RecordingStore {
        fn failing() -> RecordingStore {
            RecordingStore {
                fail: true,
                ..Default::default()
            }
        }

        fn puts(&self) -> Vec<(String, Attributes)> {
            self.puts.lock().unwrap().clone()
        }
    }

    impl ItemStore for RecordingStore {
        async fn put(&self, table: &str, item: Attributes) -> Result<()> {
            self.puts.lock().unwrap().push((table.to_string(), item));
            if self.fail {
                bail!("simulated write failure");
            }
            Ok(())
        }
    }

    fn config(mode: ItemMode) -> Config {
        Config {
            table: "jobs".to_string(),
            mode,
            report_failures: true,
        }
    }

    fn event(records: serde_json::Value) -> SqsEvent {
        serde_json::from_value(json!({ "Records": records })).unwrap()
    }

    fn numbered(count: usize) -> SqsEvent {
        let records = (0..count)
            .map(|i| json!({ "messageId": format!("msg-{i}"), "body": "hello" }))
            .collect::<Vec<_>>();
        event(json!(records))
    }

    #[tokio::test]
    async fn empty_batch_writes_nothing() {
        let store = RecordingStore::default();

        let response = handle(&store, &config(ItemMode::Uuid), event(json!([]))).await;

        assert!(response.batch_item_failures.is_empty());
        assert!(store.puts().is_empty());
    }

    #[tokio::test]
    async fn single_record_is_put_into_configured_table() {
        let store = RecordingStore::default();
        let records = event(json!([{ "messageId": "abc-123", "body": "hello" }]));

        let response = handle(&store, &config(ItemMode::Uuid), records).await;

        assert!(response.batch_item_failures.is_empty());
        let puts = store.puts();
        assert_eq!(puts.len(), 1);
        assert_eq!(puts[0].0, "jobs");
        assert!(matches!(puts[0].1.get("id"), Some(AttributeValue::S(_))));
    }

    #[tokio::test]
    async fn every_record_gets_a_distinct_id() {
        let store = RecordingStore::default();

        handle(&store, &config(ItemMode::Uuid), numbered(50)).await;

        let ids = store
            .puts()
            .into_iter()
            .map(|(_, item)| match item.get("id") {
                Some(AttributeValue::S(id)) => id.clone(),
                other => panic!("unexpected id attribute: {other:?}"),
            })
            .collect::<HashSet<_>>();
        assert_eq!(ids.len(), 50);
    }

    #[tokio::test]
    async fn body_mode_keeps_attribute_names() {
        let store = RecordingStore::default();
        let records = event(json!([{
            "messageId": "abc-123",
            "body": r#"{"id":"red-1","colour":"red","price":12,"in_stock":true}"#
        }]));

        handle(&store, &config(ItemMode::Body), records).await;

        let puts = store.puts();
        assert_eq!(puts.len(), 1);
        let item = &puts[0].1;
        let keys = item.keys().map(String::as_str).collect::<HashSet<_>>();
        assert_eq!(keys, HashSet::from(["id", "colour", "price", "in_stock"]));
        assert_eq!(item.get("colour"), Some(&AttributeValue::S("red".to_string())));
        assert_eq!(item.get("price"), Some(&AttributeValue::N("12".to_string())));
        assert_eq!(item.get("in_stock"), Some(&AttributeValue::Bool(true)));
    }

    #[tokio::test]
    async fn body_mode_reports_unparseable_body_and_continues() {
        let store = RecordingStore::default();
        let records = event(json!([
            { "messageId": "bad", "body": "hello" },
            { "messageId": "good", "body": r#"{"id":"a"}"# }
        ]));

        let response = handle(&store, &config(ItemMode::Body), records).await;

        assert_eq!(store.puts().len(), 1);
        assert_eq!(response.batch_item_failures.len(), 1);
        assert_eq!(response.batch_item_failures[0].item_identifier, "bad");
    }

    #[tokio::test]
    async fn body_mode_reports_bodies_that_are_not_objects() {
        let store = RecordingStore::default();
        let records = event(json!([
            { "messageId": "list", "body": "[1,2]" },
            { "messageId": "number", "body": "5" }
        ]));

        let response = handle(&store, &config(ItemMode::Body), records).await;

        assert!(store.puts().is_empty());
        let ids = response
            .batch_item_failures
            .iter()
            .map(|failure| failure.item_identifier.as_str())
            .collect::<Vec<_>>();
        assert_eq!(ids, ["list", "number"]);
    }

    #[tokio::test]
    async fn log_mode_writes_nothing() {
        let store = RecordingStore::default();

        let response = handle(&store, &config(ItemMode::Log), numbered(3)).await;

        assert!(response.batch_item_failures.is_empty());
        assert!(store.puts().is_empty());
    }

    #[tokio::test]
    async fn failed_writes_are_reported_per_record() {
        let store = RecordingStore::failing();

        let response = handle(&store, &config(ItemMode::Uuid), numbered(3)).await;

        assert_eq!(store.puts().len(), 3);
        let ids = response
            .batch_item_failures
            .iter()
            .map(|failure| failure.item_identifier.as_str())
            .collect::<Vec<_>>();
        assert_eq!(ids, ["msg-0", "msg-1", "msg-2"]);
    }

    #[tokio::test]
    async fn failed_writes_are_dropped_when_reporting_is_disabled() {
        let store = RecordingStore::failing();
        let config = Config {
            report_failures: false,
            ..config(ItemMode::Uuid)
        };
        let records = event(json!([{ "messageId": "abc-123", "body": "hello" }]));

        let response = handle(&store, &config, records).await;

        assert_eq!(store.puts().len(), 1);
        assert!(response.batch_item_failures.is_empty());
    }

    #[tokio::test]
    async fn record_without_message_id_is_not_reported() {
        let store = RecordingStore::failing();
        let records = event(json!([{ "body": "hello" }]));

        let response = handle(&store, &config(ItemMode::Uuid), records).await;

        assert_eq!(store.puts().len(), 1);
        assert!(response.batch_item_failures.is_empty());
    }

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn config_defaults() {
        let config = Config::from_lookup(lookup(&[("DYNAMO_TABLE", "jobs")])).unwrap();

        assert_eq!(config, Config {
            table: "jobs".to_string(),
            mode: ItemMode::Uuid,
            report_failures: true,
        });
    }

    #[test]
    fn config_reads_mode_and_flag() {
        let config = Config::from_lookup(lookup(&[
            ("DYNAMO_TABLE", "jobs"),
            ("ITEM_MODE", "Body"),
            ("REPORT_BATCH_FAILURES", "false"),
        ]))
        .unwrap();

        assert_eq!(config.mode, ItemMode::Body);
        assert!(!config.report_failures);
    }

    #[test]
    fn config_rejects_missing_table_and_bad_values() {
        assert!(Config::from_lookup(lookup(&[])).is_err());
        assert!(Config::from_lookup(lookup(&[("DYNAMO_TABLE", "jobs"), ("ITEM_MODE", "csv")])).is_err());
        assert!(
            Config::from_lookup(lookup(&[("DYNAMO_TABLE", "jobs"), ("REPORT_BATCH_FAILURES", "maybe")]))
                .is_err()
        );
    }
}
