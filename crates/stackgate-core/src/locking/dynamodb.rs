//! DynamoDB implementation of [`ConditionalTableClient`].
//!
//! The table has a string hash key `PK` and a string range key `SK` and is
//! billed per request. Acquire is a single `UpdateItem` carrying the
//! condition expression, so two hosts racing on the same row cannot both
//! write it.

use std::collections::HashMap;

use async_trait::async_trait;
use aws_sdk_dynamodb::error::DisplayErrorContext;
use aws_sdk_dynamodb::types::{
    AttributeDefinition, AttributeValue, BillingMode, KeySchemaElement, KeyType,
    ScalarAttributeType, TableStatus as DynamoTableStatus,
};
use aws_sdk_dynamodb::Client;
use chrono::{DateTime, SecondsFormat, Utc};
use tracing::debug;

use super::conditional_table::{
    ConditionalTableClient, LockItem, PutOutcome, TableKey, TableStatus,
};
use crate::error::{GateError, GateResult};

const TRANSACTION_ID: &str = "transaction_id";
const TIMEOUT: &str = "timeout";

#[derive(Debug, Clone)]
pub struct DynamoDbTable {
    client: Client,
}

impl DynamoDbTable {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Client from the standard AWS environment (region, credentials chain).
    pub async fn from_env() -> Self {
        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Self::new(Client::new(&config))
    }
}

fn dynamo_error(op: &str, table: &str, err: impl std::error::Error) -> GateError {
    GateError::LockBackend(format!(
        "dynamodb {op} on {table}: {}",
        DisplayErrorContext(err)
    ))
}

fn key_attributes(key: &TableKey) -> HashMap<String, AttributeValue> {
    HashMap::from([
        ("PK".to_string(), AttributeValue::S(key.pk.clone())),
        ("SK".to_string(), AttributeValue::S(key.sk.clone())),
    ])
}

/// Rows written by older clients store the id as a string.
fn parse_item(attributes: &HashMap<String, AttributeValue>) -> GateResult<LockItem> {
    let raw = match attributes.get(TRANSACTION_ID) {
        Some(AttributeValue::N(n)) | Some(AttributeValue::S(n)) => n,
        _ => {
            return Err(GateError::LockBackend(format!(
                "lock row has no {TRANSACTION_ID}"
            )))
        }
    };
    let transaction_id = raw.parse::<u64>().map_err(|_| {
        GateError::LockBackend(format!("lock row has unparseable {TRANSACTION_ID} {raw:?}"))
    })?;
    let timeout = match attributes.get(TIMEOUT) {
        Some(AttributeValue::S(s)) => s.clone(),
        _ => String::new(),
    };
    Ok(LockItem {
        transaction_id,
        timeout,
    })
}

fn table_status(status: Option<&DynamoTableStatus>) -> TableStatus {
    match status {
        Some(DynamoTableStatus::Active) | Some(DynamoTableStatus::Updating) => TableStatus::Active,
        _ => TableStatus::Creating,
    }
}

fn key_definitions() -> GateResult<(Vec<AttributeDefinition>, Vec<KeySchemaElement>)> {
    let invalid = |e: aws_sdk_dynamodb::error::BuildError| {
        GateError::LockBackend(format!("invalid table definition: {e}"))
    };
    let mut attributes = Vec::new();
    let mut schema = Vec::new();
    for (name, key_type) in [("PK", KeyType::Hash), ("SK", KeyType::Range)] {
        attributes.push(
            AttributeDefinition::builder()
                .attribute_name(name)
                .attribute_type(ScalarAttributeType::S)
                .build()
                .map_err(invalid)?,
        );
        schema.push(
            KeySchemaElement::builder()
                .attribute_name(name)
                .key_type(key_type)
                .build()
                .map_err(invalid)?,
        );
    }
    Ok((attributes, schema))
}

#[async_trait]
impl ConditionalTableClient for DynamoDbTable {
    async fn describe_table(&self, table: &str) -> GateResult<Option<TableStatus>> {
        match self.client.describe_table().table_name(table).send().await {
            Ok(output) => Ok(Some(table_status(
                output.table().and_then(|t| t.table_status()),
            ))),
            Err(err) => {
                let err = err.into_service_error();
                if err.is_resource_not_found_exception() {
                    Ok(None)
                } else {
                    Err(dynamo_error("describe_table", table, err))
                }
            }
        }
    }

    async fn create_table(&self, table: &str) -> GateResult<()> {
        let (attributes, schema) = key_definitions()?;
        let result = self
            .client
            .create_table()
            .table_name(table)
            .set_attribute_definitions(Some(attributes))
            .set_key_schema(Some(schema))
            .billing_mode(BillingMode::PayPerRequest)
            .send()
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(err) => {
                let err = err.into_service_error();
                if err.is_resource_in_use_exception() {
                    debug!(table, "lock table already being created");
                    Ok(())
                } else {
                    Err(dynamo_error("create_table", table, err))
                }
            }
        }
    }

    async fn put_if_absent_or_expired(
        &self,
        table: &str,
        key: &TableKey,
        item: LockItem,
        now: DateTime<Utc>,
    ) -> GateResult<PutOutcome> {
        let result = self
            .client
            .update_item()
            .table_name(table)
            .set_key(Some(key_attributes(key)))
            .condition_expression("attribute_not_exists(SK) OR #timeout < :now")
            .update_expression("SET #tid = :tid, #timeout = :timeout")
            .expression_attribute_names("#tid", TRANSACTION_ID)
            .expression_attribute_names("#timeout", TIMEOUT)
            .expression_attribute_values(":tid", AttributeValue::N(item.transaction_id.to_string()))
            .expression_attribute_values(":timeout", AttributeValue::S(item.timeout))
            .expression_attribute_values(
                ":now",
                AttributeValue::S(now.to_rfc3339_opts(SecondsFormat::Secs, true)),
            )
            .send()
            .await;
        match result {
            Ok(_) => Ok(PutOutcome::Written),
            Err(err) => {
                let err = err.into_service_error();
                if err.is_conditional_check_failed_exception() {
                    Ok(PutOutcome::ConditionFailed)
                } else {
                    Err(dynamo_error("update_item", table, err))
                }
            }
        }
    }

    async fn get_item(
        &self,
        table: &str,
        key: &TableKey,
        consistent_read: bool,
    ) -> GateResult<Option<LockItem>> {
        let output = self
            .client
            .get_item()
            .table_name(table)
            .set_key(Some(key_attributes(key)))
            .consistent_read(consistent_read)
            .send()
            .await
            .map_err(|e| dynamo_error("get_item", table, e.into_service_error()))?;
        output.item().map(parse_item).transpose()
    }

    async fn delete_item(&self, table: &str, key: &TableKey) -> GateResult<()> {
        self.client
            .delete_item()
            .table_name(table)
            .set_key(Some(key_attributes(key)))
            .send()
            .await
            .map_err(|e| dynamo_error("delete_item", table, e.into_service_error()))?;
        Ok(())
    }
}
