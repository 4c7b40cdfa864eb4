//! Arrow schemas for the analytics cache's parquet tables (§4.8).
//!
//! Timestamps are stored as millisecond epoch integers rather than
//! Arrow's native timestamp type, so every column downcasts to a plain
//! `Int64Array`/`StringArray`/`BooleanArray` on read without juggling
//! timezone metadata.

use std::sync::Arc;

use arrow::datatypes::{DataType, Field, Schema};

pub fn messages_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("id", DataType::Int64, false),
        Field::new("source_id", DataType::Int64, false),
        Field::new("conversation_id", DataType::Int64, false),
        Field::new("subject", DataType::Utf8, false),
        Field::new("snippet", DataType::Utf8, false),
        Field::new("sent_at_millis", DataType::Int64, false),
        Field::new("received_at_millis", DataType::Int64, true),
        Field::new("size_estimate", DataType::Int64, false),
        Field::new("has_attachments", DataType::Boolean, false),
        Field::new("deleted_from_source_at_millis", DataType::Int64, true),
        Field::new("year", DataType::Int32, false),
    ]))
}

pub fn message_recipients_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("message_id", DataType::Int64, false),
        Field::new("participant_id", DataType::Int64, false),
        Field::new("recipient_type", DataType::Utf8, false),
        Field::new("display_name_snapshot", DataType::Utf8, true),
    ]))
}

pub fn message_labels_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("message_id", DataType::Int64, false),
        Field::new("label_id", DataType::Int64, false),
    ]))
}

pub fn attachments_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("id", DataType::Int64, false),
        Field::new("message_id", DataType::Int64, false),
        Field::new("filename", DataType::Utf8, false),
        Field::new("mime_type", DataType::Utf8, false),
        Field::new("size", DataType::Int64, false),
        Field::new("content_hash", DataType::Utf8, true),
        Field::new("storage_path", DataType::Utf8, true),
    ]))
}

pub fn participants_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("id", DataType::Int64, false),
        Field::new("email_address", DataType::Utf8, false),
        Field::new("domain", DataType::Utf8, false),
        Field::new("display_name", DataType::Utf8, true),
    ]))
}

pub fn labels_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("id", DataType::Int64, false),
        Field::new("source_id", DataType::Int64, false),
        Field::new("name", DataType::Utf8, false),
        Field::new("provider_label_id", DataType::Utf8, true),
    ]))
}

pub fn sources_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("id", DataType::Int64, false),
        Field::new("source_type", DataType::Utf8, false),
        Field::new("identifier", DataType::Utf8, false),
        Field::new("display_name", DataType::Utf8, true),
        Field::new("last_sync_at_millis", DataType::Int64, true),
    ]))
}

pub fn conversations_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("id", DataType::Int64, false),
        Field::new("source_id", DataType::Int64, false),
        Field::new("source_conversation_id", DataType::Utf8, false),
        Field::new("title", DataType::Utf8, true),
    ]))
}
