use super::super::super::{ExchangeKind, HeaderValue, Headers, Properties};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::BasicProperties;

const DELIVERY_MODE_PERSISTENT: u8 = 2;

pub(super) fn exchange_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
    }
}

fn header_to_amqp(value: &HeaderValue) -> AMQPValue {
    match value {
        HeaderValue::Bool(value) => AMQPValue::Boolean(*value),
        HeaderValue::Int(value) => AMQPValue::LongLongInt(*value),
        HeaderValue::Float(value) => AMQPValue::Double(*value),
        HeaderValue::String(value) => AMQPValue::LongString(LongString::from(value.clone())),
    }
}

/// Values without a scalar counterpart (tables, arrays, timestamps, ...) are skipped
fn header_from_amqp(value: &AMQPValue) -> Option<HeaderValue> {
    let value = match value {
        AMQPValue::Boolean(value) => HeaderValue::Bool(*value),
        AMQPValue::ShortShortInt(value) => HeaderValue::Int(i64::from(*value)),
        AMQPValue::ShortShortUInt(value) => HeaderValue::Int(i64::from(*value)),
        AMQPValue::ShortInt(value) => HeaderValue::Int(i64::from(*value)),
        AMQPValue::ShortUInt(value) => HeaderValue::Int(i64::from(*value)),
        AMQPValue::LongInt(value) => HeaderValue::Int(i64::from(*value)),
        AMQPValue::LongUInt(value) => HeaderValue::Int(i64::from(*value)),
        AMQPValue::LongLongInt(value) => HeaderValue::Int(*value),
        AMQPValue::Float(value) => HeaderValue::Float(f64::from(*value)),
        AMQPValue::Double(value) => HeaderValue::Float(*value),
        AMQPValue::ShortString(value) => HeaderValue::String(value.as_str().to_owned()),
        AMQPValue::LongString(value) => {
            HeaderValue::String(String::from_utf8_lossy(value.as_bytes()).into_owned())
        }
        _ => return None,
    };

    Some(value)
}

fn headers_to_amqp(headers: &Headers) -> FieldTable {
    let mut table = FieldTable::default();

    for (name, value) in headers {
        table.insert(ShortString::from(name.clone()), header_to_amqp(value));
    }

    table
}

fn headers_from_amqp(table: &FieldTable) -> Headers {
    table
        .inner()
        .iter()
        .filter_map(|(name, value)| {
            header_from_amqp(value).map(|value| (name.as_str().to_owned(), value))
        })
        .collect()
}

fn short(value: &Option<String>) -> Option<ShortString> {
    value.as_ref().map(|value| ShortString::from(value.clone()))
}

fn owned(value: &Option<ShortString>) -> Option<String> {
    value.as_ref().map(|value| value.as_str().to_owned())
}

/// Translates message metadata into AMQP properties
pub(super) fn to_basic_properties(properties: &Properties, persistent: bool) -> BasicProperties {
    let mut basic = BasicProperties::default();

    if let Some(content_type) = short(&properties.content_type) {
        basic = basic.with_content_type(content_type);
    }

    if let Some(content_encoding) = short(&properties.content_encoding) {
        basic = basic.with_content_encoding(content_encoding);
    }

    if let Some(message_id) = short(&properties.message_id) {
        basic = basic.with_message_id(message_id);
    }

    if let Some(reply_to) = short(&properties.reply_to) {
        basic = basic.with_reply_to(reply_to);
    }

    if let Some(correlation_id) = short(&properties.correlation_id) {
        basic = basic.with_correlation_id(correlation_id);
    }

    if !properties.headers.is_empty() {
        basic = basic.with_headers(headers_to_amqp(&properties.headers));
    }

    if persistent {
        basic = basic.with_delivery_mode(DELIVERY_MODE_PERSISTENT);
    }

    basic
}

/// Extracts message metadata from AMQP properties
pub(super) fn from_basic_properties(basic: &BasicProperties) -> Properties {
    Properties {
        content_type: owned(basic.content_type()),
        content_encoding: owned(basic.content_encoding()),
        headers: basic
            .headers()
            .as_ref()
            .map(headers_from_amqp)
            .unwrap_or_default(),
        message_id: owned(basic.message_id()),
        reply_to: owned(basic.reply_to()),
        correlation_id: owned(basic.correlation_id()),
    }
}
