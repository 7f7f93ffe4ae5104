//! MQTT 5.0 property block encode/decode.
//!
//! Properties are a VLI-prefixed sequence of identifier/value pairs, emitted
//! in identifier order. This module reads and writes `types::Properties`,
//! the flat record shared by every v5 packet kind that carries properties.

use crate::error::{Error, Result};
use crate::types::{Properties, QoS};

use super::codec::{
    read_binary_slice, read_string_slice, read_u16, read_u32, read_variable_int, variable_int_len,
    write_binary, write_string, write_u16, write_u32, write_variable_int,
};

mod id {
    pub const PAYLOAD_FORMAT_INDICATOR: u8 = 0x01;
    pub const MESSAGE_EXPIRY_INTERVAL: u8 = 0x02;
    pub const CONTENT_TYPE: u8 = 0x03;
    pub const RESPONSE_TOPIC: u8 = 0x08;
    pub const CORRELATION_DATA: u8 = 0x09;
    pub const SUBSCRIPTION_IDENTIFIER: u8 = 0x0B;
    pub const SESSION_EXPIRY_INTERVAL: u8 = 0x11;
    pub const ASSIGNED_CLIENT_IDENTIFIER: u8 = 0x12;
    pub const SERVER_KEEP_ALIVE: u8 = 0x13;
    pub const AUTHENTICATION_METHOD: u8 = 0x15;
    pub const AUTHENTICATION_DATA: u8 = 0x16;
    pub const REQUEST_PROBLEM_INFORMATION: u8 = 0x17;
    pub const WILL_DELAY_INTERVAL: u8 = 0x18;
    pub const REQUEST_RESPONSE_INFORMATION: u8 = 0x19;
    pub const RESPONSE_INFORMATION: u8 = 0x1A;
    pub const SERVER_REFERENCE: u8 = 0x1C;
    pub const REASON_STRING: u8 = 0x1F;
    pub const RECEIVE_MAXIMUM: u8 = 0x21;
    pub const TOPIC_ALIAS_MAXIMUM: u8 = 0x22;
    pub const TOPIC_ALIAS: u8 = 0x23;
    pub const MAXIMUM_QOS: u8 = 0x24;
    pub const RETAIN_AVAILABLE: u8 = 0x25;
    pub const USER_PROPERTY: u8 = 0x26;
    pub const MAXIMUM_PACKET_SIZE: u8 = 0x27;
    pub const WILDCARD_SUBSCRIPTION_AVAILABLE: u8 = 0x28;
    pub const SUBSCRIPTION_IDENTIFIER_AVAILABLE: u8 = 0x29;
    pub const SHARED_SUBSCRIPTION_AVAILABLE: u8 = 0x2A;
}

fn bool_len() -> usize {
    2
}
fn u16_len() -> usize {
    3
}
fn u32_len() -> usize {
    5
}
fn str_len(s: &str) -> usize {
    1 + 2 + s.len()
}
fn bin_len(b: &[u8]) -> usize {
    1 + 2 + b.len()
}

/// Byte length of the property block body (identifiers + values, no length prefix).
pub fn properties_body_len(p: &Properties) -> usize {
    let mut len = 0;
    if p.payload_format_indicator.is_some() {
        len += bool_len();
    }
    if p.message_expiry_interval.is_some() {
        len += u32_len();
    }
    if let Some(ref s) = p.content_type {
        len += str_len(s);
    }
    if let Some(ref s) = p.response_topic {
        len += str_len(s);
    }
    if let Some(ref b) = p.correlation_data {
        len += bin_len(b);
    }
    if let Some(v) = p.subscription_identifier {
        len += 1 + variable_int_len(v);
    }
    if p.session_expiry_interval.is_some() {
        len += u32_len();
    }
    if let Some(ref s) = p.assigned_client_identifier {
        len += str_len(s);
    }
    if p.server_keep_alive.is_some() {
        len += u16_len();
    }
    if let Some(ref s) = p.authentication_method {
        len += str_len(s);
    }
    if let Some(ref b) = p.authentication_data {
        len += bin_len(b);
    }
    if p.request_problem_information.is_some() {
        len += bool_len();
    }
    if p.will_delay_interval.is_some() {
        len += u32_len();
    }
    if p.request_response_information.is_some() {
        len += bool_len();
    }
    if let Some(ref s) = p.response_information {
        len += str_len(s);
    }
    if let Some(ref s) = p.server_reference {
        len += str_len(s);
    }
    if let Some(ref s) = p.reason_string {
        len += str_len(s);
    }
    if p.receive_maximum.is_some() {
        len += u16_len();
    }
    if p.topic_alias_maximum.is_some() {
        len += u16_len();
    }
    if p.topic_alias.is_some() {
        len += u16_len();
    }
    if p.maximum_qos.is_some() {
        len += 2;
    }
    if p.retain_available.is_some() {
        len += bool_len();
    }
    for (k, v) in &p.user_properties {
        len += 1 + 2 + k.len() + 2 + v.len();
    }
    if p.maximum_packet_size.is_some() {
        len += u32_len();
    }
    if p.wildcard_subscription_available.is_some() {
        len += bool_len();
    }
    if p.subscription_identifier_available.is_some() {
        len += bool_len();
    }
    if p.shared_subscription_available.is_some() {
        len += bool_len();
    }
    len
}

/// Encode a property block (VLI length prefix + identifier/value pairs).
///
/// Returns the number of bytes written, including the length prefix.
pub fn write_properties(buf: &mut [u8], p: &Properties) -> Result<usize> {
    let body_len = properties_body_len(p);
    let prefix_len = variable_int_len(body_len as u32);
    if buf.len() < prefix_len + body_len {
        return Err(Error::InvalidPacket("buffer too small for properties".into()));
    }

    let mut pos = write_variable_int(buf, body_len as u32)
        .ok_or_else(|| Error::InvalidPacket("property length too large".into()))?;

    macro_rules! put_bool {
        ($id:expr, $v:expr) => {
            buf[pos] = $id;
            pos += 1;
            buf[pos] = if $v { 1 } else { 0 };
            pos += 1;
        };
    }
    macro_rules! put_u16 {
        ($id:expr, $v:expr) => {
            buf[pos] = $id;
            pos += 1;
            pos += write_u16(&mut buf[pos..], $v)
                .map(|_| 2)
                .ok_or_else(|| Error::InvalidPacket("buffer too small".into()))?;
        };
    }
    macro_rules! put_u32 {
        ($id:expr, $v:expr) => {
            buf[pos] = $id;
            pos += 1;
            pos += write_u32(&mut buf[pos..], $v)
                .map(|_| 4)
                .ok_or_else(|| Error::InvalidPacket("buffer too small".into()))?;
        };
    }
    macro_rules! put_str {
        ($id:expr, $v:expr) => {
            buf[pos] = $id;
            pos += 1;
            pos += write_string(&mut buf[pos..], $v)
                .ok_or_else(|| Error::InvalidPacket("buffer too small".into()))?;
        };
    }
    macro_rules! put_bin {
        ($id:expr, $v:expr) => {
            buf[pos] = $id;
            pos += 1;
            pos += write_binary(&mut buf[pos..], $v)
                .ok_or_else(|| Error::InvalidPacket("buffer too small".into()))?;
        };
    }

    if let Some(v) = p.payload_format_indicator {
        put_bool!(id::PAYLOAD_FORMAT_INDICATOR, v);
    }
    if let Some(v) = p.message_expiry_interval {
        put_u32!(id::MESSAGE_EXPIRY_INTERVAL, v);
    }
    if let Some(ref v) = p.content_type {
        put_str!(id::CONTENT_TYPE, v);
    }
    if let Some(ref v) = p.response_topic {
        put_str!(id::RESPONSE_TOPIC, v);
    }
    if let Some(ref v) = p.correlation_data {
        put_bin!(id::CORRELATION_DATA, v);
    }
    if let Some(v) = p.subscription_identifier {
        buf[pos] = id::SUBSCRIPTION_IDENTIFIER;
        pos += 1;
        pos += write_variable_int(&mut buf[pos..], v)
            .ok_or_else(|| Error::InvalidPacket("buffer too small".into()))?;
    }
    if let Some(v) = p.session_expiry_interval {
        put_u32!(id::SESSION_EXPIRY_INTERVAL, v);
    }
    if let Some(ref v) = p.assigned_client_identifier {
        put_str!(id::ASSIGNED_CLIENT_IDENTIFIER, v);
    }
    if let Some(v) = p.server_keep_alive {
        put_u16!(id::SERVER_KEEP_ALIVE, v);
    }
    if let Some(ref v) = p.authentication_method {
        put_str!(id::AUTHENTICATION_METHOD, v);
    }
    if let Some(ref v) = p.authentication_data {
        put_bin!(id::AUTHENTICATION_DATA, v);
    }
    if let Some(v) = p.request_problem_information {
        put_bool!(id::REQUEST_PROBLEM_INFORMATION, v);
    }
    if let Some(v) = p.will_delay_interval {
        put_u32!(id::WILL_DELAY_INTERVAL, v);
    }
    if let Some(v) = p.request_response_information {
        put_bool!(id::REQUEST_RESPONSE_INFORMATION, v);
    }
    if let Some(ref v) = p.response_information {
        put_str!(id::RESPONSE_INFORMATION, v);
    }
    if let Some(ref v) = p.server_reference {
        put_str!(id::SERVER_REFERENCE, v);
    }
    if let Some(ref v) = p.reason_string {
        put_str!(id::REASON_STRING, v);
    }
    if let Some(v) = p.receive_maximum {
        put_u16!(id::RECEIVE_MAXIMUM, v);
    }
    if let Some(v) = p.topic_alias_maximum {
        put_u16!(id::TOPIC_ALIAS_MAXIMUM, v);
    }
    if let Some(v) = p.topic_alias {
        put_u16!(id::TOPIC_ALIAS, v);
    }
    if let Some(qos) = p.maximum_qos {
        buf[pos] = id::MAXIMUM_QOS;
        pos += 1;
        buf[pos] = qos as u8;
        pos += 1;
    }
    if let Some(v) = p.retain_available {
        put_bool!(id::RETAIN_AVAILABLE, v);
    }
    for (k, v) in &p.user_properties {
        buf[pos] = id::USER_PROPERTY;
        pos += 1;
        pos += write_string(&mut buf[pos..], k)
            .ok_or_else(|| Error::InvalidPacket("buffer too small".into()))?;
        pos += write_string(&mut buf[pos..], v)
            .ok_or_else(|| Error::InvalidPacket("buffer too small".into()))?;
    }
    if let Some(v) = p.maximum_packet_size {
        put_u32!(id::MAXIMUM_PACKET_SIZE, v);
    }
    if let Some(v) = p.wildcard_subscription_available {
        put_bool!(id::WILDCARD_SUBSCRIPTION_AVAILABLE, v);
    }
    if let Some(v) = p.subscription_identifier_available {
        put_bool!(id::SUBSCRIPTION_IDENTIFIER_AVAILABLE, v);
    }
    if let Some(v) = p.shared_subscription_available {
        put_bool!(id::SHARED_SUBSCRIPTION_AVAILABLE, v);
    }

    Ok(pos)
}

/// Decode a property block (VLI length prefix + identifier/value pairs).
///
/// Returns the parsed `Properties` and the total bytes consumed (including
/// the length prefix). An unrecognized identifier, or a duplicate
/// occurrence of a scalar (non-repeatable) property, is a protocol error.
pub fn read_properties(buf: &[u8]) -> Result<(Properties, usize)> {
    let (body_len, prefix_len) =
        read_variable_int(buf).ok_or(Error::Incomplete { needed: 1 })?;
    let body_len = body_len as usize;
    if buf.len() < prefix_len + body_len {
        return Err(Error::Incomplete {
            needed: prefix_len + body_len - buf.len(),
        });
    }

    let mut p = Properties::default();
    let mut pos = prefix_len;
    let end = prefix_len + body_len;

    macro_rules! dup_check {
        ($cond:expr) => {
            if $cond {
                return Err(Error::ProtocolViolation(
                    "duplicate property identifier".into(),
                ));
            }
        };
    }

    while pos < end {
        let prop_id = buf[pos];
        pos += 1;
        match prop_id {
            id::PAYLOAD_FORMAT_INDICATOR => {
                dup_check!(p.payload_format_indicator.is_some());
                p.payload_format_indicator = Some(buf[pos] != 0);
                pos += 1;
            }
            id::MESSAGE_EXPIRY_INTERVAL => {
                dup_check!(p.message_expiry_interval.is_some());
                p.message_expiry_interval =
                    Some(read_u32(&buf[pos..]).ok_or(Error::Incomplete { needed: 4 })?);
                pos += 4;
            }
            id::CONTENT_TYPE => {
                dup_check!(p.content_type.is_some());
                let (s, len) = read_string_slice(&buf[pos..])?;
                p.content_type = Some(s.to_string());
                pos += len;
            }
            id::RESPONSE_TOPIC => {
                dup_check!(p.response_topic.is_some());
                let (s, len) = read_string_slice(&buf[pos..])?;
                p.response_topic = Some(s.to_string());
                pos += len;
            }
            id::CORRELATION_DATA => {
                dup_check!(p.correlation_data.is_some());
                let (b, len) = read_binary_slice(&buf[pos..])?;
                p.correlation_data = Some(b.to_vec());
                pos += len;
            }
            id::SUBSCRIPTION_IDENTIFIER => {
                let (v, len) =
                    read_variable_int(&buf[pos..]).ok_or(Error::Incomplete { needed: 1 })?;
                p.subscription_identifier = Some(v);
                pos += len;
            }
            id::SESSION_EXPIRY_INTERVAL => {
                dup_check!(p.session_expiry_interval.is_some());
                p.session_expiry_interval =
                    Some(read_u32(&buf[pos..]).ok_or(Error::Incomplete { needed: 4 })?);
                pos += 4;
            }
            id::ASSIGNED_CLIENT_IDENTIFIER => {
                dup_check!(p.assigned_client_identifier.is_some());
                let (s, len) = read_string_slice(&buf[pos..])?;
                p.assigned_client_identifier = Some(s.to_string());
                pos += len;
            }
            id::SERVER_KEEP_ALIVE => {
                dup_check!(p.server_keep_alive.is_some());
                p.server_keep_alive =
                    Some(read_u16(&buf[pos..]).ok_or(Error::Incomplete { needed: 2 })?);
                pos += 2;
            }
            id::AUTHENTICATION_METHOD => {
                dup_check!(p.authentication_method.is_some());
                let (s, len) = read_string_slice(&buf[pos..])?;
                p.authentication_method = Some(s.to_string());
                pos += len;
            }
            id::AUTHENTICATION_DATA => {
                dup_check!(p.authentication_data.is_some());
                let (b, len) = read_binary_slice(&buf[pos..])?;
                p.authentication_data = Some(b.to_vec());
                pos += len;
            }
            id::REQUEST_PROBLEM_INFORMATION => {
                dup_check!(p.request_problem_information.is_some());
                p.request_problem_information = Some(buf[pos] != 0);
                pos += 1;
            }
            id::WILL_DELAY_INTERVAL => {
                dup_check!(p.will_delay_interval.is_some());
                p.will_delay_interval =
                    Some(read_u32(&buf[pos..]).ok_or(Error::Incomplete { needed: 4 })?);
                pos += 4;
            }
            id::REQUEST_RESPONSE_INFORMATION => {
                dup_check!(p.request_response_information.is_some());
                p.request_response_information = Some(buf[pos] != 0);
                pos += 1;
            }
            id::RESPONSE_INFORMATION => {
                dup_check!(p.response_information.is_some());
                let (s, len) = read_string_slice(&buf[pos..])?;
                p.response_information = Some(s.to_string());
                pos += len;
            }
            id::SERVER_REFERENCE => {
                dup_check!(p.server_reference.is_some());
                let (s, len) = read_string_slice(&buf[pos..])?;
                p.server_reference = Some(s.to_string());
                pos += len;
            }
            id::REASON_STRING => {
                dup_check!(p.reason_string.is_some());
                let (s, len) = read_string_slice(&buf[pos..])?;
                p.reason_string = Some(s.to_string());
                pos += len;
            }
            id::RECEIVE_MAXIMUM => {
                dup_check!(p.receive_maximum.is_some());
                p.receive_maximum =
                    Some(read_u16(&buf[pos..]).ok_or(Error::Incomplete { needed: 2 })?);
                pos += 2;
            }
            id::TOPIC_ALIAS_MAXIMUM => {
                dup_check!(p.topic_alias_maximum.is_some());
                p.topic_alias_maximum =
                    Some(read_u16(&buf[pos..]).ok_or(Error::Incomplete { needed: 2 })?);
                pos += 2;
            }
            id::TOPIC_ALIAS => {
                dup_check!(p.topic_alias.is_some());
                p.topic_alias =
                    Some(read_u16(&buf[pos..]).ok_or(Error::Incomplete { needed: 2 })?);
                pos += 2;
            }
            id::MAXIMUM_QOS => {
                dup_check!(p.maximum_qos.is_some());
                p.maximum_qos = Some(
                    QoS::from_u8(buf[pos])
                        .ok_or_else(|| Error::ProtocolViolation("invalid maximum qos".into()))?,
                );
                pos += 1;
            }
            id::RETAIN_AVAILABLE => {
                dup_check!(p.retain_available.is_some());
                p.retain_available = Some(buf[pos] != 0);
                pos += 1;
            }
            id::USER_PROPERTY => {
                let (k, klen) = read_string_slice(&buf[pos..])?;
                pos += klen;
                let (v, vlen) = read_string_slice(&buf[pos..])?;
                pos += vlen;
                p.user_properties.push((k.to_string(), v.to_string()));
            }
            id::MAXIMUM_PACKET_SIZE => {
                dup_check!(p.maximum_packet_size.is_some());
                p.maximum_packet_size =
                    Some(read_u32(&buf[pos..]).ok_or(Error::Incomplete { needed: 4 })?);
                pos += 4;
            }
            id::WILDCARD_SUBSCRIPTION_AVAILABLE => {
                dup_check!(p.wildcard_subscription_available.is_some());
                p.wildcard_subscription_available = Some(buf[pos] != 0);
                pos += 1;
            }
            id::SUBSCRIPTION_IDENTIFIER_AVAILABLE => {
                dup_check!(p.subscription_identifier_available.is_some());
                p.subscription_identifier_available = Some(buf[pos] != 0);
                pos += 1;
            }
            id::SHARED_SUBSCRIPTION_AVAILABLE => {
                dup_check!(p.shared_subscription_available.is_some());
                p.shared_subscription_available = Some(buf[pos] != 0);
                pos += 1;
            }
            other => {
                return Err(Error::ProtocolViolation(format!(
                    "unknown property identifier {other:#x}"
                )));
            }
        }
    }

    Ok((p, end))
}
