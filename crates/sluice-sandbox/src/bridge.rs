//! Typed value bridge.
//!
//! Engine-agnostic reads, writes and deletes against a [`Message`].  Both
//! interpreter backends funnel every guest request through these functions,
//! so they observe identical field-protocol semantics.
//!
//! Fields are addressed by `(name, field index, array index)`: the field
//! index selects among same-named fields in declaration order, the array
//! index selects an element within that field's value array.  Indices
//! arrive from guests as signed integers; negative values are always out of
//! range.

use std::borrow::Cow;
use std::cmp::Ordering;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use sluice_pipeline::{Field, FieldValues, Message, Value, ValueKind, ValueRef};
use uuid::Uuid;

use crate::address::Header;
use crate::error::FieldError;

// ---------------------------------------------------------------------------
// Fields
// ---------------------------------------------------------------------------

/// Read one element of a field.  Out-of-range indices yield `None`.
pub fn read_field<'m>(msg: &'m Message, name: &str, fi: i64, ai: i64) -> Option<ValueRef<'m>> {
    let fi = usize::try_from(fi).ok()?;
    let ai = usize::try_from(ai).ok()?;
    msg.fields
        .iter()
        .filter(|f| f.name == name)
        .nth(fi)?
        .value(ai)
}

/// Write one element of a field, creating the field when `fi` equals the
/// number of fields named `name`.
///
/// On success the field's representation is replaced by `rep`.  On failure
/// the message is left untouched.
pub fn write_field(
    msg: &mut Message,
    name: &str,
    value: Value,
    rep: &str,
    fi: i64,
    ai: i64,
) -> Result<(), FieldError> {
    let positions = msg.field_positions(name);
    let count = positions.len();
    let slot = usize::try_from(fi).ok().filter(|&fi| fi <= count);
    let Some(slot) = slot else {
        return Err(FieldError::BadFieldIndex {
            name: name.to_owned(),
            index: fi,
            count,
        });
    };

    if slot == count {
        if ai != 0 {
            return Err(FieldError::BadArrayIndex {
                name: name.to_owned(),
                index: ai,
                len: 0,
            });
        }
        msg.add_field(Field::new(name, value, rep));
        return Ok(());
    }

    let field = &mut msg.fields[positions[slot]];
    let len = field.len();
    let index = usize::try_from(ai).unwrap_or(usize::MAX);
    let stored = match (&mut field.values, value) {
        (FieldValues::String(v), Value::String(x)) => store(v, index, x),
        (FieldValues::Bytes(v), Value::Bytes(x)) => store(v, index, x),
        (FieldValues::Integer(v), Value::Integer(x)) => store(v, index, x),
        (FieldValues::Double(v), Value::Double(x)) => store(v, index, x),
        (FieldValues::Bool(v), Value::Bool(x)) => store(v, index, x),
        (values, other) => {
            return Err(FieldError::TypeMismatch {
                name: name.to_owned(),
                expected: values.kind(),
                found: other.kind(),
            });
        }
    };
    if !stored {
        return Err(FieldError::BadArrayIndex {
            name: name.to_owned(),
            index: ai,
            len,
        });
    }
    field.representation = rep.to_owned();
    Ok(())
}

/// Overwrite `v[index]`, or append when `index == v.len()`.
fn store<T>(v: &mut Vec<T>, index: usize, x: T) -> bool {
    match index.cmp(&v.len()) {
        Ordering::Less => {
            v[index] = x;
            true
        }
        Ordering::Equal => {
            v.push(x);
            true
        }
        Ordering::Greater => false,
    }
}

/// Delete a whole field (`ai == None`) or one element of it.
///
/// Deleting a name with no matching fields is a no-op.
pub fn delete_field(msg: &mut Message, name: &str, fi: i64, ai: Option<i64>) -> Result<(), FieldError> {
    let positions = msg.field_positions(name);
    if positions.is_empty() {
        return Ok(());
    }
    let Some(&position) = usize::try_from(fi).ok().and_then(|fi| positions.get(fi)) else {
        return Err(FieldError::BadFieldIndex {
            name: name.to_owned(),
            index: fi,
            count: positions.len(),
        });
    };

    match ai {
        None => {
            msg.remove_field_at(position);
            Ok(())
        }
        Some(ai) => {
            let field = &mut msg.fields[position];
            let len = field.len();
            let removed = usize::try_from(ai).is_ok_and(|index| field.values.remove(index));
            if removed {
                Ok(())
            } else {
                Err(FieldError::BadArrayIndex {
                    name: name.to_owned(),
                    index: ai,
                    len,
                })
            }
        }
    }
}

/// One step of field iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSummary<'m> {
    pub name: &'m str,
    pub representation: &'m str,
    pub kind: ValueKind,
    /// First element, if the array is not empty.
    pub value: Option<ValueRef<'m>>,
    pub count: usize,
}

/// Summarize the field at `cursor`, or `None` once iteration is exhausted.
pub fn next_field(msg: &Message, cursor: usize) -> Option<FieldSummary<'_>> {
    let field = msg.fields.get(cursor)?;
    Some(FieldSummary {
        name: &field.name,
        representation: &field.representation,
        kind: field.kind(),
        value: field.value(0),
        count: field.len(),
    })
}

// ---------------------------------------------------------------------------
// Headers
// ---------------------------------------------------------------------------

pub fn read_header(msg: &Message, header: Header) -> ValueRef<'_> {
    fn text(s: &str) -> ValueRef<'_> {
        ValueRef::String(Cow::Borrowed(s))
    }
    match header {
        Header::Type => text(&msg.msg_type),
        Header::Logger => text(&msg.logger),
        Header::Payload => text(&msg.payload),
        Header::EnvVersion => text(&msg.env_version),
        Header::Hostname => text(&msg.hostname),
        Header::Uuid => ValueRef::String(Cow::Owned(msg.uuid.to_string())),
        Header::Timestamp => ValueRef::Integer(msg.timestamp),
        Header::Severity => ValueRef::Integer(i64::from(msg.severity)),
        Header::Pid => ValueRef::Integer(i64::from(msg.pid)),
    }
}

/// Set a header.  The message is unchanged on failure.
pub fn write_header(msg: &mut Message, header: Header, value: Value) -> Result<(), FieldError> {
    match header {
        Header::Type => msg.msg_type = header_text(header, value)?,
        Header::Logger => msg.logger = header_text(header, value)?,
        Header::Payload => msg.payload = header_text(header, value)?,
        Header::EnvVersion => msg.env_version = header_text(header, value)?,
        Header::Hostname => msg.hostname = header_text(header, value)?,
        Header::Uuid => msg.uuid = parse_uuid(value)?,
        Header::Timestamp => msg.timestamp = parse_timestamp(value)?,
        Header::Severity => msg.severity = header_int32(header, value)?,
        Header::Pid => msg.pid = header_int32(header, value)?,
    }
    Ok(())
}

fn invalid(header: Header, value: &Value) -> FieldError {
    FieldError::InvalidHeaderValue {
        header: header.as_str(),
        value: format!("{value:?}"),
    }
}

fn header_text(header: Header, value: Value) -> Result<String, FieldError> {
    match value {
        Value::String(s) => Ok(s),
        Value::Bytes(b) => String::from_utf8(b).map_err(|e| FieldError::InvalidHeaderValue {
            header: header.as_str(),
            value: e.to_string(),
        }),
        other => Err(invalid(header, &other)),
    }
}

fn header_int32(header: Header, value: Value) -> Result<i32, FieldError> {
    let wide = match &value {
        Value::Integer(i) => Some(*i),
        Value::Double(d) => Some(*d as i64),
        Value::String(s) => parse_int(s.trim()),
        _ => None,
    };
    wide.and_then(|i| i32::try_from(i).ok())
        .ok_or_else(|| invalid(header, &value))
}

fn parse_uuid(value: Value) -> Result<Uuid, FieldError> {
    match value {
        Value::String(s) => Uuid::parse_str(s.trim()).map_err(|_| FieldError::UuidParse(s)),
        Value::Bytes(b) => Uuid::from_slice(&b).map_err(|e| FieldError::UuidParse(e.to_string())),
        other => Err(FieldError::UuidParse(format!("{other:?}"))),
    }
}

/// Nanoseconds since the epoch from a number, an integer string, or a
/// calendar string interpreted in UTC.
pub fn parse_timestamp(value: Value) -> Result<i64, FieldError> {
    match value {
        Value::Integer(i) => Ok(i),
        Value::Double(d) => Ok(d as i64),
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return Err(FieldError::TimestampParse(s));
            }
            parse_int(trimmed)
                .or_else(|| parse_calendar(trimmed))
                .ok_or(FieldError::TimestampParse(s))
        }
        other => Err(FieldError::TimestampParse(format!("{other:?}"))),
    }
}

/// Signed integer with optional `0x`, `0o`, `0b`, or leading-zero octal
/// prefix.
pub fn parse_int(s: &str) -> Option<i64> {
    let (negative, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    let (radix, body) = if let Some(r) = digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        (16, r)
    } else if let Some(r) = digits.strip_prefix("0o").or_else(|| digits.strip_prefix("0O")) {
        (8, r)
    } else if let Some(r) = digits.strip_prefix("0b").or_else(|| digits.strip_prefix("0B")) {
        (2, r)
    } else if digits.len() > 1 && digits.starts_with('0') {
        (8, &digits[1..])
    } else {
        (10, digits)
    };
    if body.is_empty() || body.starts_with(['+', '-']) {
        return None;
    }
    let magnitude = i128::from(u64::from_str_radix(body, radix).ok()?);
    i64::try_from(if negative { -magnitude } else { magnitude }).ok()
}

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y/%m/%d %H:%M:%S%.f",
    "%d/%b/%Y:%H:%M:%S",
    "%b %d %Y %H:%M:%S",
];

fn parse_calendar(s: &str) -> Option<i64> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.timestamp_nanos_opt();
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(s) {
        return dt.timestamp_nanos_opt();
    }
    if let Ok(dt) = DateTime::parse_from_str(s, "%d/%b/%Y:%H:%M:%S %z") {
        return dt.timestamp_nanos_opt();
    }
    for fmt in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return naive.and_utc().timestamp_nanos_opt();
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()?
        .and_hms_opt(0, 0, 0)?
        .and_utc()
        .timestamp_nanos_opt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int_field(msg: &Message, name: &str) -> Vec<i64> {
        match &msg.find_first_field(name).expect("field must exist in tests").values {
            FieldValues::Integer(v) => v.clone(),
            other => panic!("unexpected values {other:?}"),
        }
    }

    #[test]
    fn write_at_count_creates_field() {
        let mut msg = Message::new();
        write_field(&mut msg, "count", Value::Integer(10), "", 0, 0).expect("create");
        write_field(&mut msg, "count", Value::String("x".into()), "", 1, 0).expect("second");
        assert_eq!(msg.field_positions("count").len(), 2);
        assert_eq!(msg.fields[1].kind(), ValueKind::String);

        let err = write_field(&mut msg, "count", Value::Integer(1), "", 2, 1).unwrap_err();
        assert!(matches!(err, FieldError::BadArrayIndex { index: 1, .. }));
        let err = write_field(&mut msg, "count", Value::Integer(1), "", 3, 0).unwrap_err();
        assert!(matches!(err, FieldError::BadFieldIndex { index: 3, count: 2, .. }));
        assert_eq!(msg.fields.len(), 2);
    }

    #[test]
    fn append_overwrite_and_bad_index() {
        let mut msg = Message::new();
        write_field(&mut msg, "count", Value::Integer(10), "", 0, 0).expect("create");
        write_field(&mut msg, "count", Value::Integer(20), "", 0, 1).expect("append");
        write_field(&mut msg, "count", Value::Integer(30), "", 0, 2).expect("append");
        assert_eq!(int_field(&msg, "count"), vec![10, 20, 30]);

        let err = write_field(&mut msg, "count", Value::Integer(99), "", 0, 10).unwrap_err();
        assert!(matches!(err, FieldError::BadArrayIndex { index: 10, len: 3, .. }));
        assert_eq!(int_field(&msg, "count"), vec![10, 20, 30]);

        write_field(&mut msg, "count", Value::Integer(11), "ms", 0, 0).expect("overwrite");
        assert_eq!(int_field(&msg, "count"), vec![11, 20, 30]);
        assert_eq!(msg.fields[0].representation, "ms");
    }

    #[test]
    fn type_mismatch_leaves_field_unchanged() {
        let mut msg = Message::new();
        write_field(&mut msg, "count", Value::Integer(1), "n", 0, 0).expect("create");
        let before = msg.clone();
        for value in [
            Value::String("1".into()),
            Value::Bytes(vec![1]),
            Value::Double(1.0),
            Value::Bool(true),
        ] {
            let err = write_field(&mut msg, "count", value, "other", 0, 0).unwrap_err();
            assert!(matches!(
                err,
                FieldError::TypeMismatch {
                    expected: ValueKind::Integer,
                    ..
                }
            ));
        }
        assert_eq!(msg, before);
    }

    #[test]
    fn negative_indices_are_out_of_range() {
        let mut msg = Message::new();
        write_field(&mut msg, "a", Value::Bool(true), "", 0, 0).expect("create");
        assert!(read_field(&msg, "a", -1, 0).is_none());
        assert!(read_field(&msg, "a", 0, -1).is_none());
        assert!(write_field(&mut msg, "a", Value::Bool(false), "", -1, 0).is_err());
        assert!(write_field(&mut msg, "a", Value::Bool(false), "", 0, -1).is_err());
        assert!(delete_field(&mut msg, "a", 0, Some(-1)).is_err());
    }

    #[test]
    fn read_selects_among_same_named_fields() {
        let mut msg = Message::new();
        msg.add_field(Field::new("tag", Value::String("a".into()), ""));
        msg.add_field(Field::new("other", Value::Integer(1), ""));
        msg.add_field(Field::new("tag", Value::String("b".into()), ""));
        assert_eq!(
            read_field(&msg, "tag", 1, 0),
            Some(ValueRef::String(Cow::Borrowed("b")))
        );
        assert!(read_field(&msg, "tag", 2, 0).is_none());
        assert!(read_field(&msg, "tag", 0, 1).is_none());
        assert!(read_field(&msg, "missing", 0, 0).is_none());
    }

    #[test]
    fn delete_missing_name_is_noop() {
        let mut msg = Message::new();
        delete_field(&mut msg, "nothing", 0, None).expect("no-op");
        delete_field(&mut msg, "nothing", 3, Some(7)).expect("no-op");
        assert!(msg.fields.is_empty());
    }

    #[test]
    fn delete_element_shifts_down() {
        let mut msg = Message::new();
        msg.add_field(Field {
            name: "n".into(),
            representation: String::new(),
            values: FieldValues::Integer(vec![1, 2, 3, 4]),
        });
        delete_field(&mut msg, "n", 0, Some(1)).expect("delete element");
        assert_eq!(int_field(&msg, "n"), vec![1, 3, 4]);

        let err = delete_field(&mut msg, "n", 0, Some(3)).unwrap_err();
        assert!(matches!(err, FieldError::BadArrayIndex { len: 3, .. }));
        assert_eq!(int_field(&msg, "n"), vec![1, 3, 4]);

        let err = delete_field(&mut msg, "n", 1, None).unwrap_err();
        assert!(matches!(err, FieldError::BadFieldIndex { count: 1, .. }));

        delete_field(&mut msg, "n", 0, None).expect("delete field");
        assert!(msg.fields.is_empty());
    }

    #[test]
    fn timestamp_from_integer_string() {
        let mut msg = Message::new();
        write_header(
            &mut msg,
            Header::Timestamp,
            Value::String("1577836800000000000".into()),
        )
        .expect("integer string");
        assert_eq!(msg.timestamp, 1_577_836_800_000_000_000);

        let err = write_header(&mut msg, Header::Timestamp, Value::String("not-a-number".into()))
            .unwrap_err();
        assert!(matches!(err, FieldError::TimestampParse(_)));
        assert_eq!(msg.timestamp, 1_577_836_800_000_000_000);

        let err = write_header(&mut msg, Header::Timestamp, Value::String(String::new())).unwrap_err();
        assert!(matches!(err, FieldError::TimestampParse(_)));
    }

    #[test]
    fn timestamp_from_calendar_strings() {
        let expected = 1_577_836_800_000_000_000;
        for s in [
            "2020-01-01T00:00:00Z",
            "2020-01-01 00:00:00",
            "2020-01-01",
            "Wed, 01 Jan 2020 00:00:00 +0000",
            "01/Jan/2020:00:00:00 +0000",
        ] {
            assert_eq!(
                parse_timestamp(Value::String(s.into())),
                Ok(expected),
                "parsing {s}"
            );
        }
    }

    #[test]
    fn parse_int_prefixes() {
        assert_eq!(parse_int("42"), Some(42));
        assert_eq!(parse_int("-42"), Some(-42));
        assert_eq!(parse_int("0x1f"), Some(31));
        assert_eq!(parse_int("0o17"), Some(15));
        assert_eq!(parse_int("017"), Some(15));
        assert_eq!(parse_int("0b101"), Some(5));
        assert_eq!(parse_int("0"), Some(0));
        assert_eq!(parse_int("-9223372036854775808"), Some(i64::MIN));
        assert_eq!(parse_int("9223372036854775808"), None);
        assert_eq!(parse_int("--1"), None);
        assert_eq!(parse_int("0x"), None);
        assert_eq!(parse_int("12abc"), None);
    }

    #[test]
    fn header_round_trip() {
        let mut msg = Message::new();
        write_header(&mut msg, Header::Type, Value::String("nginx.access".into())).expect("type");
        write_header(&mut msg, Header::Severity, Value::String("3".into())).expect("severity");
        write_header(&mut msg, Header::Pid, Value::Double(1234.0)).expect("pid");
        assert_eq!(
            read_header(&msg, Header::Type),
            ValueRef::String(Cow::Borrowed("nginx.access"))
        );
        assert_eq!(read_header(&msg, Header::Severity), ValueRef::Integer(3));
        assert_eq!(read_header(&msg, Header::Pid), ValueRef::Integer(1234));

        let err = write_header(&mut msg, Header::Severity, Value::String("high".into())).unwrap_err();
        assert!(matches!(err, FieldError::InvalidHeaderValue { header: "Severity", .. }));
        assert_eq!(msg.severity, 3);
        assert!(write_header(&mut msg, Header::Logger, Value::Integer(1)).is_err());
    }

    #[test]
    fn uuid_header_must_parse() {
        let mut msg = Message::new();
        let id = "0191f3c2-7a4e-7b1c-9d2e-3f4a5b6c7d8e";
        write_header(&mut msg, Header::Uuid, Value::String(id.into())).expect("uuid");
        assert_eq!(read_header(&msg, Header::Uuid), ValueRef::String(Cow::Owned(id.into())));

        let err = write_header(&mut msg, Header::Uuid, Value::String("nope".into())).unwrap_err();
        assert_eq!(err, FieldError::UuidParse("nope".into()));
        assert_eq!(msg.uuid.to_string(), id);
    }

    #[test]
    fn next_field_walks_declaration_order() {
        let mut msg = Message::new();
        msg.add_field(Field::new("a", Value::Integer(1), "count"));
        msg.add_field(Field {
            name: "b".into(),
            representation: String::new(),
            values: FieldValues::String(Vec::new()),
        });
        let first = next_field(&msg, 0).expect("first");
        assert_eq!(first.name, "a");
        assert_eq!(first.representation, "count");
        assert_eq!(first.value, Some(ValueRef::Integer(1)));
        assert_eq!(first.count, 1);
        let second = next_field(&msg, 1).expect("second");
        assert_eq!(second.kind, ValueKind::String);
        assert!(second.value.is_none());
        assert!(next_field(&msg, 2).is_none());
    }
}
