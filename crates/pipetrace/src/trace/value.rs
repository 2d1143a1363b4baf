use std::borrow::Cow;
use std::fmt::Write as _;

use serde::Serialize;

use crate::pipe::{Fence, Handle};

/// A typed argument or return value in a call record.
#[derive(Debug, Clone, PartialEq)]
pub enum TraceValue {
    Bool(bool),
    Int(i64),
    Uint(u64),
    Float(f64),
    String(String),
    /// Raw bytes, hex encoded in the document.
    Bytes(Vec<u8>),
    /// Object identity. `None` renders as `<null/>`.
    Ptr(Option<u64>),
    Enum(Cow<'static, str>),
    Array(Vec<TraceValue>),
    Struct {
        name: String,
        members: Vec<(String, TraceValue)>,
    },
}

impl TraceValue {
    pub fn null() -> Self {
        TraceValue::Ptr(None)
    }

    pub fn enumerant(name: &'static str) -> Self {
        TraceValue::Enum(Cow::Borrowed(name))
    }

    pub fn array<T: Into<TraceValue>>(items: impl IntoIterator<Item = T>) -> Self {
        TraceValue::Array(items.into_iter().map(Into::into).collect())
    }

    /// Dump a state object member by member.
    ///
    /// The value is taken through `serde_json::Value`, so maps become structs, sequences become
    /// arrays and unit enum variants become strings. Members keep declaration order.
    pub fn from_serialize<T: Serialize + ?Sized>(name: &str, value: &T) -> Self {
        match serde_json::to_value(value) {
            Ok(json) => Self::from_json(name, json),
            Err(err) => {
                tracing::debug!(name, "state object is not serialisable: {err}");
                TraceValue::Struct {
                    name: name.to_owned(),
                    members: Vec::new(),
                }
            }
        }
    }

    /// Record a unit enum variant (or bitflags set) by name.
    pub fn from_enum<T: Serialize + ?Sized>(value: &T) -> Self {
        match serde_json::to_value(value) {
            Ok(serde_json::Value::String(name)) => TraceValue::Enum(Cow::Owned(name)),
            Ok(json) => Self::from_json("", json),
            Err(err) => {
                tracing::debug!("enum value is not serialisable: {err}");
                TraceValue::Ptr(None)
            }
        }
    }

    fn from_json(name: &str, json: serde_json::Value) -> Self {
        use serde_json::Value;

        match json {
            Value::Null => TraceValue::Ptr(None),
            Value::Bool(b) => TraceValue::Bool(b),
            Value::Number(n) => {
                if let Some(v) = n.as_u64() {
                    TraceValue::Uint(v)
                } else if let Some(v) = n.as_i64() {
                    TraceValue::Int(v)
                } else {
                    TraceValue::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            Value::String(s) => TraceValue::String(s),
            Value::Array(items) => {
                TraceValue::Array(items.into_iter().map(|v| Self::from_json(name, v)).collect())
            }
            Value::Object(map) => TraceValue::Struct {
                name: name.to_owned(),
                members: map
                    .into_iter()
                    .map(|(k, v)| {
                        let member = Self::from_json(&k, v);
                        (k, member)
                    })
                    .collect(),
            },
        }
    }

    /// Append the XML rendering of this value to `out`.
    pub fn write_xml(&self, out: &mut String) {
        match self {
            TraceValue::Bool(b) => {
                let _ = write!(out, "<bool>{}</bool>", u8::from(*b));
            }
            TraceValue::Int(v) => {
                let _ = write!(out, "<int>{v}</int>");
            }
            TraceValue::Uint(v) => {
                let _ = write!(out, "<uint>{v}</uint>");
            }
            TraceValue::Float(v) => {
                let _ = write!(out, "<float>{v}</float>");
            }
            TraceValue::String(s) => {
                out.push_str("<string>");
                escape_into(out, s);
                out.push_str("</string>");
            }
            TraceValue::Bytes(bytes) => {
                out.push_str("<bytes>");
                for b in bytes {
                    let _ = write!(out, "{b:02X}");
                }
                out.push_str("</bytes>");
            }
            TraceValue::Ptr(Some(id)) => {
                let _ = write!(out, "<ptr>0x{id:x}</ptr>");
            }
            TraceValue::Ptr(None) => out.push_str("<null/>"),
            TraceValue::Enum(name) => {
                out.push_str("<enum>");
                escape_into(out, name);
                out.push_str("</enum>");
            }
            TraceValue::Array(items) => {
                out.push_str("<array>");
                for item in items {
                    out.push_str("<elem>");
                    item.write_xml(out);
                    out.push_str("</elem>");
                }
                out.push_str("</array>");
            }
            TraceValue::Struct { name, members } => {
                out.push_str("<struct name='");
                escape_into(out, name);
                out.push_str("'>");
                for (member, value) in members {
                    out.push_str("<member name='");
                    escape_into(out, member);
                    out.push_str("'>");
                    value.write_xml(out);
                    out.push_str("</member>");
                }
                out.push_str("</struct>");
            }
        }
    }
}

/// XML-escape `s` for use in text and single- or double-quoted attributes.
pub(crate) fn escape_into(out: &mut String, s: &str) {
    for c in s.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '\'' => out.push_str("&apos;"),
            '"' => out.push_str("&quot;"),
            // Control characters other than tab/newline are not representable in XML 1.0.
            c if (c as u32) < 0x20 && c != '\t' && c != '\n' && c != '\r' => {
                let _ = write!(out, "&#x{:x};", c as u32);
            }
            c => out.push(c),
        }
    }
}

impl From<bool> for TraceValue {
    fn from(v: bool) -> Self {
        TraceValue::Bool(v)
    }
}

impl From<i32> for TraceValue {
    fn from(v: i32) -> Self {
        TraceValue::Int(i64::from(v))
    }
}

impl From<i64> for TraceValue {
    fn from(v: i64) -> Self {
        TraceValue::Int(v)
    }
}

impl From<u8> for TraceValue {
    fn from(v: u8) -> Self {
        TraceValue::Uint(u64::from(v))
    }
}

impl From<u32> for TraceValue {
    fn from(v: u32) -> Self {
        TraceValue::Uint(u64::from(v))
    }
}

impl From<u64> for TraceValue {
    fn from(v: u64) -> Self {
        TraceValue::Uint(v)
    }
}

impl From<usize> for TraceValue {
    fn from(v: usize) -> Self {
        TraceValue::Uint(v as u64)
    }
}

impl From<f32> for TraceValue {
    fn from(v: f32) -> Self {
        TraceValue::Float(f64::from(v))
    }
}

impl From<f64> for TraceValue {
    fn from(v: f64) -> Self {
        TraceValue::Float(v)
    }
}

impl From<&str> for TraceValue {
    fn from(v: &str) -> Self {
        TraceValue::String(v.to_owned())
    }
}

impl From<String> for TraceValue {
    fn from(v: String) -> Self {
        TraceValue::String(v)
    }
}

impl From<Handle> for TraceValue {
    fn from(v: Handle) -> Self {
        TraceValue::Ptr(Some(v.get()))
    }
}

impl From<Option<Handle>> for TraceValue {
    fn from(v: Option<Handle>) -> Self {
        TraceValue::Ptr(v.map(Handle::get))
    }
}

impl From<Fence> for TraceValue {
    fn from(v: Fence) -> Self {
        TraceValue::Ptr(Some(v.0))
    }
}

impl From<Option<Fence>> for TraceValue {
    fn from(v: Option<Fence>) -> Self {
        TraceValue::Ptr(v.map(|f| f.0))
    }
}

impl<const N: usize> From<[f32; N]> for TraceValue {
    fn from(v: [f32; N]) -> Self {
        TraceValue::array(v)
    }
}

impl<const N: usize> From<[u32; N]> for TraceValue {
    fn from(v: [u32; N]) -> Self {
        TraceValue::array(v)
    }
}
