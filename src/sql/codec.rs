//! Column codecs
//!
//! A codec names the SQL type of a value and converts wire values coming
//! back from the database.

use std::borrow::Cow;

use serde_json::Value;

use super::fragment::{concat, raw, SqlFragment};

/// SQL type descriptor
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Codec {
    sql_type: Cow<'static, str>,
}

impl Codec {
    /// Codec for a trusted SQL type name
    pub fn new(sql_type: impl Into<Cow<'static, str>>) -> Self {
        Self {
            sql_type: sql_type.into(),
        }
    }

    pub fn int4() -> Self {
        Self::new("int4")
    }

    pub fn int8() -> Self {
        Self::new("int8")
    }

    pub fn text() -> Self {
        Self::new("text")
    }

    pub fn bool() -> Self {
        Self::new("bool")
    }

    pub fn uuid() -> Self {
        Self::new("uuid")
    }

    pub fn json() -> Self {
        Self::new("json")
    }

    /// Returns the SQL type name
    pub fn sql_type(&self) -> &str {
        &self.sql_type
    }

    /// `(fragment)::type`
    pub fn cast(&self, fragment: SqlFragment) -> SqlFragment {
        concat(vec![
            raw("("),
            fragment,
            raw(format!(")::{}", self.sql_type)),
        ])
    }

    /// Converts a value as returned by the database.
    ///
    /// Text-protocol drivers return numbers and booleans as strings; those
    /// are parsed back for the integer and boolean types. Anything that
    /// fails to parse is passed through untouched.
    pub fn from_wire(&self, value: Value) -> Value {
        match (self.sql_type.as_ref(), value) {
            ("int2" | "int4" | "int8", Value::String(s)) => match s.parse::<i64>() {
                Ok(n) => Value::from(n),
                Err(_) => Value::String(s),
            },
            ("bool", Value::String(s)) => match s.as_str() {
                "t" | "true" => Value::Bool(true),
                "f" | "false" => Value::Bool(false),
                _ => Value::String(s),
            },
            (_, other) => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::{compile, value, CompileContext};
    use serde_json::json;

    #[test]
    fn test_cast() {
        let f = Codec::int4().cast(value(json!(5)));
        let compiled = compile(&f, &CompileContext::empty()).unwrap();
        assert_eq!(compiled.text, "($1)::int4");
    }

    #[test]
    fn test_from_wire() {
        assert_eq!(Codec::int8().from_wire(json!("12")), json!(12));
        assert_eq!(Codec::bool().from_wire(json!("t")), json!(true));
        assert_eq!(Codec::text().from_wire(json!("12")), json!("12"));
        assert_eq!(Codec::int4().from_wire(json!("x")), json!("x"));
    }
}
