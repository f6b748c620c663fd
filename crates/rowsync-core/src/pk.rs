//! Primary-key encoding.
//!
//! A row is identified across replicas by its primary-key values quoted the
//! way SQL literals are written and joined with `|`:
//!
//! ```text
//! 1|'it''s'|X'00FF'|NULL|2.5
//! ```
//!
//! The encoding is stable: the same key values always produce the same
//! string on every replica, and [`decode_pk`] recovers the values.

use crate::error::CoreError;
use crate::value::ColumnValue;

const SEPARATOR: char = '|';

/// Encode primary-key values into a row identity string.
pub fn encode_pk(values: &[ColumnValue]) -> String {
    let mut out = String::new();
    for (i, value) in values.iter().enumerate() {
        if i > 0 {
            out.push(SEPARATOR);
        }
        quote_into(value, &mut out);
    }
    out
}

fn quote_into(value: &ColumnValue, out: &mut String) {
    match value {
        ColumnValue::Null => out.push_str("NULL"),
        ColumnValue::Integer(i) => out.push_str(&i.to_string()),
        ColumnValue::Real(r) => {
            let s = format!("{:?}", r);
            out.push_str(&s);
        }
        ColumnValue::Text(t) => {
            out.push('\'');
            out.push_str(&t.replace('\'', "''"));
            out.push('\'');
        }
        ColumnValue::Blob(b) => {
            out.push_str("X'");
            out.push_str(&hex::encode_upper(b));
            out.push('\'');
        }
    }
}

/// Decode a row identity string back into its primary-key values.
pub fn decode_pk(encoded: &str) -> Result<Vec<ColumnValue>, CoreError> {
    let mut values = Vec::new();
    let mut rest = encoded;

    loop {
        let (value, remaining) = parse_one(rest, encoded)?;
        values.push(value);

        if remaining.is_empty() {
            return Ok(values);
        }
        match remaining.strip_prefix(SEPARATOR) {
            Some(next) => rest = next,
            None => return Err(CoreError::InvalidPk(encoded.to_string())),
        }
    }
}

fn parse_one<'a>(input: &'a str, whole: &str) -> Result<(ColumnValue, &'a str), CoreError> {
    let invalid = || CoreError::InvalidPk(whole.to_string());

    if let Some(rest) = input.strip_prefix("NULL") {
        return Ok((ColumnValue::Null, rest));
    }

    if let Some(rest) = input.strip_prefix("X'") {
        let end = rest.find('\'').ok_or_else(invalid)?;
        let bytes = hex::decode(&rest[..end]).map_err(|_| invalid())?;
        return Ok((ColumnValue::Blob(bytes), &rest[end + 1..]));
    }

    if let Some(body) = input.strip_prefix('\'') {
        let mut text = String::new();
        let mut chars = body.char_indices().peekable();
        while let Some((i, c)) = chars.next() {
            if c == '\'' {
                if let Some(&(_, '\'')) = chars.peek() {
                    chars.next();
                    text.push('\'');
                    continue;
                }
                return Ok((ColumnValue::Text(text), &body[i + 1..]));
            }
            text.push(c);
        }
        return Err(invalid());
    }

    let end = input.find(SEPARATOR).unwrap_or(input.len());
    let literal = &input[..end];
    if literal.is_empty() {
        return Err(invalid());
    }
    let value = if let Ok(i) = literal.parse::<i64>() {
        ColumnValue::Integer(i)
    } else {
        ColumnValue::Real(literal.parse::<f64>().map_err(|_| invalid())?)
    };
    Ok((value, &input[end..]))
}
