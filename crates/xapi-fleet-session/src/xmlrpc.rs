//! XML-RPC encoding and decoding.
//!
//! Values are represented as `serde_json::Value`. The mapping is:
//!
//! | XML-RPC                      | JSON                 |
//! |------------------------------|----------------------|
//! | `int`, `i4`, `i8`            | integer number       |
//! | `double`                     | float number         |
//! | `boolean`                    | bool                 |
//! | `string`, untyped            | string               |
//! | `dateTime.iso8601`, `base64` | string (verbatim)    |
//! | `array`                      | array                |
//! | `struct`                     | object               |
//! | `nil`                        | null                 |

use std::fmt::Write as _;

use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde_json::{Map, Number, Value};

use crate::error::{Result, SessionError};

/// Encode a method call document.
#[must_use]
pub fn encode_call(method: &str, params: &[Value]) -> String {
    let mut out = String::with_capacity(256);
    out.push_str(r#"<?xml version="1.0"?><methodCall><methodName>"#);
    out.push_str(&escape(method));
    out.push_str("</methodName><params>");
    for param in params {
        out.push_str("<param>");
        write_value(&mut out, param);
        out.push_str("</param>");
    }
    out.push_str("</params></methodCall>");
    out
}

fn write_value(out: &mut String, value: &Value) {
    out.push_str("<value>");
    match value {
        Value::Null => out.push_str("<nil/>"),
        Value::Bool(b) => {
            let _ = write!(out, "<boolean>{}</boolean>", u8::from(*b));
        }
        Value::Number(n) => write_number(out, n),
        Value::String(s) => {
            out.push_str("<string>");
            out.push_str(&escape(s.as_str()));
            out.push_str("</string>");
        }
        Value::Array(items) => {
            out.push_str("<array><data>");
            for item in items {
                write_value(out, item);
            }
            out.push_str("</data></array>");
        }
        Value::Object(members) => {
            out.push_str("<struct>");
            for (name, member) in members {
                out.push_str("<member><name>");
                out.push_str(&escape(name.as_str()));
                out.push_str("</name>");
                write_value(out, member);
                out.push_str("</member>");
            }
            out.push_str("</struct>");
        }
    }
    out.push_str("</value>");
}

fn write_number(out: &mut String, n: &Number) {
    let _ = match n.as_i64() {
        Some(i) if i32::try_from(i).is_ok() => write!(out, "<int>{i}</int>"),
        Some(i) => write!(out, "<i8>{i}</i8>"),
        None => match n.as_f64() {
            Some(f) => write!(out, "<double>{f}</double>"),
            None => write!(out, "<string>{n}</string>"),
        },
    };
}

/// Decode a method response document.
///
/// A `<fault>` is reported as [`SessionError::Api`] with the fault code as
/// the error code and the fault string as the only parameter.
///
/// # Errors
///
/// Returns [`SessionError::Protocol`] if the document is not a well-formed
/// method response.
pub fn decode_response(body: &str) -> Result<Value> {
    let mut parser = Parser::new(body);
    parser.expect_start("methodResponse")?;

    match parser.tag()? {
        Token::Start(name) if name == "params" => {
            parser.expect_start("param")?;
            let value = parser.value()?;
            parser.expect_end("param")?;
            parser.expect_end("params")?;
            parser.expect_end("methodResponse")?;
            Ok(value)
        }
        Token::Start(name) if name == "fault" => {
            let fault = parser.value()?;
            Err(fault_error(&fault))
        }
        other => Err(unexpected("params or fault", &other)),
    }
}

fn fault_error(fault: &Value) -> SessionError {
    let code = match fault.get("faultCode") {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => "FAULT".to_string(),
    };
    let message = fault
        .get("faultString")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    SessionError::api(code, vec![message])
}

#[derive(Debug)]
enum Token {
    Start(String),
    End(String),
    Empty(String),
    Text(String),
    Eof,
}

fn tag_name(start: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(start.name().as_ref()).into_owned()
}

fn unexpected(expected: &str, found: &Token) -> SessionError {
    SessionError::Protocol(format!("expected {expected}, found {found:?}"))
}

fn malformed(e: impl std::fmt::Display) -> SessionError {
    SessionError::Protocol(e.to_string())
}

struct Parser<'a> {
    reader: Reader<&'a [u8]>,
}

impl<'a> Parser<'a> {
    fn new(body: &'a str) -> Self {
        Self {
            reader: Reader::from_str(body),
        }
    }

    /// Next token, including whitespace text.
    fn raw(&mut self) -> Result<Token> {
        loop {
            let token = match self.reader.read_event().map_err(malformed)? {
                Event::Start(e) => Token::Start(tag_name(&e)),
                Event::Empty(e) => Token::Empty(tag_name(&e)),
                Event::End(e) => Token::End(String::from_utf8_lossy(e.name().as_ref()).into_owned()),
                Event::Text(t) => Token::Text(t.unescape().map_err(malformed)?.into_owned()),
                Event::CData(c) => Token::Text(String::from_utf8_lossy(&c.into_inner()).into_owned()),
                Event::Eof => Token::Eof,
                Event::Decl(_) | Event::Comment(_) | Event::PI(_) | Event::DocType(_) => continue,
            };
            return Ok(token);
        }
    }

    /// Next structural token, skipping whitespace between elements.
    fn tag(&mut self) -> Result<Token> {
        loop {
            match self.raw()? {
                Token::Text(t) if t.trim().is_empty() => {}
                Token::Text(t) => return Err(unexpected("element", &Token::Text(t))),
                other => return Ok(other),
            }
        }
    }

    fn expect_start(&mut self, name: &str) -> Result<()> {
        match self.tag()? {
            Token::Start(n) if n == name => Ok(()),
            other => Err(unexpected(&format!("<{name}>"), &other)),
        }
    }

    fn expect_end(&mut self, name: &str) -> Result<()> {
        match self.tag()? {
            Token::End(n) if n == name => Ok(()),
            other => Err(unexpected(&format!("</{name}>"), &other)),
        }
    }

    /// Collect character data up to the closing tag `name`.
    fn text(&mut self, name: &str) -> Result<String> {
        let mut text = String::new();
        loop {
            match self.raw()? {
                Token::Text(t) => text.push_str(&t),
                Token::End(n) if n == name => return Ok(text),
                other => return Err(unexpected(&format!("text in <{name}>"), &other)),
            }
        }
    }

    /// Parse a `<value>` element, opening tag included.
    fn value(&mut self) -> Result<Value> {
        match self.tag()? {
            Token::Start(n) if n == "value" => self.value_body(),
            Token::Empty(n) if n == "value" => Ok(Value::String(String::new())),
            other => Err(unexpected("<value>", &other)),
        }
    }

    /// Parse the content of a `<value>` element through its closing tag.
    fn value_body(&mut self) -> Result<Value> {
        let mut untyped = String::new();
        loop {
            match self.raw()? {
                Token::Text(t) => untyped.push_str(&t),
                Token::End(n) if n == "value" => return Ok(Value::String(untyped)),
                Token::Start(n) => {
                    let value = self.typed(&n)?;
                    self.expect_end("value")?;
                    return Ok(value);
                }
                Token::Empty(n) => {
                    let value = empty_typed(&n)?;
                    self.expect_end("value")?;
                    return Ok(value);
                }
                other => return Err(unexpected("value content", &other)),
            }
        }
    }

    fn typed(&mut self, name: &str) -> Result<Value> {
        match name {
            "string" | "dateTime.iso8601" | "base64" => Ok(Value::String(self.text(name)?)),
            "int" | "i4" | "i8" => {
                let text = self.text(name)?;
                text.trim()
                    .parse::<i64>()
                    .map(Value::from)
                    .map_err(|e| malformed(format!("bad <{name}> {text:?}: {e}")))
            }
            "double" => {
                let text = self.text(name)?;
                text.trim()
                    .parse::<f64>()
                    .ok()
                    .and_then(Number::from_f64)
                    .map(Value::Number)
                    .ok_or_else(|| malformed(format!("bad <double> {text:?}")))
            }
            "boolean" => match self.text(name)?.trim() {
                "1" => Ok(Value::Bool(true)),
                "0" => Ok(Value::Bool(false)),
                other => Err(malformed(format!("bad <boolean> {other:?}"))),
            },
            "nil" => {
                self.expect_end("nil")?;
                Ok(Value::Null)
            }
            "array" => self.array(),
            "struct" => self.structure(),
            other => Err(malformed(format!("unknown value type <{other}>"))),
        }
    }

    fn array(&mut self) -> Result<Value> {
        let mut items = Vec::new();
        match self.tag()? {
            Token::Start(n) if n == "data" => loop {
                match self.tag()? {
                    Token::Start(n) if n == "value" => items.push(self.value_body()?),
                    Token::Empty(n) if n == "value" => items.push(Value::String(String::new())),
                    Token::End(n) if n == "data" => break,
                    other => return Err(unexpected("<value> or </data>", &other)),
                }
            },
            Token::Empty(n) if n == "data" => {}
            other => return Err(unexpected("<data>", &other)),
        }
        self.expect_end("array")?;
        Ok(Value::Array(items))
    }

    fn structure(&mut self) -> Result<Value> {
        let mut members = Map::new();
        loop {
            match self.tag()? {
                Token::Start(n) if n == "member" => {
                    self.expect_start("name")?;
                    let name = self.text("name")?;
                    let value = self.value()?;
                    self.expect_end("member")?;
                    members.insert(name, value);
                }
                Token::End(n) if n == "struct" => return Ok(Value::Object(members)),
                other => return Err(unexpected("<member> or </struct>", &other)),
            }
        }
    }
}

fn empty_typed(name: &str) -> Result<Value> {
    match name {
        "string" | "dateTime.iso8601" | "base64" => Ok(Value::String(String::new())),
        "nil" => Ok(Value::Null),
        "array" => Ok(Value::Array(Vec::new())),
        "struct" => Ok(Value::Object(Map::new())),
        other => Err(malformed(format!("empty <{other}/> has no value"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn encodes_login_call() {
        let body = encode_call(
            "session.login_with_password",
            &[json!("root"), json!("p<&>")],
        );
        assert!(body.contains("<methodName>session.login_with_password</methodName>"));
        assert!(body.contains("<value><string>root</string></value>"));
        assert!(body.contains("<string>p&lt;&amp;&gt;</string>"));
    }

    #[test]
    fn encodes_scalars_and_containers() {
        let body = encode_call(
            "x",
            &[json!({"a": [1, 5_000_000_000_i64, 1.5, true, null]})],
        );
        assert!(body.contains("<member><name>a</name><value><array><data>"));
        assert!(body.contains("<value><int>1</int></value>"));
        assert!(body.contains("<value><i8>5000000000</i8></value>"));
        assert!(body.contains("<value><double>1.5</double></value>"));
        assert!(body.contains("<value><boolean>1</boolean></value>"));
        assert!(body.contains("<value><nil/></value>"));
    }

    #[test]
    fn decodes_xapi_success() {
        let body = r#"<?xml version="1.0"?>
<methodResponse>
  <params>
    <param>
      <value>
        <struct>
          <member><name>Status</name><value>Success</value></member>
          <member>
            <name>Value</name>
            <value><array><data>
              <value>OpaqueRef:abc</value>
              <value><string>x &amp; y</string></value>
              <value><i4>42</i4></value>
              <value><boolean>0</boolean></value>
              <value><double>2.5</double></value>
              <value><struct></struct></value>
              <value/>
              <value><string/></value>
            </data></array></value>
          </member>
        </struct>
      </value>
    </param>
  </params>
</methodResponse>"#;

        let value = decode_response(body).unwrap();
        assert_eq!(
            value,
            json!({
                "Status": "Success",
                "Value": ["OpaqueRef:abc", "x & y", 42, false, 2.5, {}, "", ""]
            })
        );
    }

    #[test]
    fn keeps_whitespace_inside_strings() {
        let body = "<methodResponse><params><param><value><string>  padded  </string></value></param></params></methodResponse>";
        assert_eq!(decode_response(body).unwrap(), json!("  padded  "));
    }

    #[test]
    fn decodes_fault() {
        let body = r"<methodResponse><fault><value><struct>
            <member><name>faultCode</name><value><int>4</int></value></member>
            <member><name>faultString</name><value>Too many parameters.</value></member>
        </struct></value></fault></methodResponse>";

        let err = decode_response(body).unwrap_err();
        assert_eq!(
            err,
            SessionError::api("4", vec!["Too many parameters.".to_string()])
        );
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            decode_response("<html>nope</html>"),
            Err(SessionError::Protocol(_))
        ));
        assert!(matches!(
            decode_response("<methodResponse><params><param><value><int>x</int></value></param></params></methodResponse>"),
            Err(SessionError::Protocol(_))
        ));
    }
}
