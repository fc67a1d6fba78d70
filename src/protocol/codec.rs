//! XML-RPC codec for SAMP method calls and responses.
//!
//! Provides serialization (`encode_*`) and deserialization (`decode_*`) of
//! [`RpcValue`], [`MethodCall`] and [`MethodResponse`] to/from the XML-RPC
//! subset understood by SAMP hubs.

use roxmltree::{Document, Node};

use crate::protocol::value::{check_params, RpcMap, RpcValue, ValueKind};

/// Errors that can occur during protocol encoding or decoding.
#[derive(thiserror::Error, Debug)]
pub enum ProtocolError {
    /// The document is not well-formed XML.
    #[error("XML parse error: {0}")]
    Xml(#[from] roxmltree::Error),

    /// Well-formed XML whose shape is not valid SAMP XML-RPC.
    #[error("Bad XML-RPC content: {0}")]
    Format(String),

    /// A call was built with the wrong parameter arity or shapes.
    #[error("Param type list mismatch: {expected:?} != {actual:?}")]
    ParamMismatch {
        expected: Vec<ValueKind>,
        actual: Vec<ValueKind>,
    },
}

/// An RPC-level error reported by the hub in place of a result.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("XML-RPC Fault ({code}): {message}")]
pub struct Fault {
    pub code: String,
    pub message: String,
}

/// A method call: name plus ordered parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodCall {
    pub method_name: String,
    pub params: Vec<RpcValue>,
}

impl MethodCall {
    pub fn new(method_name: impl Into<String>, params: Vec<RpcValue>) -> Self {
        Self {
            method_name: method_name.into(),
            params,
        }
    }

    /// Fails with [`ProtocolError::ParamMismatch`] unless the parameters
    /// match `expected` exactly.
    pub fn check_params(&self, expected: &[ValueKind]) -> Result<(), ProtocolError> {
        check_params(&self.params, expected)
    }

    /// Fails with [`ProtocolError::Format`] if the method name or any
    /// string or member name holds a character XML 1.0 cannot carry.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        check_text(&self.method_name, "method name")?;
        self.params.iter().try_for_each(XmlRpcCodec::check_encodable)
    }

    pub fn to_xml(&self) -> String {
        XmlRpcCodec::encode_call(&self.method_name, &self.params)
    }
}

/// The decoded body of a `<methodResponse>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MethodResponse {
    Success(RpcValue),
    Fault(Fault),
}

/// Codec for the SAMP flavour of XML-RPC.
///
/// This struct provides static methods only; it carries no state.
pub struct XmlRpcCodec;

impl XmlRpcCodec {
    /// Escapes markup characters in element text.
    ///
    /// `\r` is written as a character reference, since parsers fold raw
    /// `\r` and `\r\n` into `\n`.
    pub fn escape(text: &str) -> String {
        text.replace('&', "&amp;")
            .replace('<', "&lt;")
            .replace('>', "&gt;")
            .replace('\r', "&#13;")
    }

    /// Checks that every string and member name in `value` can be written
    /// as XML 1.0 text.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::Format`] naming the first offending character.
    pub fn check_encodable(value: &RpcValue) -> Result<(), ProtocolError> {
        match value {
            RpcValue::String(s) => check_text(s, "string"),
            RpcValue::List(items) => items.iter().try_for_each(Self::check_encodable),
            RpcValue::Map(members) => members.iter().try_for_each(|(name, member)| {
                check_text(name, "member name")?;
                Self::check_encodable(member)
            }),
        }
    }

    /// Encodes a value as a `<value>` fragment, indented by `indent`.
    pub fn encode_value(value: &RpcValue, indent: &str) -> String {
        match value {
            RpcValue::String(s) => {
                format!("{indent}<value><string>{}</string></value>", Self::escape(s))
            }
            RpcValue::List(items) => {
                let inner = format!("{indent}      ");
                let mut lines = vec![
                    format!("{indent}<value>"),
                    format!("{indent}  <array>"),
                    format!("{indent}    <data>"),
                ];
                lines.extend(items.iter().map(|item| Self::encode_value(item, &inner)));
                lines.push(format!("{indent}    </data>"));
                lines.push(format!("{indent}  </array>"));
                lines.push(format!("{indent}</value>"));
                lines.join("\n")
            }
            RpcValue::Map(members) => {
                let inner = format!("{indent}      ");
                let mut lines = vec![format!("{indent}<value>"), format!("{indent}  <struct>")];
                for (name, member) in members {
                    lines.push(format!("{indent}    <member>"));
                    lines.push(format!("{indent}      <name>{}</name>", Self::escape(name)));
                    lines.push(Self::encode_value(member, &inner));
                    lines.push(format!("{indent}    </member>"));
                }
                lines.push(format!("{indent}  </struct>"));
                lines.push(format!("{indent}</value>"));
                lines.join("\n")
            }
        }
    }

    /// Wraps parameters in a `<methodCall>` document.
    pub fn encode_call(method_name: &str, params: &[RpcValue]) -> String {
        let mut lines = vec![
            "<?xml version='1.0'?>".to_string(),
            "<methodCall>".to_string(),
            format!("  <methodName>{}</methodName>", Self::escape(method_name)),
            "  <params>".to_string(),
        ];
        for param in params {
            lines.push("    <param>".to_string());
            lines.push(Self::encode_value(param, "      "));
            lines.push("    </param>".to_string());
        }
        lines.push("  </params>".to_string());
        lines.push("</methodCall>".to_string());
        lines.join("\n")
    }

    /// Encodes a `<methodResponse>` document, as a hub would send it.
    pub fn encode_response(response: &MethodResponse) -> String {
        let body = match response {
            MethodResponse::Success(value) => format!(
                "  <params>\n    <param>\n{}\n    </param>\n  </params>",
                Self::encode_value(value, "      ")
            ),
            MethodResponse::Fault(fault) => {
                let detail = RpcValue::map([
                    ("faultCode", fault.code.as_str()),
                    ("faultString", fault.message.as_str()),
                ]);
                format!("  <fault>\n{}\n  </fault>", Self::encode_value(&detail, "    "))
            }
        };
        format!("<?xml version='1.0'?>\n<methodResponse>\n{body}\n</methodResponse>")
    }

    /// Decodes a `<value>` element.
    ///
    /// With `lenient` set, `<int>`/`<i4>` leaves are accepted as text; this is
    /// only needed for fault codes.
    pub fn decode_value(node: Node<'_, '_>, lenient: bool) -> Result<RpcValue, ProtocolError> {
        let children = element_children(node, None)?;
        match children.as_slice() {
            [] => Ok(RpcValue::String(text_content(node)?)),
            [child] => match child.tag_name().name() {
                "string" => Ok(RpcValue::String(text_content(*child)?)),
                "array" => {
                    let data = sole_child(*child, Some("data"))?;
                    element_children(data, Some("value"))?
                        .into_iter()
                        .map(|item| Self::decode_value(item, lenient))
                        .collect::<Result<Vec<_>, _>>()
                        .map(RpcValue::List)
                }
                "struct" => {
                    let mut members = RpcMap::new();
                    for member in element_children(*child, Some("member"))? {
                        let (name, value) = Self::decode_member(member, lenient)?;
                        members.insert(name, value);
                    }
                    Ok(RpcValue::Map(members))
                }
                "int" | "i4" if lenient => Ok(RpcValue::String(text_content(*child)?)),
                other => Err(ProtocolError::Format(format!(
                    "Non SAMP-friendly value content: <{other}>"
                ))),
            },
            _ => Err(ProtocolError::Format(
                "multiple elements in <value>".to_string(),
            )),
        }
    }

    fn decode_member(
        member: Node<'_, '_>,
        lenient: bool,
    ) -> Result<(String, RpcValue), ProtocolError> {
        let mut name = None;
        let mut value = None;
        for child in member.children().filter(Node::is_element) {
            match child.tag_name().name() {
                "name" => name = Some(text_content(child)?),
                "value" => value = Some(Self::decode_value(child, lenient)?),
                _ => {}
            }
        }
        match (name, value) {
            (Some(name), Some(value)) => Ok((name, value)),
            _ => Err(ProtocolError::Format(
                "No <name> and/or <value> in <member>".to_string(),
            )),
        }
    }

    fn decode_params(params: Node<'_, '_>) -> Result<Vec<RpcValue>, ProtocolError> {
        element_children(params, Some("param"))?
            .into_iter()
            .map(|param| Self::decode_value(sole_child(param, Some("value"))?, false))
            .collect()
    }

    fn decode_fault(fault: Node<'_, '_>) -> Result<Fault, ProtocolError> {
        let detail = Self::decode_value(sole_child(fault, Some("value"))?, true)?
            .into_map("fault detail")?;
        let field = |key: &str| -> Result<String, ProtocolError> {
            detail
                .get(key)
                .and_then(RpcValue::as_str)
                .map(str::to_string)
                .ok_or_else(|| ProtocolError::Format(format!("fault without {key}")))
        };
        Ok(Fault {
            code: field("faultCode")?,
            message: field("faultString")?,
        })
    }

    /// Decodes a `<methodResponse>` document.
    ///
    /// # Errors
    ///
    /// Fails unless the sole child of the root is `<fault>` or `<params>`
    /// holding at least one parameter.
    pub fn decode_response(document: &str) -> Result<MethodResponse, ProtocolError> {
        let doc = Document::parse(document)?;
        let root = doc.root_element();
        if root.tag_name().name() != "methodResponse" {
            return Err(ProtocolError::Format(format!(
                "Response element is not <methodResponse>: <{}>",
                root.tag_name().name()
            )));
        }

        let body = sole_child(root, None)?;
        match body.tag_name().name() {
            "fault" => Ok(MethodResponse::Fault(Self::decode_fault(body)?)),
            "params" => Self::decode_params(body)?
                .into_iter()
                .next()
                .map(MethodResponse::Success)
                .ok_or_else(|| ProtocolError::Format("empty <params> in response".to_string())),
            other => Err(ProtocolError::Format(format!(
                "unknown response element <{other}>"
            ))),
        }
    }

    /// Decodes a `<methodCall>` document, as a hub would receive it.
    pub fn decode_call(document: &str) -> Result<MethodCall, ProtocolError> {
        let doc = Document::parse(document)?;
        let root = doc.root_element();
        if root.tag_name().name() != "methodCall" {
            return Err(ProtocolError::Format(format!(
                "Call element is not <methodCall>: <{}>",
                root.tag_name().name()
            )));
        }

        let mut method_name = None;
        let mut params = Vec::new();
        for child in root.children().filter(Node::is_element) {
            match child.tag_name().name() {
                "methodName" => method_name = Some(text_content(child)?),
                "params" => params = Self::decode_params(child)?,
                other => {
                    return Err(ProtocolError::Format(format!(
                        "unexpected <{other}> in <methodCall>"
                    )))
                }
            }
        }

        let method_name = method_name
            .ok_or_else(|| ProtocolError::Format("no <methodName> in call".to_string()))?;
        Ok(MethodCall {
            method_name: method_name.trim().to_string(),
            params,
        })
    }
}

/// Characters allowed by the XML 1.0 `Char` production.
fn is_xml_char(c: char) -> bool {
    matches!(
        c,
        '\u{9}'
            | '\u{a}'
            | '\u{d}'
            | '\u{20}'..='\u{d7ff}'
            | '\u{e000}'..='\u{fffd}'
            | '\u{10000}'..='\u{10ffff}'
    )
}

fn check_text(text: &str, what: &str) -> Result<(), ProtocolError> {
    match text.chars().find(|c| !is_xml_char(*c)) {
        Some(bad) => Err(ProtocolError::Format(format!(
            "{what} holds non-XML character {bad:?}"
        ))),
        None => Ok(()),
    }
}

/// Element children of `node`; with `tag`, every child must carry that name.
fn element_children<'a, 'input>(
    node: Node<'a, 'input>,
    tag: Option<&str>,
) -> Result<Vec<Node<'a, 'input>>, ProtocolError> {
    let children: Vec<_> = node.children().filter(Node::is_element).collect();
    if let Some(tag) = tag {
        if let Some(bad) = children.iter().find(|c| c.tag_name().name() != tag) {
            return Err(ProtocolError::Format(format!(
                "Child <{}> of <{}> is not a <{tag}>",
                bad.tag_name().name(),
                node.tag_name().name()
            )));
        }
    }
    Ok(children)
}

fn sole_child<'a, 'input>(
    node: Node<'a, 'input>,
    tag: Option<&str>,
) -> Result<Node<'a, 'input>, ProtocolError> {
    match element_children(node, tag)?.as_slice() {
        [only] => Ok(*only),
        _ => Err(ProtocolError::Format(format!(
            "No sole child of <{}>",
            node.tag_name().name()
        ))),
    }
}

/// Concatenated text of `node`; element children are an error.
fn text_content(node: Node<'_, '_>) -> Result<String, ProtocolError> {
    let mut text = String::new();
    for child in node.children() {
        if child.is_element() {
            return Err(ProtocolError::Format(
                "Element found in text content".to_string(),
            ));
        }
        if child.is_text() {
            text.push_str(child.text().unwrap_or_default());
        }
    }
    Ok(text)
}
