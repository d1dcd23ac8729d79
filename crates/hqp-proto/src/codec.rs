//! Request/response framing for the control port.
//!
//! Every message is a single XML element. Requests are written as an XML
//! declaration followed by one empty element and a newline:
//!
//! ```text
//!   <?xml version="1.0" encoding="UTF-8"?><Volume value="-20"/>\n
//! ```
//!
//! Replies arrive the same way but may be split across several socket reads,
//! so [`decode`] works on an accumulating buffer and reports how many bytes
//! a complete element consumed. Framing is done by a small quote-aware
//! scanner; the framed bytes are then handed to `quick-xml`.
use std::io::Cursor;

use quick_xml::events::{BytesStart, Event};
use quick_xml::{Reader, Writer};
use thiserror::Error;

use crate::error::ControlError;
use crate::status::VolumeDb;

pub const XML_DECLARATION: &str = r#"<?xml version="1.0" encoding="UTF-8"?>"#;

/// Upper bound on a single reply.  A buffer that grows past this without
/// yielding a complete element is treated as garbage.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Commands understood by the control port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Status,
    Volume { value: VolumeDb },
    /// Relative volume change carried in one element so the daemon applies it
    /// atomically.  The step travels as a `value` attribute; a daemon that
    /// ignores the attribute moves by its own fixed step instead.
    VolumeUp { step: VolumeDb },
    VolumeDown { step: VolumeDb },
    VolumeRange,
    Play,
    Pause,
    Stop,
    Next,
    Previous,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Status => "Status",
            Command::Volume { .. } => "Volume",
            Command::VolumeUp { .. } => "VolumeUp",
            Command::VolumeDown { .. } => "VolumeDown",
            Command::VolumeRange => "VolumeRange",
            Command::Play => "Play",
            Command::Pause => "Pause",
            Command::Stop => "Stop",
            Command::Next => "Next",
            Command::Previous => "Previous",
        }
    }

    pub fn params(&self) -> Vec<(&'static str, String)> {
        match self {
            Command::Volume { value } => vec![("value", value.to_string())],
            Command::VolumeUp { step } | Command::VolumeDown { step } => {
                vec![("value", step.to_string())]
            }
            _ => Vec::new(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ControlError> {
        let params = self.params();
        let borrowed: Vec<(&str, &str)> = params.iter().map(|(k, v)| (*k, v.as_str())).collect();
        encode(self.name(), &borrowed)
    }
}

/// A decoded element: tag, attributes in document order, text and children.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Element {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub text: String,
    pub children: Vec<Element>,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// `Some(Ok(()))` for `result="OK"`, `Some(Err(reason))` for any other
    /// `result` value, `None` when the element carries no result at all.
    pub fn result(&self) -> Option<Result<(), String>> {
        let result = self.attr("result")?;
        if result.eq_ignore_ascii_case("OK") {
            Some(Ok(()))
        } else if self.text.trim().is_empty() {
            Some(Err(result.to_string()))
        } else {
            Some(Err(self.text.trim().to_string()))
        }
    }
}

/// A reply that could not be framed or parsed.  The offending bytes are kept
/// for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}")]
pub struct ParseError {
    pub reason: String,
    pub raw: Vec<u8>,
}

impl ParseError {
    pub fn new(reason: impl Into<String>, raw: Vec<u8>) -> Self {
        Self {
            reason: reason.into(),
            raw,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A complete element and the number of buffer bytes it used (including
    /// any leading declaration and trailing whitespace).
    Complete { element: Element, consumed: usize },
    NeedMoreData,
}

/// Encode one request element.  `command` must be a plain XML name.
pub fn encode(command: &str, params: &[(&str, &str)]) -> Result<Vec<u8>, ControlError> {
    if !is_xml_name(command) {
        return Err(ControlError::invalid_argument(format!(
            "unknown command {command:?}"
        )));
    }
    if let Some((key, _)) = params.iter().find(|(k, _)| !is_xml_name(k)) {
        return Err(ControlError::invalid_argument(format!(
            "invalid parameter name {key:?} for {command}"
        )));
    }

    let mut elem = BytesStart::new(command);
    for (key, value) in params {
        elem.push_attribute((*key, *value));
    }

    let mut writer = Writer::new(Cursor::new(Vec::new()));
    writer
        .write_event(Event::Empty(elem))
        .map_err(|e| ControlError::invalid_argument(format!("cannot encode {command}: {e}")))?;
    let body = writer.into_inner().into_inner();

    let mut out = Vec::with_capacity(XML_DECLARATION.len() + body.len() + 1);
    out.extend_from_slice(XML_DECLARATION.as_bytes());
    out.extend_from_slice(&body);
    out.push(b'\n');
    Ok(out)
}

/// Try to decode one element from the front of `buf`.
pub fn decode(buf: &[u8]) -> Result<Decoded, ParseError> {
    let (start, end) = match frame(buf) {
        Ok(Some(span)) => span,
        Ok(None) if buf.len() > MAX_FRAME_LEN => {
            return Err(ParseError::new(
                format!("no complete element within {MAX_FRAME_LEN} bytes"),
                buf.to_vec(),
            ))
        }
        Ok(None) => return Ok(Decoded::NeedMoreData),
        Err(reason) => return Err(ParseError::new(reason, buf.to_vec())),
    };

    let raw = &buf[start..end];
    let text = std::str::from_utf8(raw)
        .map_err(|e| ParseError::new(format!("reply is not UTF-8: {e}"), raw.to_vec()))?;
    let element = parse_element(text).map_err(|reason| ParseError::new(reason, raw.to_vec()))?;

    let consumed = end + buf[end..].iter().take_while(|b| b.is_ascii_whitespace()).count();
    Ok(Decoded::Complete { element, consumed })
}

// ── framing ───────────────────────────────────────────────────────────────────

/// Locate the root element.  `Ok(None)` means the buffer ends before the
/// root element does.
fn frame(buf: &[u8]) -> Result<Option<(usize, usize)>, String> {
    let mut pos = skip_prolog_whitespace(buf, 0);

    // Declarations, processing instructions and comments ahead of the root.
    let root_start = loop {
        if pos >= buf.len() {
            return Ok(None);
        }
        if buf[pos] != b'<' {
            return Err(format!("unexpected byte 0x{:02x} before root element", buf[pos]));
        }
        match markup_end(buf, pos)? {
            Markup::Incomplete => return Ok(None),
            Markup::Skip(next) => pos = skip_prolog_whitespace(buf, next),
            Markup::EndTag(_) => return Err("closing tag before root element".to_string()),
            Markup::StartTag { .. } => break pos,
        }
    };

    let mut depth = 0usize;
    pos = root_start;
    loop {
        match markup_end(buf, pos)? {
            Markup::Incomplete => return Ok(None),
            Markup::Skip(next) => pos = next,
            Markup::EndTag(next) => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| "unbalanced closing tag".to_string())?;
                pos = next;
                if depth == 0 {
                    return Ok(Some((root_start, pos)));
                }
            }
            Markup::StartTag { next, self_closing } => {
                pos = next;
                if self_closing {
                    if depth == 0 {
                        return Ok(Some((root_start, pos)));
                    }
                } else {
                    depth += 1;
                }
            }
        }
        // Text content up to the next tag.
        match buf[pos..].iter().position(|&b| b == b'<') {
            Some(offset) => pos += offset,
            None => return Ok(None),
        }
    }
}

enum Markup {
    Incomplete,
    /// Declaration, PI, comment or CDATA; resume scanning at the index.
    Skip(usize),
    EndTag(usize),
    StartTag { next: usize, self_closing: bool },
}

fn markup_end(buf: &[u8], pos: usize) -> Result<Markup, String> {
    let rest = &buf[pos..];
    if rest.len() < 2 {
        return Ok(Markup::Incomplete);
    }
    let delimited = |open: &[u8], close: &[u8]| -> Markup {
        if rest.len() < open.len() {
            return Markup::Incomplete;
        }
        match find(&rest[open.len()..], close) {
            Some(i) => Markup::Skip(pos + open.len() + i + close.len()),
            None => Markup::Incomplete,
        }
    };

    match rest[1] {
        b'?' => Ok(delimited(b"<?", b"?>")),
        b'!' => {
            if b"<!--".starts_with(&rest[..rest.len().min(4)]) {
                Ok(delimited(b"<!--", b"-->"))
            } else if b"<![CDATA[".starts_with(&rest[..rest.len().min(9)]) {
                Ok(delimited(b"<![CDATA[", b"]]>"))
            } else {
                Err("unsupported markup declaration".to_string())
            }
        }
        b'/' => match rest.iter().position(|&b| b == b'>') {
            Some(i) => Ok(Markup::EndTag(pos + i + 1)),
            None => Ok(Markup::Incomplete),
        },
        b if b.is_ascii_alphabetic() || b == b'_' => {
            let mut quote: Option<u8> = None;
            for (i, &b) in rest.iter().enumerate().skip(1) {
                match quote {
                    Some(q) if b == q => quote = None,
                    Some(_) => {}
                    None if b == b'"' || b == b'\'' => quote = Some(b),
                    None if b == b'<' => return Err("'<' inside a tag".to_string()),
                    None if b == b'>' => {
                        return Ok(Markup::StartTag {
                            next: pos + i + 1,
                            self_closing: rest[i - 1] == b'/',
                        })
                    }
                    None => {}
                }
            }
            Ok(Markup::Incomplete)
        }
        other => Err(format!("invalid tag start 0x{other:02x}")),
    }
}

fn skip_prolog_whitespace(buf: &[u8], mut pos: usize) -> usize {
    if buf[pos..].starts_with(&[0xEF, 0xBB, 0xBF]) {
        pos += 3;
    }
    pos + buf[pos..].iter().take_while(|b| b.is_ascii_whitespace()).count()
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn is_xml_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
}

// ── parsing ───────────────────────────────────────────────────────────────────

fn parse_element(xml: &str) -> Result<Element, String> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<Element> = Vec::new();
    loop {
        match reader.read_event() {
            Ok(Event::Start(start)) => stack.push(element_from_start(&start)?),
            Ok(Event::Empty(start)) => {
                let element = element_from_start(&start)?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(element),
                    None => return Ok(element),
                }
            }
            Ok(Event::End(_)) => {
                let element = stack
                    .pop()
                    .ok_or_else(|| "unbalanced closing tag".to_string())?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(element),
                    None => return Ok(element),
                }
            }
            Ok(Event::Text(text)) => {
                if let Some(current) = stack.last_mut() {
                    let raw = std::str::from_utf8(&text).map_err(|e| e.to_string())?;
                    let unescaped = quick_xml::escape::unescape(raw).map_err(|e| e.to_string())?;
                    current.text.push_str(&unescaped);
                }
            }
            Ok(Event::CData(data)) => {
                if let Some(current) = stack.last_mut() {
                    current
                        .text
                        .push_str(std::str::from_utf8(&data).map_err(|e| e.to_string())?);
                }
            }
            Ok(Event::GeneralRef(reference)) => {
                if let Some(current) = stack.last_mut() {
                    let name = std::str::from_utf8(&reference).map_err(|e| e.to_string())?;
                    current.text.push_str(&resolve_reference(name)?);
                }
            }
            Ok(Event::Eof) => return Err("element ended unexpectedly".to_string()),
            Ok(_) => {}
            Err(e) => return Err(e.to_string()),
        }
    }
}

fn element_from_start(start: &BytesStart<'_>) -> Result<Element, String> {
    let name = std::str::from_utf8(start.name().as_ref())
        .map_err(|e| e.to_string())?
        .to_string();
    let mut attributes = Vec::new();
    for attr in start.attributes() {
        let attr = attr.map_err(|e| format!("bad attribute in <{name}>: {e}"))?;
        let key = std::str::from_utf8(attr.key.as_ref()).map_err(|e| e.to_string())?;
        let value = std::str::from_utf8(&attr.value).map_err(|e| e.to_string())?;
        let value = quick_xml::escape::unescape(value).map_err(|e| e.to_string())?;
        attributes.push((key.to_string(), value.into_owned()));
    }
    Ok(Element {
        name,
        attributes,
        ..Default::default()
    })
}

fn resolve_reference(name: &str) -> Result<String, String> {
    if let Some(code) = name.strip_prefix('#') {
        let value = match code.strip_prefix('x') {
            Some(hex) => u32::from_str_radix(hex, 16),
            None => code.parse::<u32>(),
        }
        .map_err(|_| format!("bad character reference &{name};"))?;
        return char::from_u32(value)
            .map(String::from)
            .ok_or_else(|| format!("bad character reference &{name};"));
    }
    quick_xml::escape::resolve_predefined_entity(name)
        .map(str::to_string)
        .ok_or_else(|| format!("unknown entity &{name};"))
}
