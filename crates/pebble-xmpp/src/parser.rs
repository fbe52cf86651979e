//! Incremental framing of the XMPP XML stream.
//!
//! XMPP uses a single long-lived XML document per session, so the stream
//! cannot be handed to a document parser. [`XmlParser`] accumulates raw bytes
//! and cuts them into frames: the opening `<stream:stream>` tag, complete
//! top-level elements, and the closing `</stream:stream>`. Each complete
//! element is decoded with minidom only when its consumer asks for it.

use minidom::Element;

use crate::XmppError;

/// Namespace URIs used in XMPP
pub mod ns {
    /// XMPP client namespace
    pub const JABBER_CLIENT: &str = "jabber:client";
    /// XMPP streams namespace
    pub const STREAM: &str = "http://etherx.jabber.org/streams";
    /// Stream error condition namespace
    pub const STREAM_ERRORS: &str = "urn:ietf:params:xml:ns:xmpp-streams";
    /// STARTTLS namespace
    pub const TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
    /// SASL namespace
    pub const SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
    /// Resource binding namespace
    pub const BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";
    /// Stanza error namespace
    pub const STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";
}

/// Default upper bound for a single buffered top-level element.
pub const DEFAULT_MAX_STANZA_SIZE: usize = 256 * 1024;

/// Parsed stream header information.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamHeader {
    /// The 'to' attribute (target domain)
    pub to: Option<String>,
    /// The 'from' attribute
    pub from: Option<String>,
    /// The 'version' attribute (should be "1.0")
    pub version: Option<String>,
    /// The 'xml:lang' attribute
    pub lang: Option<String>,
}

impl StreamHeader {
    /// Parse a stream header from the raw opening tag.
    ///
    /// The tag is intentionally unclosed (the end tag arrives at session
    /// end), so attributes are read straight from the tag text.
    pub fn parse(tag: &str) -> Result<Self, XmppError> {
        if tag_name(tag).map(local_name) != Some("stream") {
            return Err(XmppError::decode("No stream:stream element found"));
        }

        Ok(StreamHeader {
            to: extract_attribute(tag, "to"),
            from: extract_attribute(tag, "from"),
            version: extract_attribute(tag, "version"),
            lang: extract_attribute(tag, "xml:lang"),
        })
    }

    /// Validate the stream header per RFC 6120.
    pub fn validate(&self) -> Result<(), XmppError> {
        if let Some(ref version) = self.version {
            if version != "1.0" {
                return Err(XmppError::UnsupportedVersion(version.clone()));
            }
        }
        Ok(())
    }
}

/// Extract an attribute value from an XML tag string.
fn extract_attribute(tag: &str, name: &str) -> Option<String> {
    for quote in ['"', '\''] {
        let pattern = format!(" {}={}", name, quote);
        if let Some(start) = tag.find(&pattern) {
            let value_start = start + pattern.len();
            if let Some(value_end) = tag[value_start..].find(quote) {
                return Some(unescape(&tag[value_start..value_start + value_end]));
            }
        }
    }
    None
}

/// Qualified name of the tag starting at `tag[0] == '<'`.
fn tag_name(tag: &str) -> Option<&str> {
    let rest = tag.strip_prefix('<')?.trim_start_matches('/');
    let end = rest
        .find(|c: char| c.is_whitespace() || c == '>' || c == '/')
        .unwrap_or(rest.len());
    if end == 0 {
        None
    } else {
        Some(&rest[..end])
    }
}

/// Strip a namespace prefix from a qualified name.
fn local_name(qname: &str) -> &str {
    qname.rsplit(':').next().unwrap_or(qname)
}

/// One complete top-level element, not yet decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopLevel {
    name: String,
    xml: String,
}

impl TopLevel {
    /// Local name of the element (`message`, `presence`, `starttls`, ...).
    pub fn name(&self) -> &str {
        local_name(&self.name)
    }

    /// Raw XML text of the element.
    pub fn as_xml(&self) -> &str {
        &self.xml
    }

    /// Decode the element into a minidom tree.
    ///
    /// Stanzas inherit `jabber:client` from the stream; the default
    /// namespace is declared explicitly when the element omits it so the
    /// fragment stands alone.
    pub fn to_element(&self) -> Result<Element, XmppError> {
        let start_tag_end = find_tag_end(self.xml.as_bytes(), 0)
            .ok_or_else(|| XmppError::decode("Incomplete element"))?;
        let start_tag = &self.xml[..start_tag_end];

        let standalone = if extract_attribute(start_tag, "xmlns").is_some() {
            self.xml.clone()
        } else {
            let insert_at = 1 + self.name.len();
            format!(
                "{} xmlns='{}'{}",
                &self.xml[..insert_at],
                ns::JABBER_CLIENT,
                &self.xml[insert_at..]
            )
        };

        standalone
            .parse::<Element>()
            .map_err(|e| XmppError::decode(format!("Failed to parse <{}>: {}", self.name(), e)))
    }
}

/// A unit of the XML stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Opening `<stream:stream>` tag
    StreamOpen(StreamHeader),
    /// Complete top-level element
    Element(TopLevel),
    /// Closing `</stream:stream>` tag
    StreamClose,
}

/// Incremental XML framer for XMPP streams.
pub struct XmlParser {
    /// Accumulated data buffer
    buffer: Vec<u8>,
    /// Upper bound for one buffered top-level element
    max_stanza_size: usize,
}

impl XmlParser {
    /// Create a new parser with the default stanza size limit.
    pub fn new() -> Self {
        Self::with_max_stanza_size(DEFAULT_MAX_STANZA_SIZE)
    }

    /// Create a new parser with a custom stanza size limit.
    pub fn with_max_stanza_size(max_stanza_size: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(8192),
            max_stanza_size,
        }
    }

    /// Feed data into the parser.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Cut the next frame from the buffer.
    ///
    /// Returns `Ok(None)` when more data is needed. Whitespace between
    /// top-level elements (keepalives) and XML declarations are skipped.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, XmppError> {
        loop {
            let skip = self
                .buffer
                .iter()
                .take_while(|b| b.is_ascii_whitespace())
                .count();
            self.buffer.drain(..skip);

            let Some(&first) = self.buffer.first() else {
                return Ok(None);
            };

            if first != b'<' {
                return Err(XmppError::decode("Character data at stream level"));
            }

            match self.buffer.get(1) {
                None => return Ok(None),
                Some(b'?') => {
                    let Some(end) = find_subslice(&self.buffer, b"?>") else {
                        return self.need_more();
                    };
                    self.buffer.drain(..end + 2);
                    continue;
                }
                Some(b'!') => {
                    return Err(XmppError::decode(
                        "Comments, DTDs and CDATA are not allowed at stream level",
                    ));
                }
                Some(b'/') => {
                    let Some(end) = find_tag_end(&self.buffer, 0) else {
                        return self.need_more();
                    };
                    let tag = self.take_text(end)?;
                    return match tag_name(&tag).map(local_name) {
                        Some("stream") => Ok(Some(Frame::StreamClose)),
                        _ => Err(XmppError::decode(format!("Unbalanced end tag {}", tag))),
                    };
                }
                Some(_) => {}
            }

            let Some(start_end) = find_tag_end(&self.buffer, 0) else {
                return self.need_more();
            };

            let is_stream_open = {
                let head = String::from_utf8_lossy(&self.buffer[..start_end]);
                tag_name(&head).map(local_name) == Some("stream")
            };

            if is_stream_open {
                let tag = self.take_text(start_end)?;
                return Ok(Some(Frame::StreamOpen(StreamHeader::parse(&tag)?)));
            }

            let Some(end) = find_element_end(&self.buffer, start_end)? else {
                return self.need_more();
            };

            let xml = self.take_text(end)?;
            let name = tag_name(&xml)
                .ok_or_else(|| XmppError::decode("Element without a name"))?
                .to_string();
            return Ok(Some(Frame::Element(TopLevel { name, xml })));
        }
    }

    fn need_more(&self) -> Result<Option<Frame>, XmppError> {
        if self.buffer.len() > self.max_stanza_size {
            return Err(XmppError::StanzaTooLarge {
                limit: self.max_stanza_size,
            });
        }
        Ok(None)
    }

    fn take_text(&mut self, end: usize) -> Result<String, XmppError> {
        let bytes: Vec<u8> = self.buffer.drain(..end).collect();
        String::from_utf8(bytes).map_err(|e| XmppError::decode(format!("Invalid UTF-8: {}", e)))
    }
}

impl Default for XmlParser {
    fn default() -> Self {
        Self::new()
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Position just past the `>` closing the tag that starts at `start`,
/// skipping any `>` inside quoted attribute values.
fn find_tag_end(data: &[u8], start: usize) -> Option<usize> {
    let mut quote: Option<u8> = None;
    for (i, &b) in data.iter().enumerate().skip(start + 1) {
        match quote {
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if b == b'"' || b == b'\'' => quote = Some(b),
            None if b == b'>' => return Some(i + 1),
            None => {}
        }
    }
    None
}

/// Position just past the end of the element whose start tag ends at
/// `start_end`, or `None` when the element is still incomplete.
fn find_element_end(data: &[u8], start_end: usize) -> Result<Option<usize>, XmppError> {
    if data[start_end - 2] == b'/' {
        return Ok(Some(start_end));
    }

    let mut depth = 1usize;
    let mut pos = start_end;

    while depth > 0 {
        let Some(offset) = data[pos..].iter().position(|&b| b == b'<') else {
            return Ok(None);
        };
        let open = pos + offset;

        match data.get(open + 1) {
            None => return Ok(None),
            Some(b'!') => {
                let (terminator, skip): (&[u8], usize) = if data[open..].starts_with(b"<![CDATA[") {
                    (b"]]>", 3)
                } else if data[open..].starts_with(b"<!--") {
                    (b"-->", 3)
                } else if data.len() - open < 9 {
                    return Ok(None);
                } else {
                    return Err(XmppError::decode("DTD declarations are not allowed"));
                };
                let Some(end) = find_subslice(&data[open..], terminator) else {
                    return Ok(None);
                };
                pos = open + end + skip;
            }
            Some(b'?') => {
                let Some(end) = find_subslice(&data[open..], b"?>") else {
                    return Ok(None);
                };
                pos = open + end + 2;
            }
            Some(b'/') => {
                let Some(end) = find_tag_end(data, open) else {
                    return Ok(None);
                };
                depth -= 1;
                pos = end;
            }
            Some(_) => {
                let Some(end) = find_tag_end(data, open) else {
                    return Ok(None);
                };
                if data[end - 2] != b'/' {
                    depth += 1;
                }
                pos = end;
            }
        }
    }

    Ok(Some(pos))
}

/// Escape text for use in XML character data or attribute values.
pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\'' => out.push_str("&apos;"),
            '"' => out.push_str("&quot;"),
            c => out.push(c),
        }
    }
    out
}

fn unescape(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&apos;", "'")
        .replace("&quot;", "\"")
        .replace("&amp;", "&")
}

/// Convert a minidom Element back to an XML string.
pub fn element_to_string(element: &Element) -> Result<String, XmppError> {
    let mut output = Vec::new();
    element
        .write_to(&mut output)
        .map_err(|e| XmppError::decode(format!("Failed to serialize element: {}", e)))?;
    String::from_utf8(output).map_err(|e| XmppError::decode(format!("Invalid UTF-8: {}", e)))
}
