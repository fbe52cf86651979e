//! Stanzas exchanged after stream negotiation.
//!
//! Decoding and encoding go through `xmpp-parsers`. A client element is
//! first trimmed to what routing actually uses: presence addressing is
//! discarded since the router re-addresses every copy, and message
//! attributes that do not parse are dropped instead of failing the stream.

use std::str::FromStr;

use jid::Jid;
use minidom::Element;
use xmpp_parsers::bind::BindQuery;
use xmpp_parsers::iq::{Iq, IqType};
use xmpp_parsers::message::Message;
use xmpp_parsers::presence::Presence;
use xmpp_parsers::stanza_error::{DefinedCondition, ErrorType, StanzaError};

use crate::parser::element_to_string;
use crate::XmppError;

/// Values of the message `type` attribute (RFC 6121 Section 5.2.2).
const MESSAGE_TYPES: [&str; 5] = ["chat", "error", "groupchat", "headline", "normal"];

/// A decoded stanza.
#[derive(Debug, Clone)]
pub enum Stanza {
    Message(Message),
    Presence(Presence),
    Iq(Iq),
}

impl Stanza {
    /// Get the stanza type name for tracing.
    pub fn name(&self) -> &'static str {
        match self {
            Stanza::Message(_) => "message",
            Stanza::Presence(_) => "presence",
            Stanza::Iq(_) => "iq",
        }
    }

    /// Sender address, if present.
    pub fn from(&self) -> Option<&Jid> {
        match self {
            Stanza::Message(m) => m.from.as_ref(),
            Stanza::Presence(p) => p.from.as_ref(),
            Stanza::Iq(iq) => iq.from.as_ref(),
        }
    }

    /// Recipient address, if present.
    pub fn to(&self) -> Option<&Jid> {
        match self {
            Stanza::Message(m) => m.to.as_ref(),
            Stanza::Presence(p) => p.to.as_ref(),
            Stanza::Iq(iq) => iq.to.as_ref(),
        }
    }

    /// Serialize to XML.
    pub fn to_xml(&self) -> Result<String, XmppError> {
        let element: Element = match self {
            Stanza::Message(m) => m.clone().into(),
            Stanza::Presence(p) => p.clone().into(),
            Stanza::Iq(iq) => iq.clone().into(),
        };
        element_to_string(&element)
    }
}

impl From<Message> for Stanza {
    fn from(message: Message) -> Self {
        Stanza::Message(message)
    }
}

impl From<Presence> for Stanza {
    fn from(presence: Presence) -> Self {
        Stanza::Presence(presence)
    }
}

impl From<Iq> for Stanza {
    fn from(iq: Iq) -> Self {
        Stanza::Iq(iq)
    }
}

/// Decode a client `<message/>`.
///
/// An unknown `type` is treated as `normal`. A `from` or `to` that is not a
/// valid address is dropped; without `to` the message is undeliverable.
pub fn decode_message(element: Element) -> Result<Message, XmppError> {
    let element = retain_attrs(element, |name, value| match name {
        "type" => MESSAGE_TYPES.contains(&value),
        "from" | "to" => Jid::from_str(value).is_ok(),
        _ => true,
    });
    Message::try_from(element).map_err(|e| XmppError::decode(format!("Invalid message: {:?}", e)))
}

/// Decode a client `<presence/>`, discarding its `from` and `to`.
pub fn decode_presence(element: Element) -> Result<Presence, XmppError> {
    let element = retain_attrs(element, |name, _| name != "from" && name != "to");
    Presence::try_from(element).map_err(|e| XmppError::decode(format!("Invalid presence: {:?}", e)))
}

/// Decode a client `<iq/>`.
pub fn decode_iq(element: Element) -> Result<Iq, XmppError> {
    Iq::try_from(element).map_err(|e| XmppError::decode(format!("Invalid iq: {:?}", e)))
}

/// Copy of `presence` addressed from `from` to `to`.
pub fn readdressed(presence: &Presence, from: Jid, to: Jid) -> Presence {
    let mut copy = presence.clone();
    copy.from = Some(from);
    copy.to = Some(to);
    copy
}

/// The resource binding request carried by `iq` (RFC 6120 Section 7).
pub fn bind_request(iq: &Iq) -> Result<BindQuery, XmppError> {
    match &iq.payload {
        IqType::Set(payload) => BindQuery::try_from(payload.clone())
            .map_err(|e| XmppError::bind(format!("Invalid bind request: {:?}", e))),
        _ => Err(XmppError::bind("Bind request must be an <iq type='set'/>")),
    }
}

/// Whether `iq` expects a reply.
pub fn is_request(iq: &Iq) -> bool {
    matches!(iq.payload, IqType::Get(_) | IqType::Set(_))
}

/// `service-unavailable` reply to an iq request nobody handles.
pub fn service_unavailable(request: &Iq) -> Iq {
    let error = StanzaError::new(
        ErrorType::Cancel,
        DefinedCondition::ServiceUnavailable,
        "en",
        "",
    );

    Iq {
        from: request.to.clone(),
        to: request.from.clone(),
        id: request.id.clone(),
        payload: IqType::Error(error),
    }
}

/// Rebuild `element` keeping only the attributes `keep` accepts.
fn retain_attrs(element: Element, keep: impl Fn(&str, &str) -> bool) -> Element {
    if element.attrs().all(|(name, value)| keep(name, value)) {
        return element;
    }

    let mut builder = Element::builder(element.name(), element.ns());
    for (name, value) in element.attrs().filter(|(name, value)| keep(name, value)) {
        builder = builder.attr(name, value);
    }
    builder.append_all(element.nodes().cloned()).build()
}
