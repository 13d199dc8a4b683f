//! Stanza model for the upstream presence protocol (XMPP).
//!
//! Stanzas are kept as a small element tree: the hub builds outgoing
//! presence/iq stanzas from typed parts, and inbound stanzas arrive already
//! parsed from the upstream transport. The tree serializes with serde so a
//! stanza can ride the tab<->hub link verbatim inside a JSON envelope, and
//! renders to XML text for the upstream wire.
//!
//! The namespace and attribute names in [`ns`] are fixed interop contracts
//! with external servers and must be reproduced exactly.

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

/// Fixed interop namespaces.
pub mod ns {
    /// Item/avatar attributes on a room presence.
    pub const VP_PROPS: &str = "vp:props";
    /// Nested dependent-item presences.
    pub const VP_DEPENDENT: &str = "vp:dependent";
    /// Avatar position state.
    pub const AVATAR_STATE: &str = "firebat:avatar:state";
    /// Identity token reference.
    pub const USER_IDENTITY: &str = "firebat:user:identity";
    /// Software version queries.
    pub const IQ_VERSION: &str = "jabber:iq:version";
}

/// Presence error code signalling a nickname conflict.
pub const CONFLICT_CODE: u16 = 409;

/// One child slot: nested element or character data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Node {
    Element(Element),
    Text(String),
}

/// An XML element: name, attributes in document order, children.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element {
    pub name: String,
    #[serde(default)]
    pub attrs: Vec<(String, String)>,
    #[serde(default)]
    pub children: Vec<Node>,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attrs: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.push((key.into(), value.into()));
        self
    }

    pub fn child(mut self, el: Element) -> Self {
        self.children.push(Node::Element(el));
        self
    }

    pub fn text(mut self, s: impl Into<String>) -> Self {
        self.children.push(Node::Text(s.into()));
        self
    }

    pub fn get_attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// First child element with the given name.
    pub fn find_child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find_map(|n| match n {
            Node::Element(el) if el.name == name => Some(el),
            _ => None,
        })
    }

    /// First child element with the given name and `xmlns` attribute.
    pub fn find_child_ns(&self, name: &str, xmlns: &str) -> Option<&Element> {
        self.children.iter().find_map(|n| match n {
            Node::Element(el) if el.name == name && el.get_attr("xmlns") == Some(xmlns) => {
                Some(el)
            }
            _ => None,
        })
    }

    /// Concatenated direct character data.
    pub fn inner_text(&self) -> String {
        let mut out = String::new();
        for n in &self.children {
            if let Node::Text(t) = n {
                out.push_str(t);
            }
        }
        out
    }

    // ---- stanza accessors ----

    pub fn is_presence(&self) -> bool {
        self.name == "presence"
    }

    pub fn is_iq(&self) -> bool {
        self.name == "iq"
    }

    /// The `type` attribute; absent on presence means "available".
    pub fn stanza_type(&self) -> Option<&str> {
        self.get_attr("type")
    }

    pub fn from_jid(&self) -> Option<&str> {
        self.get_attr("from")
    }

    pub fn to_jid(&self) -> Option<&str> {
        self.get_attr("to")
    }

    /// Error code from an `<error code="..."/>` child, if any.
    pub fn error_code(&self) -> Option<u16> {
        self.find_child("error")
            .and_then(|e| e.get_attr("code"))
            .and_then(|c| c.parse().ok())
    }

    pub fn is_conflict_error(&self) -> bool {
        self.stanza_type() == Some("error") && self.error_code() == Some(CONFLICT_CODE)
    }

    /// Render to XML text with escaping. Infallible by construction; used for
    /// the upstream wire and for log lines.
    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        self.render(&mut out);
        out
    }

    fn render(&self, out: &mut String) {
        let _ = write!(out, "<{}", self.name);
        for (k, v) in &self.attrs {
            let _ = write!(out, " {}=\"{}\"", k, escape(v, true));
        }
        if self.children.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        for n in &self.children {
            match n {
                Node::Element(el) => el.render(out),
                Node::Text(t) => out.push_str(&escape(t, false)),
            }
        }
        let _ = write!(out, "</{}>", self.name);
    }
}

fn escape(s: &str, attr: bool) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' if attr => out.push_str("&quot;"),
            '\'' if attr => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

// ---- JID helpers ----

/// Strip the resource part: `room@muc.example/alice` -> `room@muc.example`.
pub fn bare_jid(jid: &str) -> &str {
    jid.split('/').next().unwrap_or(jid)
}

/// Resource part of a full JID, if present.
pub fn jid_resource(jid: &str) -> Option<&str> {
    jid.split_once('/').map(|(_, r)| r)
}

// ---- stanza constructors ----

/// Available presence addressed to a full room JID (`room@host/nick`).
pub fn presence_to(full_jid: &str) -> Element {
    Element::new("presence").attr("to", full_jid)
}

/// Unavailable presence addressed to a full room JID.
pub fn presence_unavailable(full_jid: &str) -> Element {
    Element::new("presence")
        .attr("to", full_jid)
        .attr("type", "unavailable")
}

/// Self-announcement with no destination ("connection presence"). Dropped
/// rather than queued when the upstream connection is down.
pub fn connection_presence() -> Element {
    Element::new("presence")
}

/// `iq` result answering a `jabber:iq:version` query.
pub fn iq_version_result(to: &str, id: &str, name: &str, version: &str) -> Element {
    Element::new("iq")
        .attr("type", "result")
        .attr("to", to)
        .attr("id", id)
        .child(
            Element::new("query")
                .attr("xmlns", ns::IQ_VERSION)
                .child(Element::new("name").text(name))
                .child(Element::new("version").text(version)),
        )
}
