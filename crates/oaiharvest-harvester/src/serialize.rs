//! Namespace-repairing replay of buffered payload events.
//!
//! A record's events are cut out of a larger document, so prefixes bound on
//! ancestors (typically the OAI default namespace on `<OAI-PMH>`) would be
//! lost. Each buffered start tag remembers which bindings its names need;
//! on replay any binding not already in the output scope is declared on the
//! element itself.

use quick_xml::Writer;
use quick_xml::events::{BytesStart, Event};

use crate::error::ExtractError;

/// One prefix binding. `prefix == None` is the default namespace, and an
/// empty `uri` means "no default namespace".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub prefix: Option<String>,
    pub uri: String,
}

/// A buffered payload event and the bindings its names resolve to in the
/// source document.
#[derive(Debug, Clone)]
pub struct PayloadEvent {
    event: Event<'static>,
    bindings: Vec<Binding>,
}

impl PayloadEvent {
    pub(crate) fn new(event: Event<'static>, bindings: Vec<Binding>) -> Self {
        Self { event, bindings }
    }

    pub fn event(&self) -> &Event<'static> {
        &self.event
    }

    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }
}

/// Stack of namespace declarations, one frame per open element.
#[derive(Debug, Default)]
pub(crate) struct NamespaceScope {
    frames: Vec<Vec<Binding>>,
}

impl NamespaceScope {
    pub(crate) fn push(&mut self, start: &BytesStart<'_>) {
        self.frames.push(declarations(start));
    }

    pub(crate) fn pop(&mut self) {
        self.frames.pop();
    }

    pub(crate) fn resolve(&self, prefix: Option<&str>) -> Option<&str> {
        self.frames
            .iter()
            .rev()
            .flat_map(|frame| frame.iter().rev())
            .find(|b| b.prefix.as_deref() == prefix)
            .map(|b| b.uri.as_str())
    }

    /// Bindings used by the element and attribute names of `start`.
    ///
    /// `start` must already be pushed. Prefixes with no binding in scope
    /// are skipped.
    pub(crate) fn required_bindings(&self, start: &BytesStart<'_>) -> Vec<Binding> {
        let mut needed: Vec<Binding> = Vec::new();
        let mut require = |prefix: Option<String>| {
            if needed.iter().any(|b| b.prefix == prefix) {
                return;
            }
            let uri = match (&prefix, self.resolve(prefix.as_deref())) {
                (_, Some(uri)) => uri.to_string(),
                (None, None) => String::new(),
                (Some(_), None) => return,
            };
            needed.push(Binding { prefix, uri });
        };

        require(prefix_of(start.name().as_ref()));
        for attr in start.attributes().with_checks(false).flatten() {
            let key = attr.key.as_ref();
            if is_declaration(key) {
                continue;
            }
            if let Some(prefix) = prefix_of(key) {
                if prefix != "xml" {
                    require(Some(prefix));
                }
            }
        }
        needed
    }
}

fn is_declaration(key: &[u8]) -> bool {
    key == b"xmlns" || key.starts_with(b"xmlns:")
}

fn prefix_of(qname: &[u8]) -> Option<String> {
    let colon = qname.iter().position(|&b| b == b':')?;
    Some(String::from_utf8_lossy(&qname[..colon]).into_owned())
}

/// `xmlns` / `xmlns:p` attributes declared directly on `start`.
fn declarations(start: &BytesStart<'_>) -> Vec<Binding> {
    start
        .attributes()
        .with_checks(false)
        .flatten()
        .filter_map(|attr| {
            let key = attr.key.as_ref();
            let prefix = if key == b"xmlns" {
                None
            } else {
                let rest = key.strip_prefix(b"xmlns:")?;
                Some(String::from_utf8_lossy(rest).into_owned())
            };
            let uri = attr
                .unescape_value()
                .map(|v| v.into_owned())
                .unwrap_or_else(|_| String::from_utf8_lossy(&attr.value).into_owned());
            Some(Binding { prefix, uri })
        })
        .collect()
}

/// Add declarations for bindings `start` needs that the output scope lacks.
fn repair(start: &BytesStart<'static>, needed: &[Binding], scope: &NamespaceScope) -> BytesStart<'static> {
    let own = declarations(start);
    let mut repaired = start.clone();
    let mut added: Vec<&Binding> = Vec::new();

    for binding in needed {
        let current = own
            .iter()
            .find(|b| b.prefix == binding.prefix)
            .map(|b| b.uri.as_str())
            .or_else(|| scope.resolve(binding.prefix.as_deref()));
        if current.unwrap_or("") == binding.uri || added.iter().any(|b| b.prefix == binding.prefix) {
            continue;
        }
        let key = match &binding.prefix {
            None => "xmlns".to_string(),
            Some(prefix) => format!("xmlns:{prefix}"),
        };
        repaired.push_attribute((key.as_str(), binding.uri.as_str()));
        added.push(binding);
    }
    repaired
}

/// Write buffered events back out as a standalone fragment.
pub fn serialize_payload(events: &[PayloadEvent]) -> Result<Vec<u8>, ExtractError> {
    let mut writer = Writer::new(Vec::with_capacity(events.len() * 32));
    let mut scope = NamespaceScope::default();

    for payload in events {
        let event = match &payload.event {
            Event::Start(start) => {
                let repaired = repair(start, &payload.bindings, &scope);
                scope.push(&repaired);
                Event::Start(repaired)
            }
            Event::Empty(start) => Event::Empty(repair(start, &payload.bindings, &scope)),
            Event::End(end) => {
                scope.pop();
                Event::End(end.clone())
            }
            other => other.clone(),
        };
        writer
            .write_event(event)
            .map_err(|e| ExtractError::Replay(e.to_string()))?;
    }
    Ok(writer.into_inner())
}
