//! Streaming record extraction.
//!
//! [`RecordExtractor`] is fed parse events one at a time and emits each
//! record as soon as its container element closes. Field handling is
//! delegated to [`RecordHooks`], a set of closures chosen at construction.

use quick_xml::events::{BytesStart, Event};

use crate::error::{ExtractError, HarvestError};
use crate::record::{HarvestedRecord, STATUS_DELETED};
use crate::serialize::{NamespaceScope, PayloadEvent, serialize_payload};

pub type CreateRecordFn = Box<dyn FnMut(&BytesStart<'_>) -> HarvestedRecord + Send>;
pub type FieldFn = Box<dyn FnMut(&mut HarvestedRecord, &str) + Send>;
pub type RecordEndFn =
    Box<dyn FnMut(&mut HarvestedRecord, &[PayloadEvent]) -> Result<(), ExtractError> + Send>;

/// Callbacks that build a [`HarvestedRecord`] while its element is parsed.
pub struct RecordHooks {
    create_record: CreateRecordFn,
    on_identifier: FieldFn,
    on_datestamp: FieldFn,
    on_set: FieldFn,
    on_status: FieldFn,
    on_record_end: RecordEndFn,
}

impl RecordHooks {
    /// Default hooks: fill the record fields and finalize with
    /// [`finalize_record`]. Every record gets `base_url`.
    pub fn for_base_url(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        Self {
            create_record: Box::new(move |_: &BytesStart<'_>| HarvestedRecord::new(base_url.clone())),
            on_identifier: Box::new(|record: &mut HarvestedRecord, value: &str| {
                record.identifier = value.to_string();
            }),
            on_datestamp: Box::new(|record: &mut HarvestedRecord, value: &str| {
                record.datestamp = value.to_string();
            }),
            on_set: Box::new(|record: &mut HarvestedRecord, value: &str| record.add_set(value)),
            on_status: Box::new(|record: &mut HarvestedRecord, value: &str| {
                record.deleted = value == STATUS_DELETED;
            }),
            on_record_end: Box::new(finalize_record),
        }
    }

    pub fn with_create_record(
        mut self,
        f: impl FnMut(&BytesStart<'_>) -> HarvestedRecord + Send + 'static,
    ) -> Self {
        self.create_record = Box::new(f);
        self
    }

    pub fn with_on_identifier(mut self, f: impl FnMut(&mut HarvestedRecord, &str) + Send + 'static) -> Self {
        self.on_identifier = Box::new(f);
        self
    }

    pub fn with_on_datestamp(mut self, f: impl FnMut(&mut HarvestedRecord, &str) + Send + 'static) -> Self {
        self.on_datestamp = Box::new(f);
        self
    }

    pub fn with_on_set(mut self, f: impl FnMut(&mut HarvestedRecord, &str) + Send + 'static) -> Self {
        self.on_set = Box::new(f);
        self
    }

    pub fn with_on_status(mut self, f: impl FnMut(&mut HarvestedRecord, &str) + Send + 'static) -> Self {
        self.on_status = Box::new(f);
        self
    }

    pub fn with_on_record_end(
        mut self,
        f: impl FnMut(&mut HarvestedRecord, &[PayloadEvent]) -> Result<(), ExtractError> + Send + 'static,
    ) -> Self {
        self.on_record_end = Box::new(f);
        self
    }
}

impl Default for RecordHooks {
    fn default() -> Self {
        Self::for_base_url("")
    }
}

/// Default record-end hook: replay the payload, digest it and compress it.
pub fn finalize_record(record: &mut HarvestedRecord, payload: &[PayloadEvent]) -> Result<(), ExtractError> {
    let bytes = serialize_payload(payload)?;
    log::trace!("{}: {}", record.identifier, String::from_utf8_lossy(&bytes));
    record.set_content(&bytes).map_err(ExtractError::Compress)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeaderField {
    Identifier,
    Datestamp,
    SetSpec,
}

/// A record whose container element is still open.
struct OpenRecord {
    record: HarvestedRecord,
    payload: Vec<PayloadEvent>,
    /// `<header>` is itself the container (ListIdentifiers).
    header_container: bool,
    /// Local names of open elements below the container.
    path: Vec<Vec<u8>>,
    field: Option<(HeaderField, String)>,
}

impl OpenRecord {
    fn at_header(&self) -> bool {
        if self.header_container {
            self.path.is_empty()
        } else {
            self.path.len() == 1 && self.path[0] == b"header"
        }
    }

    /// Header field for the innermost open element, if it is one.
    fn header_field(&self) -> Option<HeaderField> {
        let header_child = if self.header_container {
            self.path.len() == 1
        } else {
            self.path.len() == 2 && self.path[0] == b"header"
        };
        if !header_child {
            return None;
        }
        match self.path.last()?.as_slice() {
            b"identifier" => Some(HeaderField::Identifier),
            b"datestamp" => Some(HeaderField::Datestamp),
            b"setSpec" => Some(HeaderField::SetSpec),
            _ => None,
        }
    }
}

fn container_kind(local_name: &[u8]) -> Option<bool> {
    match local_name {
        b"record" => Some(false),
        b"header" => Some(true),
        _ => None,
    }
}

/// Turns the parse events of one or more responses into records.
pub struct RecordExtractor {
    hooks: RecordHooks,
    scope: NamespaceScope,
    current: Option<OpenRecord>,
}

impl RecordExtractor {
    pub fn new(hooks: RecordHooks) -> Self {
        Self {
            hooks,
            scope: NamespaceScope::default(),
            current: None,
        }
    }

    /// Whether a record container is open.
    pub fn in_record(&self) -> bool {
        self.current.is_some()
    }

    /// Drop any half-read record and namespace state, e.g. after a failed page.
    pub fn reset(&mut self) {
        self.scope = NamespaceScope::default();
        self.current = None;
    }

    /// Process one event; completed records go to `emit` in document order.
    pub fn feed<F>(&mut self, event: &Event<'_>, emit: &mut F) -> Result<(), HarvestError>
    where
        F: FnMut(HarvestedRecord) -> Result<(), HarvestError>,
    {
        match event {
            Event::Start(start) => {
                self.scope.push(start);
                self.enter(event, start);
            }
            Event::Empty(start) => {
                self.scope.push(start);
                let opened_here = self.current.is_none();
                self.enter(event, start);
                if let Some(open) = self.current.as_mut() {
                    if opened_here {
                        // <record/> or <header/>: nothing inside, close now
                        self.scope.pop();
                        return self.close(emit);
                    }
                    // an empty header field carries no value
                    open.field = None;
                    open.path.pop();
                }
                self.scope.pop();
            }
            Event::End(_) => {
                if let Some(open) = self.current.as_mut() {
                    open.payload
                        .push(PayloadEvent::new(event.clone().into_owned(), Vec::new()));
                    if open.path.is_empty() {
                        self.scope.pop();
                        return self.close(emit);
                    }
                    if let Some((field, value)) = open.field.take() {
                        if open.header_field() == Some(field) {
                            let value = value.trim();
                            let hook = match field {
                                HeaderField::Identifier => &mut self.hooks.on_identifier,
                                HeaderField::Datestamp => &mut self.hooks.on_datestamp,
                                HeaderField::SetSpec => &mut self.hooks.on_set,
                            };
                            hook(&mut open.record, value);
                        } else {
                            open.field = Some((field, value));
                        }
                    }
                    open.path.pop();
                }
                self.scope.pop();
            }
            Event::Text(text) => {
                if let Some(open) = self.current.as_mut() {
                    if let Some((_, value)) = open.field.as_mut() {
                        let unescaped = text
                            .unescape()
                            .map_err(|e| HarvestError::from_xml(e.into()))?;
                        value.push_str(&unescaped);
                    }
                    open.payload
                        .push(PayloadEvent::new(event.clone().into_owned(), Vec::new()));
                }
            }
            Event::CData(cdata) => {
                if let Some(open) = self.current.as_mut() {
                    if let Some((_, value)) = open.field.as_mut() {
                        value.push_str(&String::from_utf8_lossy(cdata));
                    }
                    open.payload
                        .push(PayloadEvent::new(event.clone().into_owned(), Vec::new()));
                }
            }
            Event::Eof => {}
            _ => {
                if let Some(open) = self.current.as_mut() {
                    open.payload
                        .push(PayloadEvent::new(event.clone().into_owned(), Vec::new()));
                }
            }
        }
        Ok(())
    }

    /// Open a record or descend into one. The element is already in scope.
    fn enter(&mut self, event: &Event<'_>, start: &BytesStart<'_>) {
        let bindings = || self.scope.required_bindings(start);
        match self.current.as_mut() {
            None => {
                let Some(header_container) = container_kind(start.local_name().as_ref()) else {
                    return;
                };
                let payload = vec![PayloadEvent::new(event.clone().into_owned(), bindings())];
                let mut open = OpenRecord {
                    record: (self.hooks.create_record)(start),
                    payload,
                    header_container,
                    path: Vec::new(),
                    field: None,
                };
                if open.at_header() {
                    apply_status(&mut self.hooks.on_status, &mut open.record, start);
                }
                self.current = Some(open);
            }
            Some(open) => {
                open.payload
                    .push(PayloadEvent::new(event.clone().into_owned(), bindings()));
                open.path.push(start.local_name().as_ref().to_vec());
                if open.at_header() {
                    apply_status(&mut self.hooks.on_status, &mut open.record, start);
                } else if let Some(field) = open.header_field() {
                    open.field = Some((field, String::new()));
                }
            }
        }
    }

    fn close<F>(&mut self, emit: &mut F) -> Result<(), HarvestError>
    where
        F: FnMut(HarvestedRecord) -> Result<(), HarvestError>,
    {
        let Some(mut open) = self.current.take() else {
            return Ok(());
        };
        (self.hooks.on_record_end)(&mut open.record, &open.payload)?;
        emit(open.record)
    }
}

fn apply_status(hook: &mut FieldFn, record: &mut HarvestedRecord, start: &BytesStart<'_>) {
    if let Ok(Some(attr)) = start.try_get_attribute("status") {
        let value = attr
            .unescape_value()
            .map(|v| v.into_owned())
            .unwrap_or_else(|_| String::from_utf8_lossy(&attr.value).into_owned());
        hook(record, value.trim());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quick_xml::Reader;

    fn extract_with(hooks: RecordHooks, xml: &str) -> Vec<HarvestedRecord> {
        let mut extractor = RecordExtractor::new(hooks);
        let mut reader = Reader::from_str(xml);
        let mut records = Vec::new();
        loop {
            let event = reader.read_event().unwrap();
            if matches!(event, Event::Eof) {
                break;
            }
            extractor
                .feed(&event, &mut |r| {
                    records.push(r);
                    Ok(())
                })
                .unwrap();
        }
        assert!(!extractor.in_record());
        records
    }

    fn extract(xml: &str) -> Vec<HarvestedRecord> {
        extract_with(RecordHooks::for_base_url("http://example.oai.com/"), xml)
    }

    const THREE_RECORDS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<OAI-PMH xmlns="http://www.openarchives.org/OAI/2.0/">
  <responseDate>2015-11-03T00:00:00Z</responseDate>
  <ListRecords>
    <record>
      <header status="deleted">
        <identifier>1</identifier>
        <datestamp>2015-11-02</datestamp>
      </header>
    </record>
    <record>
      <header>
        <identifier>2</identifier>
        <datestamp>2014-01-10</datestamp>
        <setSpec>set1</setSpec>
        <setSpec>set2</setSpec>
      </header>
      <metadata>
        <oai_dc:dc xmlns:oai_dc="http://www.openarchives.org/OAI/2.0/oai_dc/" xmlns:dc="http://purl.org/dc/elements/1.1/">
          <dc:identifier>not-the-record-id</dc:identifier>
          <dc:title>Two</dc:title>
        </oai_dc:dc>
      </metadata>
    </record>
    <record>
      <header>
        <identifier>3</identifier>
        <datestamp>2010-10-10</datestamp>
        <setSpec>set3</setSpec>
      </header>
      <metadata><title>Three</title></metadata>
    </record>
  </ListRecords>
</OAI-PMH>"#;

    #[test]
    fn three_records_in_order() {
        let records = extract(THREE_RECORDS);
        assert_eq!(records.len(), 3);

        assert_eq!(records[0].identifier, "1");
        assert_eq!(records[0].datestamp, "2015-11-02");
        assert!(records[0].deleted);
        assert!(records[0].sets.is_empty());

        assert_eq!(records[1].identifier, "2");
        assert_eq!(records[1].datestamp, "2014-01-10");
        assert!(!records[1].deleted);
        assert_eq!(records[1].sets.iter().collect::<Vec<_>>(), ["set1", "set2"]);

        assert_eq!(records[2].identifier, "3");
        assert_eq!(records[2].datestamp, "2010-10-10");
        assert_eq!(records[2].sets.iter().collect::<Vec<_>>(), ["set3"]);

        for record in &records {
            assert_eq!(record.base_url, "http://example.oai.com/");
            assert!(record.checksum.is_some());
            assert!(!record.xml.is_empty());
        }
    }

    #[test]
    fn payload_is_standalone_record() {
        let records = extract(THREE_RECORDS);
        let xml = String::from_utf8(records[2].content().unwrap()).unwrap();
        assert!(xml.starts_with(r#"<record xmlns="http://www.openarchives.org/OAI/2.0/">"#), "{xml}");
        assert!(xml.ends_with("</record>"));
        assert!(xml.contains("<title>Three</title>"));
    }

    #[test]
    fn list_identifiers_headers_are_records() {
        let xml = r#"<OAI-PMH xmlns="http://www.openarchives.org/OAI/2.0/"><ListIdentifiers>
            <header><identifier>oai:a:1</identifier><datestamp>2001-01-01</datestamp><setSpec>s</setSpec></header>
            <header status="deleted"><identifier>oai:a:2</identifier><datestamp>2002-02-02</datestamp></header>
        </ListIdentifiers></OAI-PMH>"#;
        let records = extract(xml);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].identifier, "oai:a:1");
        assert!(records[0].sets.contains("s"));
        assert!(!records[0].deleted);
        assert_eq!(records[1].identifier, "oai:a:2");
        assert!(records[1].deleted);
        let payload = String::from_utf8(records[1].content().unwrap()).unwrap();
        assert!(payload.starts_with(r#"<header status="deleted" xmlns="#), "{payload}");
    }

    #[test]
    fn identifiers_inside_metadata_are_ignored() {
        let records = extract(THREE_RECORDS);
        assert_eq!(records[1].identifier, "2");
    }

    #[test]
    fn field_text_is_unescaped_and_trimmed() {
        let xml = r#"<r><record><header><identifier>
            oai:x:a&amp;b
        </identifier></header></record></r>"#;
        assert_eq!(extract(xml)[0].identifier, "oai:x:a&b");
    }

    #[test]
    fn custom_hooks_replace_defaults() {
        let hooks = RecordHooks::for_base_url("ignored")
            .with_create_record(|start: &BytesStart<'_>| {
                let mut record = HarvestedRecord::new("custom");
                record.datestamp = String::from_utf8_lossy(start.local_name().as_ref()).into_owned();
                record
            })
            .with_on_set(|record: &mut HarvestedRecord, value: &str| {
                record.add_set(value.to_uppercase())
            })
            .with_on_record_end(|_: &mut HarvestedRecord, payload: &[PayloadEvent]| {
                assert!(!payload.is_empty());
                Ok(())
            });
        let records = extract_with(hooks, THREE_RECORDS);
        assert_eq!(records[1].base_url, "custom");
        assert!(records[1].sets.contains("SET2"));
        assert!(records[1].checksum.is_none());
    }

    #[test]
    fn record_end_failure_propagates() {
        let hooks = RecordHooks::default().with_on_record_end(|_: &mut HarvestedRecord, _: &[PayloadEvent]| {
            Err(ExtractError::Hook("store rejected".into()))
        });
        let mut extractor = RecordExtractor::new(hooks);
        let mut reader = Reader::from_str(THREE_RECORDS);
        let mut emitted = 0;
        let err = loop {
            let event = reader.read_event().unwrap();
            assert!(!matches!(event, Event::Eof), "expected a failure");
            if let Err(e) = extractor.feed(&event, &mut |_| {
                emitted += 1;
                Ok(())
            }) {
                break e;
            }
        };
        assert!(matches!(err, HarvestError::Extraction(ExtractError::Hook(_))));
        assert_eq!(emitted, 0);
    }

    #[test]
    fn finalize_is_deterministic() {
        let a = extract(THREE_RECORDS);
        let b = extract(THREE_RECORDS);
        for (x, y) in a.iter().zip(&b) {
            assert_eq!(x.checksum, y.checksum);
            assert_eq!(x.xml, y.xml);
        }
        assert_ne!(a[0].checksum, a[1].checksum);
    }
}
