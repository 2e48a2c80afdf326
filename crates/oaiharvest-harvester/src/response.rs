//! Reading one OAI-PMH response page.

use std::io::BufRead;

use chrono::{DateTime, Utc};
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};

use crate::error::HarvestError;
use crate::extract::RecordExtractor;
use crate::protocol::ProtocolError;
use crate::record::HarvestedRecord;

/// Envelope data of a page, gathered alongside record extraction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageSummary {
    pub response_date: Option<DateTime<Utc>>,
    pub errors: Vec<ProtocolError>,
    /// Token for the next page. An empty `<resumptionToken/>` ends the list.
    pub resumption_token: Option<String>,
    pub complete_list_size: Option<u64>,
    pub records: u64,
}

enum Capture {
    ResponseDate,
    Error { code: String },
    ResumptionToken,
}

/// Watches envelope elements outside records.
#[derive(Default)]
struct EnvelopeScanner {
    depth: usize,
    seen_root: bool,
    capture: Option<(Capture, String)>,
    summary: PageSummary,
}

impl EnvelopeScanner {
    fn start(&mut self, start: &BytesStart<'_>, empty: bool) -> Result<(), HarvestError> {
        let name = start.local_name();
        if self.depth == 0 {
            if name.as_ref() != b"OAI-PMH" {
                return Err(HarvestError::Malformed(format!(
                    "root element is <{}>",
                    String::from_utf8_lossy(name.as_ref())
                )));
            }
            self.seen_root = true;
        }

        let capture = match name.as_ref() {
            b"responseDate" => Capture::ResponseDate,
            b"error" => Capture::Error {
                code: attribute(start, "code").unwrap_or_default(),
            },
            b"resumptionToken" => {
                self.summary.complete_list_size =
                    attribute(start, "completeListSize").and_then(|s| s.trim().parse().ok());
                Capture::ResumptionToken
            }
            _ => return Ok(()),
        };
        if empty {
            self.finish(capture, String::new());
        } else {
            self.capture = Some((capture, String::new()));
        }
        Ok(())
    }

    fn text(&mut self, text: &str) {
        if let Some((_, value)) = self.capture.as_mut() {
            value.push_str(text);
        }
    }

    fn end(&mut self) {
        if let Some((capture, value)) = self.capture.take() {
            self.finish(capture, value);
        }
    }

    fn finish(&mut self, capture: Capture, value: String) {
        let value = value.trim();
        match capture {
            Capture::ResponseDate => {
                self.summary.response_date = DateTime::parse_from_rfc3339(value)
                    .ok()
                    .map(|d| d.with_timezone(&Utc));
            }
            Capture::Error { code } => {
                self.summary.errors.push(ProtocolError::new(code, value));
            }
            Capture::ResumptionToken => {
                self.summary.resumption_token = (!value.is_empty()).then(|| value.to_string());
            }
        }
    }
}

fn attribute(start: &BytesStart<'_>, name: &str) -> Option<String> {
    let attr = start.try_get_attribute(name).ok()??;
    attr.unescape_value().ok().map(|v| v.into_owned())
}

/// Stream `body` through `extractor`, handing each record to `emit`.
///
/// Reads the body exactly once, never holding more than the current record
/// in memory.
pub fn read_page<R, F>(
    body: R,
    extractor: &mut RecordExtractor,
    emit: &mut F,
) -> Result<PageSummary, HarvestError>
where
    R: BufRead,
    F: FnMut(HarvestedRecord) -> Result<(), HarvestError>,
{
    let mut reader = Reader::from_reader(body);
    let mut buf = Vec::with_capacity(8 * 1024);
    let mut scanner = EnvelopeScanner::default();
    let mut records = 0u64;
    let mut counted = |record: HarvestedRecord| {
        records += 1;
        emit(record)
    };

    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(HarvestError::from_xml)?;
        let outside_record = !extractor.in_record();
        match &event {
            Event::Eof => break,
            Event::Start(start) => {
                if outside_record {
                    scanner.start(start, false)?;
                }
                scanner.depth += 1;
            }
            Event::Empty(start) => {
                if outside_record {
                    scanner.start(start, true)?;
                }
            }
            Event::End(_) => {
                scanner.depth = scanner.depth.saturating_sub(1);
                if outside_record {
                    scanner.end();
                }
            }
            Event::Text(text) if outside_record && scanner.capture.is_some() => {
                let text = text.unescape().map_err(|e| HarvestError::from_xml(e.into()))?;
                scanner.text(&text);
            }
            Event::CData(cdata) if outside_record => {
                scanner.text(&String::from_utf8_lossy(cdata));
            }
            _ => {}
        }
        extractor.feed(&event, &mut counted)?;
        buf.clear();
    }

    if !scanner.seen_root {
        return Err(HarvestError::Malformed("empty document".to_string()));
    }
    if scanner.depth != 0 {
        return Err(HarvestError::Malformed(
            "document ended before the root element closed".to_string(),
        ));
    }

    let mut summary = scanner.summary;
    summary.records = records;
    Ok(summary)
}
