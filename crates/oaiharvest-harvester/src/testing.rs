//! Scripted transport and OAI-PMH response builders for tests.
//!
//! No network: [`MockTransport`] answers each base URI from a queue of
//! canned replies and records every URL it was asked for.

use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use oaiharvest_core::{HttpResponse, StreamError, Transport};
use rustc_hash::FxHashMap;
use url::Url;

#[derive(Debug, Clone)]
enum Reply {
    Body {
        status: u16,
        body: String,
        delay: Duration,
    },
    Fail(String),
}

/// In-process [`Transport`] keyed by base URI (the request URL without its query).
#[derive(Debug, Default)]
pub struct MockTransport {
    replies: Mutex<FxHashMap<String, VecDeque<Reply>>>,
    requests: Mutex<Vec<Url>>,
}

fn route_key(url: &Url) -> String {
    let mut key = url.clone();
    key.set_query(None);
    key.set_fragment(None);
    key.to_string()
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, base: &str, reply: Reply) -> &Self {
        let key = Url::parse(base)
            .map(|u| route_key(&u))
            .unwrap_or_else(|_| base.to_string());
        self.replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key)
            .or_default()
            .push_back(reply);
        self
    }

    /// Queue a `200 OK` reply for `base`.
    pub fn reply(&self, base: &str, body: impl Into<String>) -> &Self {
        self.reply_status(base, 200, body)
    }

    pub fn reply_status(&self, base: &str, status: u16, body: impl Into<String>) -> &Self {
        self.push(
            base,
            Reply::Body {
                status,
                body: body.into(),
                delay: Duration::ZERO,
            },
        )
    }

    /// Queue a `200 OK` reply that takes `delay` to arrive.
    pub fn reply_after(&self, base: &str, delay: Duration, body: impl Into<String>) -> &Self {
        self.push(
            base,
            Reply::Body {
                status: 200,
                body: body.into(),
                delay,
            },
        )
    }

    /// Queue a connection-level failure.
    pub fn fail(&self, base: &str, message: impl Into<String>) -> &Self {
        self.push(base, Reply::Fail(message.into()))
    }

    /// Every URL requested so far, in order.
    pub fn requests(&self) -> Vec<Url> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replies not consumed yet, over all base URIs.
    pub fn pending(&self) -> usize {
        self.replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(VecDeque::len)
            .sum()
    }
}

impl Transport for MockTransport {
    fn execute(&self, url: &Url) -> Result<HttpResponse, StreamError> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(url.clone());
        let reply = self
            .replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(&route_key(url))
            .and_then(VecDeque::pop_front);

        match reply {
            Some(Reply::Body {
                status,
                body,
                delay,
            }) => {
                if !delay.is_zero() {
                    std::thread::sleep(delay);
                }
                Ok(HttpResponse {
                    status,
                    body: Box::new(Cursor::new(body.into_bytes())),
                })
            }
            Some(Reply::Fail(message)) => Err(StreamError::Http {
                status: None,
                message,
            }),
            None => Err(StreamError::Http {
                status: None,
                message: format!("no scripted reply for {url}"),
            }),
        }
    }
}

/// One record for the response builders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestRecord {
    pub identifier: String,
    pub datestamp: String,
    pub sets: Vec<String>,
    pub deleted: bool,
    pub title: String,
}

impl TestRecord {
    pub fn new(identifier: impl Into<String>, datestamp: impl Into<String>) -> Self {
        let identifier = identifier.into();
        Self {
            title: format!("Title of {identifier}"),
            identifier,
            datestamp: datestamp.into(),
            sets: Vec::new(),
            deleted: false,
        }
    }

    pub fn with_sets(mut self, sets: &[&str]) -> Self {
        self.sets = sets.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn deleted(mut self) -> Self {
        self.deleted = true;
        self
    }

    fn header(&self) -> String {
        let status = if self.deleted {
            r#" status="deleted""#
        } else {
            ""
        };
        let sets: String = self
            .sets
            .iter()
            .map(|s| format!("<setSpec>{s}</setSpec>"))
            .collect();
        format!(
            "<header{status}><identifier>{}</identifier><datestamp>{}</datestamp>{sets}</header>",
            self.identifier, self.datestamp
        )
    }

    fn record(&self) -> String {
        if self.deleted {
            return format!("<record>{}</record>", self.header());
        }
        format!(
            concat!(
                "<record>{}<metadata>",
                r#"<oai_dc:dc xmlns:oai_dc="http://www.openarchives.org/OAI/2.0/oai_dc/" xmlns:dc="http://purl.org/dc/elements/1.1/">"#,
                "<dc:title>{}</dc:title><dc:identifier>urn:test:{}</dc:identifier>",
                "</oai_dc:dc></metadata></record>"
            ),
            self.header(),
            self.title,
            self.identifier
        )
    }
}

/// The standard three-record page: one deleted with no sets, one in two
/// sets, one in one set.
pub fn three_records() -> Vec<TestRecord> {
    vec![
        TestRecord::new("1", "2015-11-02").deleted(),
        TestRecord::new("2", "2014-01-10").with_sets(&["set1", "set2"]),
        TestRecord::new("3", "2010-10-10").with_sets(&["set3"]),
    ]
}

fn envelope(verb: &str, body: &str) -> String {
    format!(
        concat!(
            r#"<?xml version="1.0" encoding="UTF-8"?>"#,
            "\n",
            r#"<OAI-PMH xmlns="http://www.openarchives.org/OAI/2.0/" xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance">"#,
            "\n<responseDate>2015-11-03T12:00:00Z</responseDate>",
            r#"<request verb="{verb}">http://example.oai.com/</request>"#,
            "\n{body}\n</OAI-PMH>"
        ),
        verb = verb,
        body = body
    )
}

fn token_element(token: Option<&str>) -> String {
    match token {
        Some(token) => format!(r#"<resumptionToken cursor="0">{token}</resumptionToken>"#),
        None => String::new(),
    }
}

pub fn list_records(records: &[TestRecord], token: Option<&str>) -> String {
    let body: String = records.iter().map(TestRecord::record).collect();
    envelope(
        "ListRecords",
        &format!("<ListRecords>{body}{}</ListRecords>", token_element(token)),
    )
}

pub fn list_identifiers(records: &[TestRecord], token: Option<&str>) -> String {
    let body: String = records.iter().map(TestRecord::header).collect();
    envelope(
        "ListIdentifiers",
        &format!(
            "<ListIdentifiers>{body}{}</ListIdentifiers>",
            token_element(token)
        ),
    )
}

/// A response carrying a single `<error>`.
pub fn error_response(code: &str, message: &str) -> String {
    envelope(
        "ListRecords",
        &format!(r#"<error code="{code}">{message}</error>"#),
    )
}
