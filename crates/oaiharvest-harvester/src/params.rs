//! Immutable request parameters for one harvest.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use url::Url;

use crate::error::HarvestError;
use crate::protocol::{DEFAULT_METADATA_PREFIX, Parameter, Verb};

/// Datestamp precision for `from` / `until`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Granularity {
    #[default]
    Day,
    Seconds,
}

impl Granularity {
    pub fn format(self, time: &DateTime<Utc>) -> String {
        match self {
            Self::Day => time.format("%Y-%m-%d").to_string(),
            Self::Seconds => time.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        }
    }
}

/// Base URI, verb and arguments of one harvest.
///
/// Standard parameters go on the first request; the continuation requests
/// carry only the verb and the resumption token. Non-standard parameters are
/// sent on the first request only.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HarvestParameters {
    base_uri: Url,
    verb: Verb,
    standard: BTreeMap<Parameter, String>,
    nonstandard: BTreeMap<String, String>,
}

impl HarvestParameters {
    /// Parameters for `verb`, with the default metadata prefix filled in when
    /// the verb requires one.
    pub fn new(base_uri: Url, verb: Verb) -> Self {
        let mut standard = BTreeMap::new();
        if verb.requires(Parameter::MetadataPrefix) {
            standard.insert(
                Parameter::MetadataPrefix,
                DEFAULT_METADATA_PREFIX.to_string(),
            );
        }
        Self {
            base_uri,
            verb,
            standard,
            nonstandard: BTreeMap::new(),
        }
    }

    pub fn parse(base_uri: &str, verb: Verb) -> Result<Self, url::ParseError> {
        Ok(Self::new(Url::parse(base_uri)?, verb))
    }

    /// Set (or replace) a standard parameter.
    pub fn with(mut self, parameter: Parameter, value: impl Into<String>) -> Self {
        self.standard.insert(parameter, value.into());
        self
    }

    pub fn without(mut self, parameter: Parameter) -> Self {
        self.standard.remove(&parameter);
        self
    }

    pub fn with_metadata_prefix(self, prefix: impl Into<String>) -> Self {
        self.with(Parameter::MetadataPrefix, prefix)
    }

    pub fn with_set(self, set: impl Into<String>) -> Self {
        self.with(Parameter::Set, set)
    }

    pub fn with_identifier(self, identifier: impl Into<String>) -> Self {
        self.with(Parameter::Identifier, identifier)
    }

    pub fn with_from(self, from: &DateTime<Utc>, granularity: Granularity) -> Self {
        self.with(Parameter::From, granularity.format(from))
    }

    pub fn with_until(self, until: &DateTime<Utc>, granularity: Granularity) -> Self {
        self.with(Parameter::Until, granularity.format(until))
    }

    /// Resume a list at `token`. Drops every other standard parameter.
    pub fn with_resumption_token(mut self, token: impl Into<String>) -> Self {
        self.standard.clear();
        self.standard
            .insert(Parameter::ResumptionToken, token.into());
        self
    }

    /// Extra query argument sent on the first request only.
    pub fn with_nonstandard(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.nonstandard.insert(name.into(), value.into());
        self
    }

    pub fn base_uri(&self) -> &Url {
        &self.base_uri
    }

    pub fn verb(&self) -> Verb {
        self.verb
    }

    pub fn get(&self, parameter: Parameter) -> Option<&str> {
        self.standard.get(&parameter).map(String::as_str)
    }

    pub fn standard_parameters(&self) -> &BTreeMap<Parameter, String> {
        &self.standard
    }

    pub fn nonstandard_parameters(&self) -> &BTreeMap<String, String> {
        &self.nonstandard
    }

    pub fn validate(&self) -> Result<(), HarvestError> {
        self.verb
            .check(&self.standard)
            .map_err(|reason| HarvestError::InvalidParameters {
                verb: self.verb,
                reason,
            })
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    /// URL of the first request: verb, standard then non-standard parameters.
    pub fn first_request_url(&self) -> Url {
        let mut url = self.base_uri.clone();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("verb", self.verb.name());
            for (parameter, value) in &self.standard {
                query.append_pair(parameter.name(), value);
            }
            for (name, value) in &self.nonstandard {
                query.append_pair(name, value);
            }
        }
        url
    }

    /// URL continuing this harvest at `token`.
    pub fn resumption_url(&self, token: &str) -> Url {
        let mut url = self.base_uri.clone();
        url.query_pairs_mut()
            .append_pair("verb", self.verb.name())
            .append_pair(Parameter::ResumptionToken.name(), token);
        url
    }

    /// Parameters for resubmitting this harvest.
    ///
    /// With a token the new harvest resumes where the old one stopped;
    /// without one it is a copy of these parameters.
    pub fn retry_parameters(&self, token: Option<&str>) -> Self {
        match token {
            Some(token) => Self {
                base_uri: self.base_uri.clone(),
                verb: self.verb,
                standard: BTreeMap::new(),
                nonstandard: BTreeMap::new(),
            }
            .with_resumption_token(token),
            None => self.clone(),
        }
    }
}

impl fmt::Display for HarvestParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.first_request_url())
    }
}
