//! OAI-PMH vocabulary: verbs, request parameters, error codes.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Metadata format requested when the caller does not pick one.
pub const DEFAULT_METADATA_PREFIX: &str = "oai_dc";

/// Error code for an empty but otherwise successful list request.
pub const NO_RECORDS_MATCH: &str = "noRecordsMatch";

/// OAI-PMH 2.0 namespace.
pub const OAI_NAMESPACE: &str = "http://www.openarchives.org/OAI/2.0/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Verb {
    Identify,
    ListMetadataFormats,
    ListSets,
    ListIdentifiers,
    ListRecords,
    GetRecord,
}

/// Standard request parameters, declared in the order they are encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Parameter {
    Identifier,
    MetadataPrefix,
    From,
    Until,
    Set,
    ResumptionToken,
}

impl Parameter {
    pub const ALL: [Parameter; 6] = [
        Parameter::Identifier,
        Parameter::MetadataPrefix,
        Parameter::From,
        Parameter::Until,
        Parameter::Set,
        Parameter::ResumptionToken,
    ];

    /// Name as it appears in a request query.
    pub fn name(self) -> &'static str {
        match self {
            Self::Identifier => "identifier",
            Self::MetadataPrefix => "metadataPrefix",
            Self::From => "from",
            Self::Until => "until",
            Self::Set => "set",
            Self::ResumptionToken => "resumptionToken",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.name() == name)
    }
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Verb {
    pub const ALL: [Verb; 6] = [
        Verb::Identify,
        Verb::ListMetadataFormats,
        Verb::ListSets,
        Verb::ListIdentifiers,
        Verb::ListRecords,
        Verb::GetRecord,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Identify => "Identify",
            Self::ListMetadataFormats => "ListMetadataFormats",
            Self::ListSets => "ListSets",
            Self::ListIdentifiers => "ListIdentifiers",
            Self::ListRecords => "ListRecords",
            Self::GetRecord => "GetRecord",
        }
    }

    pub fn required(self) -> &'static [Parameter] {
        match self {
            Self::GetRecord => &[Parameter::Identifier, Parameter::MetadataPrefix],
            Self::ListIdentifiers | Self::ListRecords => &[Parameter::MetadataPrefix],
            Self::Identify | Self::ListMetadataFormats | Self::ListSets => &[],
        }
    }

    pub fn optional(self) -> &'static [Parameter] {
        match self {
            Self::ListIdentifiers | Self::ListRecords => {
                &[Parameter::From, Parameter::Until, Parameter::Set]
            }
            Self::ListMetadataFormats => &[Parameter::Identifier],
            Self::Identify | Self::ListSets | Self::GetRecord => &[],
        }
    }

    /// Whether responses to this verb may be paginated.
    pub fn is_list(self) -> bool {
        matches!(
            self,
            Self::ListSets | Self::ListIdentifiers | Self::ListRecords
        )
    }

    pub fn requires(self, parameter: Parameter) -> bool {
        self.required().contains(&parameter)
    }

    /// Check a standard-parameter map against this verb's rules.
    ///
    /// `resumptionToken` is exclusive: allowed only for list verbs and only alone.
    pub fn check<V>(self, parameters: &BTreeMap<Parameter, V>) -> Result<(), String> {
        if parameters.contains_key(&Parameter::ResumptionToken) {
            if !self.is_list() {
                return Err(format!("{self} does not accept a resumptionToken"));
            }
            if parameters.len() > 1 {
                return Err("resumptionToken is an exclusive parameter".to_string());
            }
            return Ok(());
        }

        let missing: Vec<&str> = self
            .required()
            .iter()
            .filter(|p| !parameters.contains_key(*p))
            .map(|p| p.name())
            .collect();
        if !missing.is_empty() {
            return Err(format!("missing required {}", missing.join(", ")));
        }

        let unexpected: Vec<&str> = parameters
            .keys()
            .filter(|p| !self.required().contains(*p) && !self.optional().contains(*p))
            .map(|p| p.name())
            .collect();
        if !unexpected.is_empty() {
            return Err(format!("unexpected {}", unexpected.join(", ")));
        }
        Ok(())
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Verb {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|v| v.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown verb {s:?}"))
    }
}

/// `<error code="...">message</error>` from a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolError {
    pub code: String,
    pub message: String,
}

impl ProtocolError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    /// An empty result set, reported through the error channel.
    pub fn is_no_records_match(&self) -> bool {
        self.code == NO_RECORDS_MATCH
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            f.write_str(&self.code)
        } else {
            write!(f, "{}: {}", self.code, self.message)
        }
    }
}
