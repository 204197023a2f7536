//! Cloud-event attributes carried in transport headers (binary content mode).
//!
//! Every attribute `name` travels as a header `ce-name`; `ce_name` is
//! accepted on read, and header names are matched case-insensitively.

use axum::http::HeaderMap;
use chrono::{DateTime, FixedOffset, SecondsFormat};
use indexmap::IndexMap;
use reqwest::Url;

/// Header prefixes recognised on read; the first one is used on write
pub const CE_PREFIXES: [&str; 2] = ["ce-", "ce_"];

pub const CE_ATTRIBUTE_ID: &str = "id";
pub const CE_ATTRIBUTE_SOURCE: &str = "source";
pub const CE_ATTRIBUTE_TYPE: &str = "type";
pub const CE_ATTRIBUTE_SPEC_VERSION: &str = "specversion";
pub const CE_ATTRIBUTE_TIME: &str = "time";
pub const CE_ATTRIBUTE_DATA_CONTENT_TYPE: &str = "datacontenttype";
pub const CE_ATTRIBUTE_DATA_SCHEMA: &str = "dataschema";
pub const CE_ATTRIBUTE_SUBJECT: &str = "subject";

pub const DEFAULT_SPEC_VERSION: &str = "1.0";

/// Error for a single malformed attribute value
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CloudEventError {
    #[error("invalid URI '{0}'")]
    InvalidUri(String),

    #[error("invalid timestamp '{0}'")]
    InvalidTime(String),
}

/// Structured cloud-event attribute set
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CloudEventMetadata {
    pub id: Option<String>,
    pub source: Option<String>,
    pub event_type: Option<String>,
    pub spec_version: Option<String>,
    pub time: Option<DateTime<FixedOffset>>,
    pub data_content_type: Option<String>,
    pub data_schema: Option<String>,
    pub subject: Option<String>,
    pub extensions: IndexMap<String, String>,
}

impl CloudEventMetadata {
    /// Create an attribute set with the required attributes and spec version 1.0
    pub fn new(id: impl Into<String>, source: impl Into<String>, event_type: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            source: Some(source.into()),
            event_type: Some(event_type.into()),
            spec_version: Some(DEFAULT_SPEC_VERSION.to_string()),
            ..Default::default()
        }
    }

    pub fn with_time(mut self, time: DateTime<FixedOffset>) -> Self {
        self.time = Some(time);
        self
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_data_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.data_content_type = Some(content_type.into());
        self
    }

    pub fn with_data_schema(mut self, schema: impl Into<String>) -> Self {
        self.data_schema = Some(schema.into());
        self
    }

    pub fn with_extension(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extensions.insert(name.into().to_ascii_lowercase(), value.into());
        self
    }

    /// Decode the attributes found in a header map.
    ///
    /// Returns `None` unless at least one attribute was parsed successfully.
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        Self::decode(headers.iter().filter_map(|(name, value)| match value.to_str() {
            Ok(value) => Some((name.as_str(), value)),
            Err(_) => {
                tracing::debug!("Skipping non UTF-8 header {}", name);
                None
            }
        }))
    }

    /// Decode the attributes found in `(name, value)` header pairs.
    ///
    /// Malformed values are logged and skipped without affecting the other
    /// attributes. Returns `None` unless at least one attribute was set.
    pub fn decode<'a, I>(headers: I) -> Option<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut metadata = Self::default();
        let mut present = false;

        for (name, value) in headers {
            let lower = name.to_ascii_lowercase();
            let Some(attribute) = CE_PREFIXES.iter().find_map(|prefix| lower.strip_prefix(prefix)) else {
                continue;
            };

            match metadata.set_attribute(attribute, value) {
                Ok(()) => present = true,
                Err(e) => tracing::warn!("Error setting value {} for attribute {}: {}", value, name, e),
            }
        }

        present.then_some(metadata)
    }

    fn set_attribute(&mut self, attribute: &str, value: &str) -> Result<(), CloudEventError> {
        match attribute {
            CE_ATTRIBUTE_ID => self.id = Some(value.to_string()),
            CE_ATTRIBUTE_SOURCE => self.source = Some(parse_uri(value)?),
            CE_ATTRIBUTE_TYPE => self.event_type = Some(value.to_string()),
            CE_ATTRIBUTE_SPEC_VERSION => self.spec_version = Some(value.to_string()),
            CE_ATTRIBUTE_SUBJECT => self.subject = Some(value.to_string()),
            CE_ATTRIBUTE_TIME => {
                let time = DateTime::parse_from_rfc3339(value)
                    .map_err(|_| CloudEventError::InvalidTime(value.to_string()))?;
                self.time = Some(time);
            }
            CE_ATTRIBUTE_DATA_CONTENT_TYPE => self.data_content_type = Some(value.to_string()),
            CE_ATTRIBUTE_DATA_SCHEMA => self.data_schema = Some(parse_uri(value)?),
            extension => {
                tracing::debug!("Unrecognized CE attribute {}, assuming extension", extension);
                self.extensions.insert(extension.to_string(), value.to_string());
            }
        }
        Ok(())
    }

    /// Encode the present attributes as `ce-` headers
    pub fn to_headers(&self) -> IndexMap<String, String> {
        let mut headers = IndexMap::new();
        let mut put = |attribute: &str, value: Option<String>| {
            if let Some(value) = value {
                headers.insert(header_name(attribute), value);
            }
        };

        put(CE_ATTRIBUTE_ID, self.id.clone());
        put(CE_ATTRIBUTE_SOURCE, self.source.clone());
        put(CE_ATTRIBUTE_TYPE, self.event_type.clone());
        put(CE_ATTRIBUTE_SPEC_VERSION, self.spec_version.clone());
        put(
            CE_ATTRIBUTE_TIME,
            self.time.map(|t| t.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
        );
        put(CE_ATTRIBUTE_DATA_CONTENT_TYPE, self.data_content_type.clone());
        put(CE_ATTRIBUTE_DATA_SCHEMA, self.data_schema.clone());
        put(CE_ATTRIBUTE_SUBJECT, self.subject.clone());
        for (name, value) in &self.extensions {
            put(name.as_str(), Some(value.clone()));
        }

        headers
    }
}

fn header_name(attribute: &str) -> String {
    format!("{}{}", CE_PREFIXES[0], attribute)
}

/// Validate an absolute URI or a URI reference
fn parse_uri(value: &str) -> Result<String, CloudEventError> {
    let invalid = || CloudEventError::InvalidUri(value.to_string());
    if value.is_empty() || value.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(invalid());
    }

    let base = Url::parse("http://localhost/").map_err(|_| invalid())?;
    base.join(value).map_err(|_| invalid())?;
    Ok(value.to_string())
}
