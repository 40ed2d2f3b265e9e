//! Publisher and subscription records.
//!
//! Both kinds share one record shape; which store a record lives in decides
//! whether it names a publisher or a subscriber. The JSON field names are
//! part of the REST contract.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Validation errors for [`PubSub`] records.
#[derive(Debug, Error)]
pub enum PubSubError {
    /// The resource address is empty.
    #[error("resource address must not be empty")]
    EmptyResource,

    /// The resource address is not rooted.
    #[error("resource address must start with '/': {0}")]
    UnrootedResource(String),

    /// The endpoint is not a parseable URI.
    #[error("endpoint is not a valid URI: {0}")]
    InvalidEndpoint(String),
}

/// A publisher or subscription record keyed by resource address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PubSub {
    /// Record id, generated on first persistence.
    #[serde(rename = "ID", skip_serializing_if = "Option::is_none", default)]
    pub id: Option<String>,

    /// Resource address the record refers to.
    #[serde(rename = "Resource")]
    pub resource: String,

    /// Where events for this record are delivered (subscribers) or accepted
    /// from (publishers).
    #[serde(rename = "EndPointURI")]
    pub end_point_uri: String,

    /// REST location of the record, filled by the API layer.
    #[serde(rename = "URILocation", skip_serializing_if = "Option::is_none", default)]
    pub uri_location: Option<String>,
}

impl PubSub {
    /// Builds an unpersisted record.
    #[must_use]
    pub fn new(resource: impl Into<String>, end_point_uri: impl Into<String>) -> Self {
        Self {
            id: None,
            resource: resource.into(),
            end_point_uri: end_point_uri.into(),
            uri_location: None,
        }
    }

    /// Checks that the record can be persisted.
    ///
    /// # Errors
    ///
    /// Returns a [`PubSubError`] when the resource address is empty or not
    /// rooted, or when the endpoint does not parse as a URI.
    pub fn validate(&self) -> Result<(), PubSubError> {
        if self.resource.is_empty() {
            return Err(PubSubError::EmptyResource);
        }
        if !self.resource.starts_with('/') {
            return Err(PubSubError::UnrootedResource(self.resource.clone()));
        }
        self.end_point_uri
            .parse::<http::Uri>()
            .map_err(|_| PubSubError::InvalidEndpoint(self.end_point_uri.clone()))?;
        Ok(())
    }
}
