//! GraphQL response types.

use std::fmt;
use std::ops::Deref;

use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// A GraphQL error returned by the server.
///
/// Path elements are either field names or list indices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphQLError {
    /// The error message.
    #[serde(default)]
    pub message: String,

    /// Locations in the document where the error occurred.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub locations: Vec<GraphQLLocation>,

    /// Path to the field that caused the error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<PathSegment>>,

    /// Additional error metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Value>,
}

impl GraphQLError {
    /// Create an error carrying only a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            locations: Vec::new(),
            path: None,
            extensions: None,
        }
    }
}

impl fmt::Display for GraphQLError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(ref path) = self.path {
            write!(f, " (at ")?;
            for (i, segment) in path.iter().enumerate() {
                if i > 0 {
                    write!(f, ".")?;
                }
                match segment {
                    PathSegment::Field(name) => write!(f, "{name}")?,
                    PathSegment::Index(idx) => write!(f, "[{idx}]")?,
                }
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}

impl std::error::Error for GraphQLError {}

/// A location in a GraphQL document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphQLLocation {
    /// Line number (1-indexed).
    pub line: u32,
    /// Column number (1-indexed).
    pub column: u32,
}

/// A segment in an error path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    /// A field name.
    Field(String),
    /// A list index.
    Index(usize),
}

/// The list of errors reported by a GraphQL server.
///
/// A missing or `null` list decodes as empty. Displays as the JSON encoding
/// of the list so the full error detail survives logging.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct GraphQLErrors(Vec<GraphQLError>);

impl GraphQLErrors {
    /// Create an empty error list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume the list, returning the errors.
    pub fn into_vec(self) -> Vec<GraphQLError> {
        self.0
    }

    /// Append all errors from another list.
    pub fn extend(&mut self, other: GraphQLErrors) {
        self.0.extend(other.0);
    }
}

impl<'de> Deserialize<'de> for GraphQLErrors {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        Option::<Vec<GraphQLError>>::deserialize(deserializer)
            .map(|errors| Self(errors.unwrap_or_default()))
    }
}

impl Deref for GraphQLErrors {
    type Target = [GraphQLError];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<Vec<GraphQLError>> for GraphQLErrors {
    fn from(errors: Vec<GraphQLError>) -> Self {
        Self(errors)
    }
}

impl IntoIterator for GraphQLErrors {
    type Item = GraphQLError;
    type IntoIter = std::vec::IntoIter<GraphQLError>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl fmt::Display for GraphQLErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(&self.0) {
            Ok(json) => f.write_str(&json),
            Err(_) => {
                let messages: Vec<&str> = self.0.iter().map(|e| e.message.as_str()).collect();
                f.write_str(&messages.join("; "))
            }
        }
    }
}

impl std::error::Error for GraphQLErrors {}

/// A GraphQL response from the server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphQLResponse {
    /// The data returned by the operation.
    #[serde(default)]
    pub data: Option<Value>,

    /// Errors that occurred during execution.
    #[serde(default, skip_serializing_if = "<[GraphQLError]>::is_empty")]
    pub errors: GraphQLErrors,

    /// Additional response metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Value>,
}

impl GraphQLResponse {
    /// Check if the response contains errors.
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Get the first error, if any.
    pub fn first_error(&self) -> Option<&GraphQLError> {
        self.errors.first()
    }

    /// Parse the data as a specific type.
    ///
    /// Returns [`Error::GraphQL`] if the response has errors.
    pub fn data<T: DeserializeOwned>(&self) -> Result<T> {
        if self.has_errors() {
            return Err(Error::GraphQL(self.errors.clone()));
        }
        let data = self.data.clone().unwrap_or(Value::Null);
        Ok(serde_json::from_value(data)?)
    }

    /// Parse a specific top-level field from the data.
    ///
    /// ```ignore
    /// // { "data": { "user": { "id": "1", "name": "John" } } }
    /// let user: User = response.field("user")?;
    /// ```
    pub fn field<T: DeserializeOwned>(&self, field: &str) -> Result<T> {
        if self.has_errors() {
            return Err(Error::GraphQL(self.errors.clone()));
        }
        match &self.data {
            Some(Value::Object(data)) => {
                let value = data.get(field).cloned().ok_or_else(|| Error::Json {
                    message: format!("field '{field}' not found in response"),
                    body: None,
                })?;
                Ok(serde_json::from_value(value)?)
            }
            _ => Err(Error::Json {
                message: "response data is not an object".into(),
                body: None,
            }),
        }
    }

    /// Consume the response and parse its data.
    pub fn into_data<T: DeserializeOwned>(self) -> Result<T> {
        if self.has_errors() {
            return Err(Error::GraphQL(self.errors));
        }
        Ok(serde_json::from_value(self.data.unwrap_or(Value::Null))?)
    }

    /// Convert errors to a Result.
    pub fn into_result(self) -> Result<Self> {
        if self.has_errors() {
            Err(Error::GraphQL(self.errors))
        } else {
            Ok(self)
        }
    }
}
