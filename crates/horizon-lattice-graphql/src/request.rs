//! GraphQL request types.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;

/// A GraphQL request.
///
/// Represents a GraphQL operation with optional variables and operation name.
/// The same type is sent over HTTP and as the payload of a subscription
/// `start` message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphQLRequest {
    /// The GraphQL query string.
    pub query: String,

    /// Optional variables for the query.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variables: Option<Value>,

    /// Optional operation name (for documents with multiple operations).
    #[serde(skip_serializing_if = "Option::is_none", rename = "operationName")]
    pub operation_name: Option<String>,

    /// Extensions (implementation-specific metadata).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Value>,

    /// Headers applied to the HTTP request after the client defaults.
    #[serde(skip)]
    pub headers: HashMap<String, String>,

    /// File-valued variables, sent as a multipart body.
    #[serde(skip)]
    pub(crate) uploads: Vec<(String, UploadValue)>,
}

/// A file-valued variable: either one upload or a list of them.
#[derive(Debug, Clone)]
pub(crate) enum UploadValue {
    Single(Upload),
    List(Vec<Upload>),
}

impl UploadValue {
    /// The JSON sent in place of the file(s).
    fn placeholder(&self) -> Value {
        match self {
            Self::Single(_) => Value::Null,
            Self::List(files) => Value::Array(vec![Value::Null; files.len()]),
        }
    }
}

impl GraphQLRequest {
    /// Create a new request from a query document.
    ///
    /// ```ignore
    /// let request = GraphQLRequest::new("subscription { messageAdded { id body } }");
    /// ```
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }

    /// Set a variable value.
    ///
    /// ```ignore
    /// let request = GraphQLRequest::new("...")
    ///     .variable("id", "123")
    ///     .variable("limit", 10);
    /// ```
    pub fn variable(mut self, name: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(value) = serde_json::to_value(value) {
            self.variables_object().insert(name.into(), value);
        }
        self
    }

    /// Set multiple variables from a serializable value.
    ///
    /// Variables already bound to uploads keep their `null` placeholders.
    pub fn variables(mut self, variables: impl Serialize) -> Self {
        self.variables = serde_json::to_value(variables).ok();
        if !self.uploads.is_empty() {
            let placeholders: Vec<_> = self
                .uploads
                .iter()
                .map(|(name, value)| (name.clone(), value.placeholder()))
                .collect();
            self.variables_object().extend(placeholders);
        }
        self
    }

    /// Set the operation name.
    ///
    /// Required when the query document contains multiple operations.
    pub fn operation_name(mut self, name: impl Into<String>) -> Self {
        self.operation_name = Some(name.into());
        self
    }

    /// Set extensions (implementation-specific metadata).
    pub fn extensions(mut self, extensions: impl Serialize) -> Self {
        self.extensions = serde_json::to_value(extensions).ok();
        self
    }

    /// Add a header applied to this request only, after the client defaults.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Bind a file to a variable.
    ///
    /// The variable is serialized as `null` and the file travels as a separate
    /// part of a multipart request.
    pub fn upload(mut self, name: impl Into<String>, file: Upload) -> Self {
        let name = name.into();
        let value = UploadValue::Single(file);
        self.variables_object().insert(name.clone(), value.placeholder());
        self.uploads.push((name, value));
        self
    }

    /// Bind a list of files to a variable.
    pub fn upload_list(mut self, name: impl Into<String>, files: Vec<Upload>) -> Self {
        let name = name.into();
        let value = UploadValue::List(files);
        self.variables_object().insert(name.clone(), value.placeholder());
        self.uploads.push((name, value));
        self
    }

    /// Whether this request carries file uploads.
    pub fn has_uploads(&self) -> bool {
        !self.uploads.is_empty()
    }

    fn variables_object(&mut self) -> &mut Map<String, Value> {
        let variables = self
            .variables
            .get_or_insert_with(|| Value::Object(Map::new()));
        if !variables.is_object() {
            *variables = Value::Object(Map::new());
        }
        match variables {
            Value::Object(map) => map,
            _ => unreachable!("variables were just replaced with an object"),
        }
    }
}

/// A file to send with a request.
///
/// Cloning is cheap and clones refer to the same file: a file bound to
/// several variables is transmitted once.
#[derive(Debug, Clone)]
pub struct Upload {
    inner: Arc<UploadInner>,
}

#[derive(Debug)]
struct UploadInner {
    file_name: String,
    content: Bytes,
    mime_type: Option<String>,
}

impl Upload {
    /// Create an upload from in-memory content.
    pub fn new(file_name: impl Into<String>, content: impl Into<Bytes>) -> Self {
        Self {
            inner: Arc::new(UploadInner {
                file_name: file_name.into(),
                content: content.into(),
                mime_type: None,
            }),
        }
    }

    /// Read an upload from disk. The file name is taken from the path.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read(path).await?;
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self::new(file_name, content))
    }

    /// Set the MIME type sent with the file part.
    pub fn mime_type(self, mime: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(UploadInner {
                file_name: self.inner.file_name.clone(),
                content: self.inner.content.clone(),
                mime_type: Some(mime.into()),
            }),
        }
    }

    /// The file name sent with the part.
    pub fn file_name(&self) -> &str {
        &self.inner.file_name
    }

    /// The file content.
    pub fn content(&self) -> &Bytes {
        &self.inner.content
    }

    pub(crate) fn mime(&self) -> Option<&str> {
        self.inner.mime_type.as_deref()
    }

    pub(crate) fn same_file(&self, other: &Upload) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// A distinct file and every variable path that refers to it.
#[derive(Debug)]
pub(crate) struct UploadEntry {
    pub(crate) file: Upload,
    pub(crate) paths: Vec<String>,
}

/// Collect the distinct uploads of one or more requests with their
/// `variables` paths, in the order they were bound. Paths of a batch are
/// prefixed with the request index.
pub(crate) fn collect_uploads(requests: &[GraphQLRequest], batch: bool) -> Vec<UploadEntry> {
    let single = !batch;
    let mut entries: Vec<UploadEntry> = Vec::new();

    let mut record = |file: &Upload, path: String| {
        match entries.iter_mut().find(|entry| entry.file.same_file(file)) {
            Some(entry) => entry.paths.push(path),
            None => entries.push(UploadEntry {
                file: file.clone(),
                paths: vec![path],
            }),
        }
    };

    for (index, request) in requests.iter().enumerate() {
        for (name, value) in &request.uploads {
            match value {
                UploadValue::Single(file) => record(file, upload_path(single, index, name, None)),
                UploadValue::List(files) => {
                    for (position, file) in files.iter().enumerate() {
                        record(file, upload_path(single, index, name, Some(position)));
                    }
                }
            }
        }
    }
    entries
}

/// The object path of a file variable inside the `operations` document.
pub(crate) fn upload_path(
    single: bool,
    request_index: usize,
    name: &str,
    position: Option<usize>,
) -> String {
    let mut path = if single {
        format!("variables.{name}")
    } else {
        format!("{request_index}.variables.{name}")
    };
    if let Some(position) = position {
        path.push_str(&format!(".{position}"));
    }
    path
}
