use crate::error::ApiError;
use crate::payload::{Body, Field, FilePart, ProgressCallback, UploadProgress};
use crate::url::value_text;
use bytes::{BufMut, Bytes, BytesMut};
use http::HeaderValue;
use http_body::{Frame, SizeHint};
use rand::Rng;
use serde_json::{Map, Value};
use std::convert::Infallible;
use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Size of the frames an [`UploadBody`] hands to the connection.
pub const UPLOAD_CHUNK_SIZE: usize = 16 * 1024;

/// Body bytes plus the content type they were encoded with.
#[derive(Debug, Clone)]
pub struct EncodedBody {
    pub bytes: Bytes,
    /// `None` for raw bodies; the caller's header stays in charge
    pub content_type: Option<HeaderValue>,
    pub multipart: bool,
}

/// Encode `body` for the wire.
///
/// Any file field forces multipart regardless of `declared`. Otherwise a
/// declared `application/x-www-form-urlencoded` content type selects form
/// encoding and everything else is sent as JSON.
///
/// # Errors
/// Returns `ApiError::Json` or `ApiError::FormEncode` on serialization failure.
pub fn encode(body: &Body, declared: Option<&HeaderValue>) -> Result<EncodedBody, ApiError> {
    match body {
        Body::Raw(bytes) => Ok(EncodedBody {
            bytes: bytes.clone(),
            content_type: None,
            multipart: false,
        }),
        Body::Fields(fields) if body.has_files() => {
            Ok(encode_multipart(fields, &new_boundary()))
        }
        _ if declared.is_some_and(is_form_content_type) => {
            let encoded = serde_urlencoded::to_string(form_pairs(body))?;
            Ok(EncodedBody {
                bytes: Bytes::from(encoded),
                content_type: Some(HeaderValue::from_static(
                    "application/x-www-form-urlencoded",
                )),
                multipart: false,
            })
        }
        Body::Json(value) => Ok(json_body(serde_json::to_vec(value)?)),
        Body::Fields(fields) => {
            let object: Map<String, Value> = fields
                .iter()
                .map(|(name, field)| (name.clone(), field.to_json()))
                .collect();
            Ok(json_body(serde_json::to_vec(&object)?))
        }
    }
}

fn json_body(bytes: Vec<u8>) -> EncodedBody {
    EncodedBody {
        bytes: Bytes::from(bytes),
        content_type: Some(HeaderValue::from_static("application/json")),
        multipart: false,
    }
}

fn is_form_content_type(value: &HeaderValue) -> bool {
    value
        .to_str()
        .ok()
        .and_then(|v| v.parse::<mime::Mime>().ok())
        .is_some_and(|m| m.essence_str() == mime::APPLICATION_WWW_FORM_URLENCODED.essence_str())
}

fn form_pairs(body: &Body) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    match body {
        Body::Fields(fields) => {
            for (name, field) in fields {
                push_form_field(name, field, &mut pairs);
            }
        }
        Body::Json(Value::Object(map)) => {
            for (name, value) in map {
                push_form_field(name, &Field::Value(value.clone()), &mut pairs);
            }
        }
        Body::Json(_) | Body::Raw(_) => {}
    }
    pairs
}

fn push_form_field(name: &str, field: &Field, pairs: &mut Vec<(String, String)>) {
    match field {
        Field::Value(Value::Null) => {}
        Field::Value(Value::Array(items)) => {
            for item in items {
                pairs.push((name.to_owned(), value_text(item)));
            }
        }
        Field::Value(value) => pairs.push((name.to_owned(), value_text(value))),
        Field::File(file) => pairs.push((name.to_owned(), file.file_name.clone())),
        Field::List(items) => {
            for item in items {
                push_form_field(name, item, pairs);
            }
        }
    }
}

fn new_boundary() -> String {
    let mut rng = rand::rng();
    format!(
        "----modkit-boundary-{:016x}{:016x}",
        rng.random::<u64>(),
        rng.random::<u64>()
    )
}

/// Encode `fields` as `multipart/form-data` with the given boundary.
///
/// Non-file fields are written as their text form; list fields add one part
/// per element under the same name.
fn encode_multipart(fields: &[(String, Field)], boundary: &str) -> EncodedBody {
    let mut buf = BytesMut::new();
    for (name, field) in fields {
        write_part(&mut buf, boundary, name, field);
    }
    buf.put_slice(format!("--{boundary}--\r\n").as_bytes());

    let content_type = HeaderValue::from_str(&format!("multipart/form-data; boundary={boundary}"))
        .unwrap_or_else(|_| HeaderValue::from_static("multipart/form-data"));
    EncodedBody {
        bytes: buf.freeze(),
        content_type: Some(content_type),
        multipart: true,
    }
}

fn write_part(buf: &mut BytesMut, boundary: &str, name: &str, field: &Field) {
    match field {
        Field::List(items) => {
            for item in items {
                write_part(buf, boundary, name, item);
            }
        }
        Field::Value(Value::Null) => {}
        Field::Value(value) => {
            buf.put_slice(format!("--{boundary}\r\n").as_bytes());
            buf.put_slice(
                format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", escape(name))
                    .as_bytes(),
            );
            buf.put_slice(value_text(value).as_bytes());
            buf.put_slice(b"\r\n");
        }
        Field::File(file) => write_file_part(buf, boundary, name, file),
    }
}

fn write_file_part(buf: &mut BytesMut, boundary: &str, name: &str, file: &FilePart) {
    let content_type = file
        .content_type
        .as_deref()
        .unwrap_or("application/octet-stream");
    buf.put_slice(format!("--{boundary}\r\n").as_bytes());
    buf.put_slice(
        format!(
            "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n",
            escape(name),
            escape(&file.file_name)
        )
        .as_bytes(),
    );
    buf.put_slice(format!("Content-Type: {content_type}\r\n\r\n").as_bytes());
    buf.put_slice(&file.data);
    buf.put_slice(b"\r\n");
}

fn escape(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace(['\r', '\n'], " ")
}

/// Request body that yields its bytes in fixed-size frames and reports
/// upload progress after each frame is handed to the connection.
pub struct UploadBody {
    data: Bytes,
    total: u64,
    sent: u64,
    progress: Option<ProgressCallback>,
}

impl UploadBody {
    #[must_use]
    pub fn new(data: Bytes, progress: Option<ProgressCallback>) -> Self {
        Self {
            total: data.len() as u64,
            data,
            sent: 0,
            progress,
        }
    }

    #[must_use]
    pub fn empty() -> Self {
        Self::new(Bytes::new(), None)
    }
}

impl Default for UploadBody {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for UploadBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadBody")
            .field("total", &self.total)
            .field("sent", &self.sent)
            .field("progress", &self.progress.is_some())
            .finish_non_exhaustive()
    }
}

impl http_body::Body for UploadBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        if this.data.is_empty() {
            return Poll::Ready(None);
        }

        let chunk = this.data.split_to(this.data.len().min(UPLOAD_CHUNK_SIZE));
        this.sent += chunk.len() as u64;
        if let Some(progress) = &this.progress {
            progress(UploadProgress::new(this.sent, this.total));
        }
        Poll::Ready(Some(Ok(Frame::data(chunk))))
    }

    fn is_end_stream(&self) -> bool {
        self.data.is_empty()
    }

    fn size_hint(&self) -> SizeHint {
        SizeHint::with_exact(self.data.len() as u64)
    }
}
