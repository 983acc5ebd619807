//! `multipart/form-data` encoding for staged uploads

use bytes::{BufMut, Bytes, BytesMut};
use uuid::Uuid;

/// Form field used for every uploaded file
pub const FILES_FIELD: &str = "files";

/// An encoded multipart body together with its `Content-Type` header value
#[derive(Debug, Clone)]
pub struct MultipartBody {
    pub boundary: String,
    pub body: Bytes,
}

impl MultipartBody {
    pub fn content_type(&self) -> String {
        format!("multipart/form-data; boundary={}", self.boundary)
    }
}

/// Encode `(filename, content)` pairs as one `files` part each
pub fn encode_files(files: &[(&str, &[u8])]) -> MultipartBody {
    encode_with_boundary(files, Uuid::new_v4().simple().to_string())
}

fn encode_with_boundary(files: &[(&str, &[u8])], boundary: String) -> MultipartBody {
    let mut body = BytesMut::new();

    for (filename, content) in files {
        body.put_slice(format!("--{}\r\n", boundary).as_bytes());
        body.put_slice(
            format!(
                "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n",
                FILES_FIELD,
                escape_filename(filename)
            )
            .as_bytes(),
        );
        body.put_slice(
            format!("Content-Type: {}\r\n\r\n", mime::APPLICATION_OCTET_STREAM).as_bytes(),
        );
        body.put_slice(content);
        body.put_slice(b"\r\n");
    }
    body.put_slice(format!("--{}--\r\n", boundary).as_bytes());

    MultipartBody {
        boundary,
        body: body.freeze(),
    }
}

/// Quotes and line breaks would end the header value early
fn escape_filename(filename: &str) -> String {
    filename
        .replace('"', "%22")
        .replace('\r', "%0D")
        .replace('\n', "%0A")
}
