use bytes::{BufMut, Bytes, BytesMut};

#[derive(Clone, Debug)]
enum Part {
    Field {
        name: String,
        value: String,
        content_type: Option<String>,
    },
    File {
        name: String,
        file_name: String,
        content_type: String,
        data: Bytes,
    },
}

/// A `multipart/form-data` body.
#[derive(Clone, Debug)]
pub struct MultipartForm {
    boundary: String,
    parts: Vec<Part>,
}

impl Default for MultipartForm {
    fn default() -> Self {
        Self::new()
    }
}

impl MultipartForm {
    pub fn new() -> Self {
        Self {
            boundary: format!("fetchx-{:016x}", rand::random::<u64>()),
            parts: Vec::new(),
        }
    }

    pub fn with_boundary(mut self, boundary: impl Into<String>) -> Self {
        self.boundary = boundary.into();
        self
    }

    pub fn add_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parts.push(Part::Field {
            name: name.into(),
            value: value.into(),
            content_type: None,
        });
        self
    }

    pub fn add_field_with_type(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
        content_type: impl Into<String>,
    ) -> Self {
        self.parts.push(Part::Field {
            name: name.into(),
            value: value.into(),
            content_type: Some(content_type.into()),
        });
        self
    }

    pub fn add_file(
        mut self,
        name: impl Into<String>,
        file_name: impl Into<String>,
        content_type: impl Into<String>,
        data: impl Into<Bytes>,
    ) -> Self {
        self.parts.push(Part::File {
            name: name.into(),
            file_name: file_name.into(),
            content_type: content_type.into(),
            data: data.into(),
        });
        self
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    pub fn content_type(&self) -> String {
        format!("multipart/form-data; boundary={}", self.boundary)
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut body = BytesMut::new();
        for part in &self.parts {
            body.put_slice(format!("--{}\r\n", self.boundary).as_bytes());
            match part {
                Part::Field {
                    name,
                    value,
                    content_type,
                } => {
                    body.put_slice(
                        format!("Content-Disposition: form-data; name=\"{}\"\r\n", escape(name))
                            .as_bytes(),
                    );
                    if let Some(content_type) = content_type {
                        body.put_slice(format!("Content-Type: {content_type}\r\n").as_bytes());
                    }
                    body.put_slice(b"\r\n");
                    body.put_slice(value.as_bytes());
                }
                Part::File {
                    name,
                    file_name,
                    content_type,
                    data,
                } => {
                    body.put_slice(
                        format!(
                            "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n",
                            escape(name),
                            escape(file_name)
                        )
                        .as_bytes(),
                    );
                    body.put_slice(format!("Content-Type: {content_type}\r\n\r\n").as_bytes());
                    body.put_slice(data);
                }
            }
            body.put_slice(b"\r\n");
        }
        body.put_slice(format!("--{}--\r\n", self.boundary).as_bytes());
        body.freeze()
    }
}

fn escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
