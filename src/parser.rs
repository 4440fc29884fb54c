use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::marker::PhantomData;
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, ready};
use http::{HeaderMap, Method, StatusCode};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::Error;
use crate::util::{charset, mime_type, read_unpoisoned, truncate_body, write_unpoisoned};

pub mod content_type {
    pub const APPLICATION_JSON: &str = "application/json";
    pub const TEXT_JSON: &str = "text/json";
    pub const TEXT_HTML: &str = "text/html";
    pub const TEXT_PLAIN: &str = "text/plain";
    pub const BINARY: &str = "application/octet-stream";
    pub const IMAGE_PNG: &str = "image/png";
    pub const IMAGE_JPEG: &str = "image/jpeg";
    pub const FORM_ENCODED: &str = "application/x-www-form-urlencoded";
}

/// A value produced by a [`DataParser`].
#[derive(Clone, Debug)]
pub enum ParsedBody {
    Json(serde_json::Value),
    Text(String),
    Binary(Bytes),
    Image(Arc<image::DynamicImage>),
    Form(BTreeMap<String, String>),
    Typed(TypedValue),
}

impl ParsedBody {
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Self::Binary(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn as_image(&self) -> Option<&image::DynamicImage> {
        match self {
            Self::Image(image) => Some(image),
            _ => None,
        }
    }

    pub fn as_form(&self) -> Option<&BTreeMap<String, String>> {
        match self {
            Self::Form(fields) => Some(fields),
            _ => None,
        }
    }

    pub fn downcast_ref<T>(&self) -> Option<&T>
    where
        T: 'static,
    {
        match self {
            Self::Typed(value) => value.downcast_ref(),
            _ => None,
        }
    }
}

/// A statically typed decode result, shared so a parsed body can be cloned cheaply.
#[derive(Clone)]
pub struct TypedValue {
    type_name: &'static str,
    value: Arc<dyn Any + Send + Sync>,
}

impl TypedValue {
    pub fn new<T>(value: T) -> Self
    where
        T: Send + Sync + 'static,
    {
        Self {
            type_name: std::any::type_name::<T>(),
            value: Arc::new(value),
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn downcast_ref<T>(&self) -> Option<&T>
    where
        T: 'static,
    {
        self.value.downcast_ref()
    }
}

impl std::fmt::Debug for TypedValue {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("TypedValue")
            .field("type_name", &self.type_name)
            .finish_non_exhaustive()
    }
}

/// What a parser sees besides the body bytes.
#[derive(Debug)]
pub struct ParseContext<'a> {
    method: &'a Method,
    uri: &'a str,
    status: StatusCode,
    headers: &'a HeaderMap,
}

impl<'a> ParseContext<'a> {
    pub fn new(method: &'a Method, uri: &'a str, status: StatusCode, headers: &'a HeaderMap) -> Self {
        Self {
            method,
            uri,
            status,
            headers,
        }
    }

    pub fn method(&self) -> &Method {
        self.method
    }

    pub fn uri(&self) -> &str {
        self.uri
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        self.headers
    }

    pub fn mime_type(&self) -> Option<String> {
        mime_type(self.headers)
    }

    pub fn charset(&self) -> Option<String> {
        charset(self.headers)
    }

    fn parse_failure<E>(&self, source: E) -> Error
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::parse_failure(source, self.method, self.uri, Some(self.status))
    }
}

/// `Err` values are decode failures and surface as the response's error; `Ok(None)` means the
/// parser had nothing to offer for these bytes.
pub type ParseResult = Result<Option<ParsedBody>, Error>;

pub trait DataParser: Send + Sync {
    fn parse<'a>(&'a self, body: Bytes, context: &'a ParseContext<'_>)
    -> BoxFuture<'a, ParseResult>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct JsonParser;

impl DataParser for JsonParser {
    fn parse<'a>(
        &'a self,
        body: Bytes,
        context: &'a ParseContext<'_>,
    ) -> BoxFuture<'a, ParseResult> {
        let result = match serde_json::from_slice::<serde_json::Value>(&body) {
            Ok(value) => Ok(Some(ParsedBody::Json(value))),
            Err(source) => {
                debug!(body = %truncate_body(&body), error = %source, "response json is malformed");
                Err(context.parse_failure(source))
            }
        };
        ready(result).boxed()
    }
}

/// Decodes JSON into `T`; any mismatch is reported as a `ParseFailure`.
pub struct JsonDecodeParser<T> {
    _target: PhantomData<fn() -> T>,
}

impl<T> JsonDecodeParser<T> {
    pub fn new() -> Self {
        Self {
            _target: PhantomData,
        }
    }
}

impl<T> Default for JsonDecodeParser<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for JsonDecodeParser<T> {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("JsonDecodeParser")
            .field("target", &std::any::type_name::<T>())
            .finish()
    }
}

impl<T> DataParser for JsonDecodeParser<T>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    fn parse<'a>(
        &'a self,
        body: Bytes,
        context: &'a ParseContext<'_>,
    ) -> BoxFuture<'a, ParseResult> {
        let result = serde_json::from_slice::<T>(&body)
            .map(|value| Some(ParsedBody::Typed(TypedValue::new(value))))
            .map_err(|source| context.parse_failure(source));
        ready(result).boxed()
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct TextParser;

impl DataParser for TextParser {
    fn parse<'a>(
        &'a self,
        body: Bytes,
        context: &'a ParseContext<'_>,
    ) -> BoxFuture<'a, ParseResult> {
        let text = decode_text(&body, context.charset().as_deref());
        ready(Ok(text.map(ParsedBody::Text))).boxed()
    }
}

fn decode_text(body: &[u8], charset: Option<&str>) -> Option<String> {
    match charset.unwrap_or("utf-8") {
        "us-ascii" | "ascii" => body
            .is_ascii()
            .then(|| body.iter().map(|byte| char::from(*byte)).collect()),
        "iso-8859-1" | "latin1" | "latin-1" => {
            Some(body.iter().map(|byte| char::from(*byte)).collect())
        }
        _ => std::str::from_utf8(body).ok().map(ToOwned::to_owned),
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct BinaryParser;

impl DataParser for BinaryParser {
    fn parse<'a>(
        &'a self,
        body: Bytes,
        _context: &'a ParseContext<'_>,
    ) -> BoxFuture<'a, ParseResult> {
        ready(Ok(Some(ParsedBody::Binary(body)))).boxed()
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ImageParser;

impl DataParser for ImageParser {
    fn parse<'a>(
        &'a self,
        body: Bytes,
        _context: &'a ParseContext<'_>,
    ) -> BoxFuture<'a, ParseResult> {
        let image = image::load_from_memory(&body)
            .ok()
            .map(|image| ParsedBody::Image(Arc::new(image)));
        ready(Ok(image)).boxed()
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct FormEncodedParser;

impl DataParser for FormEncodedParser {
    fn parse<'a>(
        &'a self,
        body: Bytes,
        _context: &'a ParseContext<'_>,
    ) -> BoxFuture<'a, ParseResult> {
        ready(Ok(Some(ParsedBody::Form(decode_form(&body))))).boxed()
    }
}

/// Pairs must contain exactly one `=`; anything else is skipped.
pub(crate) fn decode_form(body: &[u8]) -> BTreeMap<String, String> {
    let mut fields = BTreeMap::new();
    let Ok(text) = std::str::from_utf8(body) else {
        return fields;
    };

    for component in text.split('&') {
        let mut pieces = component.split('=');
        let (Some(name), Some(value), None) = (pieces.next(), pieces.next(), pieces.next()) else {
            continue;
        };
        let Ok(value) = percent_encoding::percent_decode_str(value).decode_utf8() else {
            continue;
        };
        fields.insert(name.to_owned(), value.into_owned());
    }
    fields
}

/// Content-type keyed parser table; also the default dispatching parser.
///
/// Lookups use the exact, lowercased mime type of the response. A later registration for the same
/// type replaces the earlier one.
pub struct ParserRegistry {
    parsers: RwLock<HashMap<String, Arc<dyn DataParser>>>,
}

impl ParserRegistry {
    pub fn empty() -> Self {
        Self {
            parsers: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_defaults() -> Self {
        let registry = Self::empty();
        registry.register(
            &[content_type::APPLICATION_JSON, content_type::TEXT_JSON],
            Arc::new(JsonParser),
        );
        registry.register(
            &[content_type::TEXT_HTML, content_type::TEXT_PLAIN],
            Arc::new(TextParser),
        );
        registry.register(&[content_type::BINARY], Arc::new(BinaryParser));
        registry.register(
            &[content_type::IMAGE_PNG, content_type::IMAGE_JPEG],
            Arc::new(ImageParser),
        );
        registry.register(&[content_type::FORM_ENCODED], Arc::new(FormEncodedParser));
        registry
    }

    pub fn register(&self, mime_types: &[&str], parser: Arc<dyn DataParser>) {
        let mut parsers = write_unpoisoned(&self.parsers);
        for mime_type in mime_types {
            parsers.insert(mime_type.to_ascii_lowercase(), Arc::clone(&parser));
        }
    }

    pub fn get(&self, mime_type: &str) -> Option<Arc<dyn DataParser>> {
        read_unpoisoned(&self.parsers)
            .get(&mime_type.to_ascii_lowercase())
            .cloned()
    }

    pub fn mime_types(&self) -> Vec<String> {
        let mut mime_types: Vec<String> = read_unpoisoned(&self.parsers).keys().cloned().collect();
        mime_types.sort();
        mime_types
    }
}

impl Default for ParserRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl std::fmt::Debug for ParserRegistry {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ParserRegistry")
            .field("mime_types", &self.mime_types())
            .finish()
    }
}

impl DataParser for ParserRegistry {
    fn parse<'a>(
        &'a self,
        body: Bytes,
        context: &'a ParseContext<'_>,
    ) -> BoxFuture<'a, ParseResult> {
        let parser = context.mime_type().and_then(|mime_type| self.get(&mime_type));
        async move {
            match parser {
                Some(parser) => parser.parse(body, context).await,
                None => Ok(None),
            }
        }
        .boxed()
    }
}
