//! `fetchx` is an HTTP session layer with pluggable response parsing, coordinated authorization
//! renewal and a deduplicating remote-data cache.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use fetchx::prelude::{MemoryDataCache, RemoteApi, RemoteData, RemoteDataConfig, Request, Session};
//! use serde::Deserialize;
//!
//! #[derive(Debug, Deserialize)]
//! struct Item {
//!     id: String,
//! }
//!
//! #[derive(Debug, Deserialize)]
//! struct ApiError {
//!     message: String,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let session = Session::with_default_transport()?;
//!
//!     let response = session
//!         .send(Request::get("https://api.example.com/v1/items/1").typed::<Item, ApiError>())
//!         .await;
//!     match response.error() {
//!         Some(error) => match error.payload_as::<ApiError>() {
//!             Some(body) => println!("{}: {}", error.code(), body.message),
//!             None => println!("{error}"),
//!         },
//!         None => println!("{:?}", response.parsed_as::<Item>().map(|item| &item.id)),
//!     }
//!
//!     let images = RemoteData::new(
//!         RemoteApi::without_renewal(session),
//!         Arc::new(MemoryDataCache::new()),
//!         RemoteDataConfig::default().with_max_active_requests(8),
//!     );
//!     let logo = images.fetch_async("https://cdn.example.com/logo.png").await?;
//!     println!("logo is {} bytes", logo.len());
//!     Ok(())
//! }
//! ```
//!
//! # Error contract
//!
//! Every failure is an [`Error`] delivered through the response; [`Error::code`] places it in a
//! closed taxonomy. A response that carried a body holds exactly one of a parsed value or an
//! error.

mod auth;
mod cache;
mod config;
mod error;
mod form;
mod handler;
mod metrics;
mod observe;
mod parser;
mod remote_data;
mod remote_image;
mod request;
mod response;
mod session;
mod transport;
mod util;

pub use crate::auth::{
    AuthorizationPolicy, AuthorizationProvider, NoRenewal, RemoteApi, TokenAuthorizationProvider,
};
pub use crate::cache::{
    DEFAULT_CONTENT_EXPIRATION, DataCache, DiskDataCache, MemoryDataCache, Metadata, metadata_key,
};
pub use crate::config::{
    RemoteDataConfig, SessionConfig, default_cache_policy, default_timeout,
    set_default_cache_policy, set_default_timeout,
};
pub use crate::error::{ERROR_DOMAIN, Error, ErrorCode, Result};
pub use crate::form::MultipartForm;
pub use crate::handler::ResponseHandler;
pub use crate::metrics::SessionMetricsSnapshot;
pub use crate::observe::{Observer, RequestContext};
pub use crate::parser::{
    BinaryParser, DataParser, FormEncodedParser, ImageParser, JsonDecodeParser, JsonParser,
    ParseContext, ParseResult, ParsedBody, ParserRegistry, TextParser, TypedValue, content_type,
};
pub use crate::remote_data::{DataLoadedCallback, RemoteData, RemoteDataEvent};
pub use crate::remote_image::{ImageDownloaded, ImageLoadedCallback, RemoteImage};
pub use crate::request::{CachePolicy, Request};
pub use crate::response::Response;
pub use crate::session::{RequestCanceller, RequestHandle, Session, SessionBuilder};
#[cfg(feature = "hyper-transport")]
pub use crate::transport::HyperTransport;
pub use crate::transport::{
    Transport, TransportError, TransportErrorKind, TransportResponse, WireRequest,
};

pub mod prelude {
    pub use crate::{
        AuthorizationPolicy, AuthorizationProvider, CachePolicy, DataCache, DataParser,
        DiskDataCache, Error, ErrorCode, MemoryDataCache, MultipartForm, ParsedBody,
        ParserRegistry, RemoteApi, RemoteData, RemoteDataConfig, RemoteDataEvent, RemoteImage,
        Request, RequestHandle, Response, ResponseHandler, Session, SessionConfig,
        TokenAuthorizationProvider, Transport, TransportError, TransportErrorKind,
        TransportResponse, WireRequest,
    };
}
