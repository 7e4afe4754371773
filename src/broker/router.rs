//! Resource router
//!
//! Maps a request's Uri-Path and method to a registered [`ResourceHandler`].
//! Resources are registered before the broker starts and never change
//! afterwards, so dispatch only needs a shared reference.
//!
//! A path with no exact registration falls through to the closest registered
//! ancestor whose handler serves subresources, which is how the children a
//! collection creates stay addressable.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use crate::persistence::{Representation, StorageAdapter, StorageError};
use crate::transport::{Code, ContentFormat, Message, MessageOption, Method};

/// Path of the CoRE resource discovery endpoint.
pub const WELL_KNOWN_CORE: &str = "/.well-known/core";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RouterError {
    #[error("resource {0} is already registered")]
    DuplicateResource(String),
    #[error("invalid resource path {0:?}")]
    InvalidPath(String),
    #[error("unknown method {0:?}")]
    UnknownMethod(String),
}

/// Failure inside a handler, turned into a response code by the router.
#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("content format {0} not accepted")]
    UnsupportedContentFormat(ContentFormat),
    #[error("not found")]
    NotFound,
    #[error("storage error: {0}")]
    Storage(StorageError),
}

impl From<StorageError> for HandlerError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound => HandlerError::NotFound,
            other => HandlerError::Storage(other),
        }
    }
}

impl HandlerError {
    pub fn code(&self) -> Code {
        match self {
            HandlerError::BadRequest(_) => Code::BAD_REQUEST,
            HandlerError::UnsupportedContentFormat(_) => Code::UNSUPPORTED_CONTENT_FORMAT,
            HandlerError::NotFound => Code::NOT_FOUND,
            HandlerError::Storage(_) => Code::INTERNAL_SERVER_ERROR,
        }
    }
}

/// The request as a handler sees it.
#[derive(Debug, Clone, Copy)]
pub struct Request<'a> {
    pub method: Method,
    /// Normalized path, e.g. `/sensors/temp`.
    pub path: &'a str,
    /// Registered path that matched. Differs from `path` for a subresource.
    pub resource: &'a str,
    pub message: &'a Message,
}

impl Request<'_> {
    pub fn payload(&self) -> &[u8] {
        &self.message.payload
    }

    pub fn content_format(&self) -> Option<ContentFormat> {
        self.message.content_format()
    }

    pub fn is_subresource(&self) -> bool {
        self.path != self.resource
    }
}

/// What a handler produced: a response code plus an optional body and location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: Code,
    pub representation: Option<Representation>,
    pub location: Option<String>,
    pub etag: Option<Vec<u8>>,
}

impl Reply {
    pub fn new(code: Code) -> Self {
        Self {
            code,
            representation: None,
            location: None,
            etag: None,
        }
    }

    pub fn with_representation(mut self, representation: Representation) -> Self {
        self.representation = Some(representation);
        self
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn with_etag(mut self, etag: Vec<u8>) -> Self {
        self.etag = Some(etag);
        self
    }
}

/// Handles requests for one resource.
///
/// Handlers run outside the transaction table lock and may block on storage.
pub trait ResourceHandler: Send + Sync {
    fn handle(&self, request: &Request<'_>, storage: &dyn StorageAdapter) -> Result<Reply, HandlerError>;

    /// Content format advertised through resource discovery.
    fn content_format(&self) -> Option<ContentFormat> {
        None
    }

    /// Whether paths below this resource are routed to it as well.
    fn serves_subresources(&self) -> bool {
        false
    }
}

/// Set of methods a resource accepts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MethodSet(u8);

impl MethodSet {
    pub const fn empty() -> Self {
        MethodSet(0)
    }

    pub fn all() -> Self {
        Method::ALL.into_iter().collect()
    }

    pub fn with(mut self, method: Method) -> Self {
        self.0 |= Self::bit(method);
        self
    }

    pub fn contains(self, method: Method) -> bool {
        self.0 & Self::bit(method) != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    fn bit(method: Method) -> u8 {
        match method {
            Method::Get => 1,
            Method::Post => 1 << 1,
            Method::Put => 1 << 2,
            Method::Delete => 1 << 3,
        }
    }
}

impl FromIterator<Method> for MethodSet {
    fn from_iter<I: IntoIterator<Item = Method>>(iter: I) -> Self {
        iter.into_iter().fold(MethodSet::empty(), MethodSet::with)
    }
}

impl fmt::Display for MethodSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = Method::ALL
            .into_iter()
            .filter(|m| self.contains(*m))
            .map(|m| m.to_string())
            .collect();
        write!(f, "{}", names.join(","))
    }
}

struct Resource {
    methods: MethodSet,
    handler: Arc<dyn ResourceHandler>,
}

pub struct Router {
    resources: BTreeMap<String, Resource>,
    storage: Arc<dyn StorageAdapter>,
    well_known_core: bool,
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("resources", &self.resources.keys().collect::<Vec<_>>())
            .field("well_known_core", &self.well_known_core)
            .finish()
    }
}

impl Router {
    /// Creates a router over `storage` with resource discovery enabled.
    pub fn new(storage: Arc<dyn StorageAdapter>) -> Self {
        Self {
            resources: BTreeMap::new(),
            storage,
            well_known_core: true,
        }
    }

    pub fn with_discovery(mut self, enabled: bool) -> Self {
        self.well_known_core = enabled;
        self
    }

    /// Registers `handler` for `path`. Paths are absolute and normalized, so
    /// `/temp/` and `/temp` name the same resource.
    pub fn register(
        &mut self,
        path: &str,
        methods: MethodSet,
        handler: Arc<dyn ResourceHandler>,
    ) -> Result<(), RouterError> {
        let normalized = normalize(path).ok_or_else(|| RouterError::InvalidPath(path.to_string()))?;
        if self.resources.contains_key(&normalized)
            || (self.well_known_core && normalized == WELL_KNOWN_CORE)
        {
            return Err(RouterError::DuplicateResource(normalized));
        }

        debug!(path = %normalized, methods = %methods, "resource registered");
        self.resources.insert(normalized, Resource { methods, handler });
        Ok(())
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.resources.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Runs a request through the registry and returns the response. The result
    /// carries the request token; the caller fills in type and message ID.
    pub fn dispatch(&self, request: &Message) -> Message {
        let mut response = self.route(request);
        response.token = request.token.clone();
        response
    }

    fn route(&self, request: &Message) -> Message {
        if request.first_option(MessageOption::PROXY_URI).is_some()
            || request.first_option(MessageOption::PROXY_SCHEME).is_some()
        {
            debug!("forward proxy request refused");
            return Message::response(Code::PROXYING_NOT_SUPPORTED);
        }
        if let Some(number) = request.unrecognized_critical_option() {
            debug!(option = number, "unrecognized critical option");
            return Message::response(Code::BAD_OPTION);
        }

        let path = request.uri_path();
        let method = Method::from_code(request.code);

        if self.well_known_core && path == WELL_KNOWN_CORE {
            return match method {
                Some(Method::Get) => Message::response(Code::CONTENT)
                    .with_content_format(ContentFormat::LINK_FORMAT)
                    .with_payload(self.link_format()),
                _ => Message::response(Code::METHOD_NOT_ALLOWED),
            };
        }

        let Some((registered, resource)) = self.resolve(&path) else {
            return Message::response(Code::NOT_FOUND);
        };
        let Some(method) = method.filter(|m| resource.methods.contains(*m)) else {
            return Message::response(Code::METHOD_NOT_ALLOWED);
        };

        let req = Request {
            method,
            path: &path,
            resource: registered,
            message: request,
        };
        match resource.handler.handle(&req, self.storage.as_ref()) {
            Ok(reply) => into_message(reply),
            Err(err) => {
                match &err {
                    HandlerError::Storage(cause) => {
                        warn!(path = %path, method = %method, error = %cause, "storage failure")
                    }
                    other => debug!(path = %path, method = %method, error = %other, "request rejected"),
                }
                let mut response = Message::response(err.code());
                if let HandlerError::BadRequest(reason) = err {
                    response = response
                        .with_content_format(ContentFormat::TEXT_PLAIN)
                        .with_payload(reason);
                }
                response
            }
        }
    }

    /// Exact registration first, then the closest ancestor serving subresources.
    fn resolve(&self, path: &str) -> Option<(&str, &Resource)> {
        if let Some((registered, resource)) = self.resources.get_key_value(path) {
            return Some((registered.as_str(), resource));
        }
        let mut prefix = path;
        while let Some(end) = prefix.rfind('/').filter(|end| *end > 0) {
            prefix = &prefix[..end];
            match self.resources.get_key_value(prefix) {
                Some((registered, resource)) if resource.handler.serves_subresources() => {
                    return Some((registered.as_str(), resource));
                }
                _ => {}
            }
        }
        None
    }

    /// CoRE link format listing of the registered resources.
    fn link_format(&self) -> String {
        self.resources
            .iter()
            .map(|(path, resource)| match resource.handler.content_format() {
                Some(format) => format!("<{path}>;ct={}", format.0),
                None => format!("<{path}>"),
            })
            .collect::<Vec<_>>()
            .join(",")
    }
}

fn into_message(reply: Reply) -> Message {
    let mut response = Message::response(reply.code);
    if let Some(location) = reply.location {
        response.set_location_path(&location);
    }
    if let Some(etag) = reply.etag {
        response.set_etag(&etag);
    }
    if let Some(representation) = reply.representation {
        if let Some(format) = representation.content_format {
            response.set_content_format(format);
        }
        response.payload = representation.payload;
    }
    response
}

/// `/a//b/` → `/a/b`. Relative and empty paths are rejected.
fn normalize(path: &str) -> Option<String> {
    let rest = path.strip_prefix('/')?;
    let segments: Vec<&str> = rest.split('/').filter(|s| !s.is_empty()).collect();
    if segments.is_empty() {
        return None;
    }
    Some(format!("/{}", segments.join("/")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::SledStore;
    use crate::transport::{MessageType, Token};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Echo;

    impl ResourceHandler for Echo {
        fn handle(&self, request: &Request<'_>, _: &dyn StorageAdapter) -> Result<Reply, HandlerError> {
            Ok(Reply::new(Code::CONTENT).with_representation(Representation::new(
                Some(ContentFormat::TEXT_PLAIN),
                request.payload().to_vec(),
            )))
        }

        fn content_format(&self) -> Option<ContentFormat> {
            Some(ContentFormat::TEXT_PLAIN)
        }
    }

    struct Failing(fn() -> HandlerError, AtomicUsize);

    impl ResourceHandler for Failing {
        fn handle(&self, _: &Request<'_>, _: &dyn StorageAdapter) -> Result<Reply, HandlerError> {
            self.1.fetch_add(1, Ordering::SeqCst);
            Err((self.0)())
        }
    }

    fn router() -> Router {
        Router::new(Arc::new(SledStore::temporary("router_tests").unwrap()))
    }

    fn get(path: &str) -> Message {
        Message::request(Method::Get, path).with_token(Token::new(vec![7]).unwrap())
    }

    #[test]
    fn test_unknown_path_is_not_found() {
        let router = router();
        let response = router.dispatch(&get("/missing"));
        assert_eq!(response.code, Code::NOT_FOUND);
        assert_eq!(response.token.as_bytes(), &[7]);
        assert_eq!(response.mtype, MessageType::Acknowledgement);
    }

    #[test]
    fn test_unsupported_method_is_not_allowed() {
        let mut router = router();
        router
            .register("/temp", MethodSet::empty().with(Method::Get), Arc::new(Echo))
            .unwrap();

        let put = Message::request(Method::Put, "/temp").with_payload("1");
        assert_eq!(router.dispatch(&put).code, Code::METHOD_NOT_ALLOWED);
        assert_eq!(router.dispatch(&get("/temp")).code, Code::CONTENT);
    }

    #[test]
    fn test_handler_reply_is_encoded() {
        let mut router = router();
        router.register("/echo", MethodSet::all(), Arc::new(Echo)).unwrap();

        let response = router.dispatch(&Message::request(Method::Post, "/echo").with_payload("hi"));

        assert_eq!(response.code, Code::CONTENT);
        assert_eq!(response.payload, b"hi");
        assert_eq!(response.content_format(), Some(ContentFormat::TEXT_PLAIN));
    }

    #[test]
    fn test_handler_errors_map_to_codes() {
        let cases: [(fn() -> HandlerError, Code); 4] = [
            (|| HandlerError::BadRequest("bad".into()), Code::BAD_REQUEST),
            (
                || HandlerError::UnsupportedContentFormat(ContentFormat::TEXT_PLAIN),
                Code::UNSUPPORTED_CONTENT_FORMAT,
            ),
            (|| HandlerError::NotFound, Code::NOT_FOUND),
            (
                || HandlerError::Storage(StorageError::Unavailable("down".into())),
                Code::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (make, expected) in cases {
            let mut router = router();
            router
                .register("/r", MethodSet::all(), Arc::new(Failing(make, AtomicUsize::new(0))))
                .unwrap();
            assert_eq!(router.dispatch(&get("/r")).code, expected);
        }
    }

    #[test]
    fn test_storage_not_found_converts_to_handler_not_found() {
        assert!(matches!(HandlerError::from(StorageError::NotFound), HandlerError::NotFound));
        assert!(matches!(
            HandlerError::from(StorageError::Unavailable("x".into())),
            HandlerError::Storage(_)
        ));
    }

    #[test]
    fn test_unrecognized_critical_option_is_bad_option() {
        let mut router = router();
        router.register("/temp", MethodSet::all(), Arc::new(Echo)).unwrap();

        let mut request = get("/temp");
        request.add_option(9, vec![1]).unwrap();
        assert_eq!(router.dispatch(&request).code, Code::BAD_OPTION);

        // Elective options are ignored.
        let mut request = get("/temp");
        request.add_option(10, vec![1]).unwrap();
        assert_eq!(router.dispatch(&request).code, Code::CONTENT);
    }

    #[test]
    fn test_proxy_requests_are_refused() {
        let mut router = router();
        router.register("/temp", MethodSet::all(), Arc::new(Echo)).unwrap();

        let mut request = get("/temp");
        request
            .add_option(MessageOption::PROXY_URI, b"coap://other.example/temp".to_vec())
            .unwrap();
        let response = router.dispatch(&request);
        assert_eq!(response.code, Code::PROXYING_NOT_SUPPORTED);
        assert_eq!(response.token.as_bytes(), &[7]);

        let mut request = get("/temp");
        request.add_option(MessageOption::PROXY_SCHEME, b"http".to_vec()).unwrap();
        assert_eq!(router.dispatch(&request).code, Code::PROXYING_NOT_SUPPORTED);
    }

    /// Reports the registered path it was reached through.
    struct Parent;

    impl ResourceHandler for Parent {
        fn handle(&self, request: &Request<'_>, _: &dyn StorageAdapter) -> Result<Reply, HandlerError> {
            let body = format!("{} via {}", request.path, request.resource);
            Ok(Reply::new(Code::CONTENT).with_representation(Representation::new(None, body.into_bytes())))
        }

        fn serves_subresources(&self) -> bool {
            true
        }
    }

    #[test]
    fn test_subresources_route_to_closest_serving_ancestor() {
        let mut router = router();
        router.register("/readings", MethodSet::all(), Arc::new(Parent)).unwrap();
        router.register("/temp", MethodSet::all(), Arc::new(Echo)).unwrap();

        let child = router.dispatch(&get("/readings/abc"));
        assert_eq!(child.code, Code::CONTENT);
        assert_eq!(child.payload, b"/readings/abc via /readings");

        let nested = router.dispatch(&get("/readings/abc/def"));
        assert_eq!(nested.payload, b"/readings/abc/def via /readings");

        let own = router.dispatch(&get("/readings"));
        assert_eq!(own.payload, b"/readings via /readings");

        // Plain resources do not adopt paths below them.
        assert_eq!(router.dispatch(&get("/temp/abc")).code, Code::NOT_FOUND);
        assert_eq!(router.dispatch(&get("/readingsx")).code, Code::NOT_FOUND);
    }

    #[test]
    fn test_register_rejects_duplicates_and_bad_paths() {
        let mut router = router();
        router.register("/temp", MethodSet::all(), Arc::new(Echo)).unwrap();

        assert_eq!(
            router.register("/temp/", MethodSet::all(), Arc::new(Echo)),
            Err(RouterError::DuplicateResource("/temp".into()))
        );
        assert_eq!(
            router.register("temp", MethodSet::all(), Arc::new(Echo)),
            Err(RouterError::InvalidPath("temp".into()))
        );
        assert_eq!(
            router.register("/", MethodSet::all(), Arc::new(Echo)),
            Err(RouterError::InvalidPath("/".into()))
        );
        assert!(router
            .register(WELL_KNOWN_CORE, MethodSet::all(), Arc::new(Echo))
            .is_err());
        assert_eq!(router.len(), 1);
    }

    #[test]
    fn test_well_known_core_lists_resources() {
        let mut router = router();
        router.register("/temp", MethodSet::all(), Arc::new(Echo)).unwrap();
        router
            .register("/a/b", MethodSet::all(), Arc::new(Failing(|| HandlerError::NotFound, AtomicUsize::new(0))))
            .unwrap();

        let response = router.dispatch(&get(WELL_KNOWN_CORE));

        assert_eq!(response.code, Code::CONTENT);
        assert_eq!(response.content_format(), Some(ContentFormat::LINK_FORMAT));
        assert_eq!(response.payload, b"</a/b>,</temp>;ct=0");
    }

    #[test]
    fn test_discovery_can_be_disabled() {
        let mut router = router().with_discovery(false);
        assert_eq!(router.dispatch(&get(WELL_KNOWN_CORE)).code, Code::NOT_FOUND);
        router
            .register(WELL_KNOWN_CORE, MethodSet::all(), Arc::new(Echo))
            .unwrap();
    }

    #[test]
    fn test_method_set() {
        let set: MethodSet = [Method::Get, Method::Put].into_iter().collect();
        assert!(set.contains(Method::Get));
        assert!(!set.contains(Method::Delete));
        assert_eq!(set.to_string(), "GET,PUT");
        assert!(MethodSet::empty().is_empty());
    }
}
