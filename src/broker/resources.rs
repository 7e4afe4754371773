//! Built-in resource handlers and registration from configuration.
//!
//! Stored documents carry an ETag derived from their content. Writes honor
//! If-Match and If-None-Match, and a GET naming the current ETag is answered
//! with 2.03 Valid instead of the body.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::broker::router::{HandlerError, MethodSet, Reply, Request, ResourceHandler, Router, RouterError};
use crate::config::{ResourceKind, ResourceSettings, Settings};
use crate::persistence::{Representation, StorageAdapter, StorageError};
use crate::transport::{Code, ContentFormat, MessageOption, Method};

/// A single document stored under the resource path.
#[derive(Debug, Clone, Default)]
pub struct StoredResource {
    format: Option<ContentFormat>,
}

impl StoredResource {
    pub fn new(format: Option<ContentFormat>) -> Self {
        Self { format }
    }
}

impl ResourceHandler for StoredResource {
    fn handle(&self, request: &Request<'_>, storage: &dyn StorageAdapter) -> Result<Reply, HandlerError> {
        document(request, self.format, storage)
    }

    fn content_format(&self) -> Option<ContentFormat> {
        self.format
    }
}

/// A container whose children are created by POST and addressed through the
/// returned Location-Path.
#[derive(Debug, Clone, Default)]
pub struct CollectionResource {
    format: Option<ContentFormat>,
}

#[derive(Debug, Serialize)]
struct Child {
    path: String,
    content_format: Option<ContentFormat>,
    payload: String,
}

impl CollectionResource {
    pub fn new(format: Option<ContentFormat>) -> Self {
        Self { format }
    }

    fn children(path: &str, storage: &dyn StorageAdapter) -> Result<Vec<(String, Representation)>, StorageError> {
        storage.query(&format!("{path}/"))
    }
}

impl ResourceHandler for CollectionResource {
    fn handle(&self, request: &Request<'_>, storage: &dyn StorageAdapter) -> Result<Reply, HandlerError> {
        if request.is_subresource() {
            return match request.method {
                Method::Post => Ok(Reply::new(Code::METHOD_NOT_ALLOWED)),
                _ => document(request, self.format, storage),
            };
        }

        match request.method {
            Method::Get => {
                let children: Vec<Child> = Self::children(request.path, storage)?
                    .into_iter()
                    .map(|(path, representation)| Child {
                        path,
                        content_format: representation.content_format,
                        payload: String::from_utf8_lossy(&representation.payload).into_owned(),
                    })
                    .collect();
                let body = serde_json::to_vec(&children).map_err(StorageError::from)?;
                Ok(Reply::new(Code::CONTENT)
                    .with_representation(Representation::new(Some(ContentFormat::JSON), body)))
            }
            Method::Post => {
                let child = format!("{}/{}", request.path, Uuid::new_v4());
                storage.put(&child, representation_of(request, self.format)?)?;
                Ok(Reply::new(Code::CREATED).with_location(child))
            }
            Method::Delete => {
                for (path, _) in Self::children(request.path, storage)? {
                    match storage.delete(&path) {
                        Ok(()) | Err(StorageError::NotFound) => {}
                        Err(err) => return Err(err.into()),
                    }
                }
                Ok(Reply::new(Code::DELETED))
            }
            Method::Put => Ok(Reply::new(Code::METHOD_NOT_ALLOWED)),
        }
    }

    fn content_format(&self) -> Option<ContentFormat> {
        self.format
    }

    fn serves_subresources(&self) -> bool {
        true
    }
}

/// Plain document semantics on `request.path`.
fn document(
    request: &Request<'_>,
    format: Option<ContentFormat>,
    storage: &dyn StorageAdapter,
) -> Result<Reply, HandlerError> {
    if request.method != Method::Get && !preconditions_hold(request, storage)? {
        return Ok(Reply::new(Code::PRECONDITION_FAILED));
    }

    match request.method {
        Method::Get => {
            let representation = storage.get(request.path)?;
            let etag = etag_of(&representation);
            let fresh = request
                .message
                .option_values(MessageOption::ETAG)
                .any(|candidate| candidate == etag.as_slice());
            if fresh {
                return Ok(Reply::new(Code::VALID).with_etag(etag));
            }
            Ok(Reply::new(Code::CONTENT)
                .with_representation(representation)
                .with_etag(etag))
        }
        Method::Put => {
            let representation = representation_of(request, format)?;
            let etag = etag_of(&representation);
            storage.put(request.path, representation)?;
            Ok(Reply::new(Code::CHANGED).with_etag(etag))
        }
        Method::Post => {
            storage.put(request.path, representation_of(request, format)?)?;
            Ok(Reply::new(Code::CREATED).with_location(request.path))
        }
        Method::Delete => {
            storage.delete(request.path)?;
            Ok(Reply::new(Code::DELETED))
        }
    }
}

/// Evaluates If-Match and If-None-Match against what is stored now. An empty
/// If-Match value matches any existing representation.
fn preconditions_hold(request: &Request<'_>, storage: &dyn StorageAdapter) -> Result<bool, HandlerError> {
    let if_match: Vec<&[u8]> = request.message.option_values(MessageOption::IF_MATCH).collect();
    let if_none_match = request.message.first_option(MessageOption::IF_NONE_MATCH).is_some();
    if if_match.is_empty() && !if_none_match {
        return Ok(true);
    }

    let current = match storage.get(request.path) {
        Ok(representation) => Some(representation),
        Err(StorageError::NotFound) => None,
        Err(err) => return Err(err.into()),
    };
    if if_none_match && current.is_some() {
        return Ok(false);
    }
    if if_match.is_empty() {
        return Ok(true);
    }
    Ok(current.is_some_and(|representation| {
        let etag = etag_of(&representation);
        if_match.iter().any(|value| value.is_empty() || *value == etag.as_slice())
    }))
}

/// Entity tag of a stored representation: a hash of its format and bytes.
fn etag_of(representation: &Representation) -> Vec<u8> {
    let mut hasher = DefaultHasher::new();
    representation.content_format.hash(&mut hasher);
    representation.payload.hash(&mut hasher);
    hasher.finish().to_be_bytes().to_vec()
}

/// Checks a request body against the resource's declared format.
fn representation_of(request: &Request<'_>, declared: Option<ContentFormat>) -> Result<Representation, HandlerError> {
    let format = match (request.content_format(), declared) {
        (Some(given), Some(expected)) if given != expected => {
            return Err(HandlerError::UnsupportedContentFormat(given));
        }
        (given, declared) => given.or(declared),
    };

    if format == Some(ContentFormat::JSON) {
        serde_json::from_slice::<serde_json::Value>(request.payload())
            .map_err(|e| HandlerError::BadRequest(format!("invalid JSON: {e}")))?;
    }

    Ok(Representation::new(format, request.payload().to_vec()))
}

fn methods_of(resource: &ResourceSettings) -> Result<MethodSet, RouterError> {
    resource
        .methods
        .iter()
        .map(|name| Method::from_str(name).map_err(|_| RouterError::UnknownMethod(name.clone())))
        .collect::<Result<Vec<_>, _>>()
        .map(|methods| methods.into_iter().collect())
}

/// Builds the router with every resource listed in `settings`.
pub fn build_router(settings: &Settings, storage: Arc<dyn StorageAdapter>) -> Result<Router, RouterError> {
    let mut router = Router::new(storage).with_discovery(settings.server.well_known_core);

    for resource in &settings.resources {
        let format = resource.content_format.map(ContentFormat);
        let handler: Arc<dyn ResourceHandler> = match resource.kind {
            ResourceKind::Stored => Arc::new(StoredResource::new(format)),
            ResourceKind::Collection => Arc::new(CollectionResource::new(format)),
        };
        router.register(&resource.path, methods_of(resource)?, handler)?;
    }

    Ok(router)
}
