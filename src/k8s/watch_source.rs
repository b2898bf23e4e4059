/**
 * Upstream watch streams
 *
 * A `WatchSource` opens one server-push stream of change events for a
 * resource kind. `KubeWatchSource` is the cluster api implementation; tests
 * plug in scripted sources.
 */
use crate::config::WATCH_TIMEOUT_SECONDS;
use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Event, Namespace, Node, PersistentVolumeClaim, Pod, Service};
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::{Api, ApiResource, DynamicObject, WatchEvent, WatchParams};
use kube::Client;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Stream of upstream watch items, ended by exhaustion or an error
pub type EventStream<T> = BoxStream<'static, Result<WatchItem<T>>>;

/// One item read from an upstream watch
#[derive(Debug, Clone)]
pub enum WatchItem<T> {
    /// A change to forward, and the resource version it brings the watch to
    Change {
        event: T,
        resource_version: Option<String>,
    },
    /// Progress marker with nothing to forward
    Bookmark { resource_version: String },
}

impl<T> WatchItem<T> {
    pub const fn change(event: T) -> Self {
        Self::Change {
            event,
            resource_version: None,
        }
    }

    pub fn versioned(event: T, resource_version: impl Into<String>) -> Self {
        Self::Change {
            event,
            resource_version: Some(resource_version.into()),
        }
    }

    pub fn bookmark(resource_version: impl Into<String>) -> Self {
        Self::Bookmark {
            resource_version: resource_version.into(),
        }
    }
}

/// The kinds of cluster objects that can be watched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Pods,
    Nodes,
    Events,
    Services,
    Ingresses,
    Pvcs,
    Deployments,
    Namespaces,
}

impl ResourceKind {
    pub const ALL: [Self; 8] = [
        Self::Pods,
        Self::Nodes,
        Self::Events,
        Self::Services,
        Self::Ingresses,
        Self::Pvcs,
        Self::Deployments,
        Self::Namespaces,
    ];

    /// Tag carried in the `type` field of every outbound message
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pods => "pods",
            Self::Nodes => "nodes",
            Self::Events => "events",
            Self::Services => "services",
            Self::Ingresses => "ingresses",
            Self::Pvcs => "pvcs",
            Self::Deployments => "deployments",
            Self::Namespaces => "namespaces",
        }
    }

    #[must_use]
    pub const fn is_namespaced(self) -> bool {
        !matches!(self, Self::Nodes | Self::Namespaces)
    }

    #[must_use]
    pub fn api_resource(self) -> ApiResource {
        match self {
            Self::Pods => ApiResource::erase::<Pod>(&()),
            Self::Nodes => ApiResource::erase::<Node>(&()),
            Self::Events => ApiResource::erase::<Event>(&()),
            Self::Services => ApiResource::erase::<Service>(&()),
            Self::Ingresses => ApiResource::erase::<Ingress>(&()),
            Self::Pvcs => ApiResource::erase::<PersistentVolumeClaim>(&()),
            Self::Deployments => ApiResource::erase::<Deployment>(&()),
            Self::Namespaces => ApiResource::erase::<Namespace>(&()),
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == wanted)
            .ok_or_else(|| {
                let known: Vec<&str> = Self::ALL.iter().map(|k| k.as_str()).collect();
                format!("unknown resource kind '{s}', expected one of {}", known.join(", "))
            })
    }
}

/// Opens upstream watch streams.
///
/// Each call to `open` is one attempt. With `resource_version` set the stream
/// resumes after that version; without it the current state is listed first.
/// The returned stream must stop producing once `cancel` fires so an
/// abandoned attempt holds no upstream connection. A resume point the server
/// no longer keeps is reported as `Error::Expired`.
#[async_trait]
pub trait WatchSource: Send + Sync + 'static {
    type Event: Serialize + Send + 'static;

    async fn open(
        &self,
        kind: ResourceKind,
        resource_version: Option<&str>,
        cancel: CancellationToken,
    ) -> Result<EventStream<Self::Event>>;
}

/// A change to one cluster object, serialized as `{"type": "ADDED", "object": {...}}`
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "object", rename_all = "UPPERCASE")]
pub enum ChangeEvent {
    Added(DynamicObject),
    Modified(DynamicObject),
    Deleted(DynamicObject),
}

/// Translate a raw watch event.
///
/// Bookmarks only move the resume point; an error event ends the stream as a
/// failure.
fn watch_item(event: WatchEvent<DynamicObject>) -> Result<WatchItem<ChangeEvent>> {
    let change = |wrap: fn(DynamicObject) -> ChangeEvent, obj: DynamicObject| {
        let resource_version = obj.metadata.resource_version.clone();
        WatchItem::Change {
            event: wrap(obj),
            resource_version,
        }
    };
    match event {
        WatchEvent::Added(obj) => Ok(change(ChangeEvent::Added, obj)),
        WatchEvent::Modified(obj) => Ok(change(ChangeEvent::Modified, obj)),
        WatchEvent::Deleted(obj) => Ok(change(ChangeEvent::Deleted, obj)),
        WatchEvent::Bookmark(bookmark) => {
            debug!("Bookmark at {}", bookmark.metadata.resource_version);
            Ok(WatchItem::bookmark(bookmark.metadata.resource_version))
        }
        WatchEvent::Error(response) if response.code == 410 => {
            Err(Error::Expired(response.message.clone()))
        }
        WatchEvent::Error(response) => Err(Error::Custom(format!(
            "watch stream reported an error: {response:?}"
        ))),
    }
}

fn watch_error(e: kube::Error) -> Error {
    match e {
        kube::Error::Api(response) if response.code == 410 => {
            Error::Expired(response.message.clone())
        }
        other => Error::Kube(other),
    }
}

/// Watches the cluster api through a shared kube client
#[derive(Clone)]
pub struct KubeWatchSource {
    client: Client,
    namespace: Option<String>,
    timeout_secs: u32,
}

impl KubeWatchSource {
    #[must_use]
    pub const fn new(client: Client, namespace: Option<String>) -> Self {
        Self {
            client,
            namespace,
            timeout_secs: WATCH_TIMEOUT_SECONDS,
        }
    }

    fn api(&self, kind: ResourceKind) -> Api<DynamicObject> {
        let resource = kind.api_resource();
        match self.namespace.as_deref() {
            Some(ns) if kind.is_namespaced() => {
                Api::namespaced_with(self.client.clone(), ns, &resource)
            }
            _ => Api::all_with(self.client.clone(), &resource),
        }
    }
}

#[async_trait]
impl WatchSource for KubeWatchSource {
    type Event = ChangeEvent;

    async fn open(
        &self,
        kind: ResourceKind,
        resource_version: Option<&str>,
        cancel: CancellationToken,
    ) -> Result<EventStream<ChangeEvent>> {
        let mut wp = WatchParams::default().timeout(self.timeout_secs);
        wp.bookmarks = true;
        // "0" lists current state from the api server cache before streaming
        let from = resource_version.unwrap_or("0");
        let stream = self
            .api(kind)
            .watch(&wp, from)
            .await
            .map_err(watch_error)?;

        let events = stream
            .map_err(watch_error)
            .and_then(|event| futures::future::ready(watch_item(event)))
            .take_until(cancel.cancelled_owned());

        Ok(events.boxed())
    }
}
