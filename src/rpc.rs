// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Collection RPC.
//!
//! Exposes an in-memory collection to a remote caller. Each request is one
//! JSON document; each produces exactly one reply document tagged with the
//! caller's transaction id, so requests may be pipelined.
//!
//! ```text
//! → {"tid":7,"event":"add","args":"alice"}
//! ← {"tid":7,"reply":true}
//! → {"tid":8,"event":"clear"}
//! ← {"tid":8}
//! → {"tid":9,"event":"frobnicate"}
//! ← {"tid":9,"error":"Unknown command: frobnicate"}
//! ```
//!
//! | Event | `args` | `reply` |
//! |-------|--------|---------|
//! | `size`, `numberOfSegments` | none | number |
//! | `isEmpty` | none | bool |
//! | `add`, `remove`, `contains` | one element | bool |
//! | `addAll`, `retainAll`, `removeAll`, `containsAll` | array of elements | bool |
//! | `clear` | none | none (void) |
//! | `iterator` | none | array of every element |
//!
//! A failed request (unknown event, bad arguments) gets an `error` reply;
//! the connection carries on.

use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::store::{KeyValueStore, ReplicatedStore, StoreKey, StoreValue};
use dashmap::DashSet;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::hash::Hash;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

/// The fixed command set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CollectionCommand {
    Size,
    IsEmpty,
    Add,
    AddAll,
    RetainAll,
    ContainsAll,
    RemoveAll,
    Clear,
    Remove,
    NumberOfSegments,
    Contains,
    Iterator,
}

impl CollectionCommand {
    pub const ALL: [CollectionCommand; 12] = [
        CollectionCommand::Size,
        CollectionCommand::IsEmpty,
        CollectionCommand::Add,
        CollectionCommand::AddAll,
        CollectionCommand::RetainAll,
        CollectionCommand::ContainsAll,
        CollectionCommand::RemoveAll,
        CollectionCommand::Clear,
        CollectionCommand::Remove,
        CollectionCommand::NumberOfSegments,
        CollectionCommand::Contains,
        CollectionCommand::Iterator,
    ];

    /// Wire event name.
    pub fn name(&self) -> &'static str {
        match self {
            CollectionCommand::Size => "size",
            CollectionCommand::IsEmpty => "isEmpty",
            CollectionCommand::Add => "add",
            CollectionCommand::AddAll => "addAll",
            CollectionCommand::RetainAll => "retainAll",
            CollectionCommand::ContainsAll => "containsAll",
            CollectionCommand::RemoveAll => "removeAll",
            CollectionCommand::Clear => "clear",
            CollectionCommand::Remove => "remove",
            CollectionCommand::NumberOfSegments => "numberOfSegments",
            CollectionCommand::Contains => "contains",
            CollectionCommand::Iterator => "iterator",
        }
    }

    /// Commands whose reply carries no payload.
    pub fn is_void(&self) -> bool {
        matches!(self, CollectionCommand::Clear)
    }
}

impl FromStr for CollectionCommand {
    type Err = ReplicationError;

    fn from_str(event: &str) -> Result<Self> {
        CollectionCommand::ALL
            .into_iter()
            .find(|command| command.name() == event)
            .ok_or_else(|| ReplicationError::UnknownCommand(event.to_string()))
    }
}

/// One request document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionRequest {
    pub tid: u64,
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,
}

impl CollectionRequest {
    pub fn new(tid: u64, command: CollectionCommand) -> Self {
        Self {
            tid,
            event: command.name().to_string(),
            args: None,
        }
    }

    pub fn with_args(mut self, args: Value) -> Self {
        self.args = Some(args);
        self
    }
}

/// One reply document: `reply` for a result, neither field for a void
/// command, `error` for a failed request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionReply {
    pub tid: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CollectionReply {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// A collection that can be served over RPC.
pub trait RemoteCollection: Send + Sync {
    type Element: Serialize + DeserializeOwned + Send;

    fn size(&self) -> Result<usize>;

    fn is_empty(&self) -> Result<bool> {
        Ok(self.size()? == 0)
    }

    fn add(&self, element: Self::Element) -> Result<bool>;

    /// True if the collection changed.
    fn add_all(&self, elements: Vec<Self::Element>) -> Result<bool> {
        let mut changed = false;
        for element in elements {
            changed |= self.add(element)?;
        }
        Ok(changed)
    }

    /// Keep only elements also in `elements`. True if the collection changed.
    fn retain_all(&self, elements: Vec<Self::Element>) -> Result<bool>;

    fn contains_all(&self, elements: &[Self::Element]) -> Result<bool> {
        for element in elements {
            if !self.contains(element)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// True if the collection changed.
    fn remove_all(&self, elements: &[Self::Element]) -> Result<bool> {
        let mut changed = false;
        for element in elements {
            changed |= self.remove(element)?;
        }
        Ok(changed)
    }

    fn clear(&self) -> Result<()>;

    fn remove(&self, element: &Self::Element) -> Result<bool>;

    fn contains(&self, element: &Self::Element) -> Result<bool>;

    fn number_of_segments(&self) -> Result<usize> {
        Ok(1)
    }

    /// Snapshot of every element.
    fn elements(&self) -> Result<Vec<Self::Element>>;
}

impl<E> RemoteCollection for DashSet<E>
where
    E: Eq + Hash + Clone + Serialize + DeserializeOwned + Send + Sync,
{
    type Element = E;

    fn size(&self) -> Result<usize> {
        Ok(self.len())
    }

    fn add(&self, element: E) -> Result<bool> {
        Ok(self.insert(element))
    }

    fn retain_all(&self, elements: Vec<E>) -> Result<bool> {
        let keep: std::collections::HashSet<E> = elements.into_iter().collect();
        let before = self.len();
        self.retain(|e| keep.contains(e));
        Ok(self.len() != before)
    }

    fn clear(&self) -> Result<()> {
        DashSet::clear(self);
        Ok(())
    }

    fn remove(&self, element: &E) -> Result<bool> {
        Ok(DashSet::remove(self, element).is_some())
    }

    fn contains(&self, element: &E) -> Result<bool> {
        Ok(DashSet::contains(self, element))
    }

    fn elements(&self) -> Result<Vec<E>> {
        Ok(self.iter().map(|e| e.key().clone()).collect())
    }
}

/// A shared list; duplicates allowed, `remove` drops the first match.
#[derive(Debug, Default)]
pub struct SharedList<E> {
    items: Mutex<Vec<E>>,
}

impl<E> SharedList<E> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(Vec::new()),
        }
    }

    fn items(&self) -> std::sync::MutexGuard<'_, Vec<E>> {
        self.items.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<E> From<Vec<E>> for SharedList<E> {
    fn from(items: Vec<E>) -> Self {
        Self {
            items: Mutex::new(items),
        }
    }
}

impl<E> RemoteCollection for SharedList<E>
where
    E: PartialEq + Clone + Serialize + DeserializeOwned + Send,
{
    type Element = E;

    fn size(&self) -> Result<usize> {
        Ok(self.items().len())
    }

    fn add(&self, element: E) -> Result<bool> {
        self.items().push(element);
        Ok(true)
    }

    fn retain_all(&self, elements: Vec<E>) -> Result<bool> {
        let mut items = self.items();
        let before = items.len();
        items.retain(|e| elements.contains(e));
        Ok(items.len() != before)
    }

    fn remove_all(&self, elements: &[E]) -> Result<bool> {
        let mut items = self.items();
        let before = items.len();
        items.retain(|e| !elements.contains(e));
        Ok(items.len() != before)
    }

    fn clear(&self) -> Result<()> {
        self.items().clear();
        Ok(())
    }

    fn remove(&self, element: &E) -> Result<bool> {
        let mut items = self.items();
        match items.iter().position(|e| e == element) {
            Some(index) => {
                items.remove(index);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn contains(&self, element: &E) -> Result<bool> {
        Ok(self.items().contains(element))
    }

    fn elements(&self) -> Result<Vec<E>> {
        Ok(self.items().clone())
    }
}

/// Key set of a [`ReplicatedStore`]. Removal deletes (and replicates) the
/// key; adding is not supported.
pub struct KeySetView<K, V> {
    store: Arc<ReplicatedStore<K, V>>,
}

impl<K: StoreKey, V: StoreValue> KeySetView<K, V> {
    pub fn new(store: Arc<ReplicatedStore<K, V>>) -> Self {
        Self { store }
    }
}

impl<K: StoreKey, V: StoreValue> RemoteCollection for KeySetView<K, V> {
    type Element = K;

    fn size(&self) -> Result<usize> {
        Ok(self.store.long_size()? as usize)
    }

    fn add(&self, _element: K) -> Result<bool> {
        Err(ReplicationError::Rpc("add is not supported on a key set".to_string()))
    }

    fn retain_all(&self, elements: Vec<K>) -> Result<bool> {
        let mut changed = false;
        for key in self.elements()? {
            if !elements.contains(&key) {
                changed |= self.store.remove(&key)?;
            }
        }
        Ok(changed)
    }

    fn clear(&self) -> Result<()> {
        self.store.clear()
    }

    fn remove(&self, element: &K) -> Result<bool> {
        self.store.remove(element)
    }

    fn contains(&self, element: &K) -> Result<bool> {
        self.store.contains_key(element)
    }

    fn number_of_segments(&self) -> Result<usize> {
        Ok(self.store.segments())
    }

    fn elements(&self) -> Result<Vec<K>> {
        let mut keys = Vec::new();
        for segment in 0..self.store.segments() {
            self.store.keys_for(segment, &mut |key: &K| {
                keys.push(key.clone());
                Ok(())
            })?;
        }
        Ok(keys)
    }
}

/// Counters from one [`CollectionDispatcher::serve`] session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ServeStats {
    pub requests: u64,
    pub failures: u64,
}

/// Interprets request documents against one collection.
pub struct CollectionDispatcher<C> {
    name: String,
    collection: Arc<C>,
}

impl<C: RemoteCollection> CollectionDispatcher<C> {
    pub fn new(name: impl Into<String>, collection: Arc<C>) -> Self {
        Self {
            name: name.into(),
            collection,
        }
    }

    pub fn collection(&self) -> &Arc<C> {
        &self.collection
    }

    /// Run one request. `Ok(None)` is a void reply.
    pub fn dispatch(&self, request: &CollectionRequest) -> Result<Option<Value>> {
        let command = CollectionCommand::from_str(&request.event)?;
        let c = &self.collection;

        let reply = match command {
            CollectionCommand::Size => Value::from(c.size()?),
            CollectionCommand::IsEmpty => Value::from(c.is_empty()?),
            CollectionCommand::Add => Value::from(c.add(single::<C::Element>(request)?)?),
            CollectionCommand::AddAll => Value::from(c.add_all(many::<C::Element>(request)?)?),
            CollectionCommand::RetainAll => Value::from(c.retain_all(many::<C::Element>(request)?)?),
            CollectionCommand::ContainsAll => Value::from(c.contains_all(&many::<C::Element>(request)?)?),
            CollectionCommand::RemoveAll => Value::from(c.remove_all(&many::<C::Element>(request)?)?),
            CollectionCommand::Clear => {
                c.clear()?;
                return Ok(None);
            }
            CollectionCommand::Remove => Value::from(c.remove(&single::<C::Element>(request)?)?),
            CollectionCommand::NumberOfSegments => Value::from(c.number_of_segments()?),
            CollectionCommand::Contains => Value::from(c.contains(&single::<C::Element>(request)?)?),
            CollectionCommand::Iterator => serde_json::to_value(c.elements()?)
                .map_err(|e| ReplicationError::Rpc(format!("element does not encode: {}", e)))?,
        };
        Ok(Some(reply))
    }

    /// Run one raw request document and build its reply. Never fails: errors
    /// become `error` replies.
    pub fn handle(&self, document: &[u8]) -> CollectionReply {
        let request: CollectionRequest = match serde_json::from_slice(document) {
            Ok(request) => request,
            Err(e) => {
                let tid = serde_json::from_slice::<Value>(document)
                    .ok()
                    .and_then(|v| v.get("tid").and_then(Value::as_u64))
                    .unwrap_or(0);
                warn!(collection = %self.name, tid, error = %e, "Malformed collection request");
                metrics::record_rpc_command("malformed", false);
                return CollectionReply {
                    tid,
                    reply: None,
                    error: Some(ReplicationError::Rpc(format!("malformed request: {}", e)).to_string()),
                };
            }
        };

        match self.dispatch(&request) {
            Ok(reply) => {
                metrics::record_rpc_command(&request.event, true);
                debug!(collection = %self.name, tid = request.tid, event = %request.event, "Collection request served");
                CollectionReply {
                    tid: request.tid,
                    reply,
                    error: None,
                }
            }
            Err(e) => {
                let label = match e {
                    ReplicationError::UnknownCommand(_) => "unknown",
                    _ => request.event.as_str(),
                };
                metrics::record_rpc_command(label, false);
                warn!(
                    collection = %self.name,
                    tid = request.tid,
                    event = %request.event,
                    error = %e,
                    "Collection request failed"
                );
                CollectionReply {
                    tid: request.tid,
                    reply: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    /// Serve newline-framed request documents until `reader` reaches EOF,
    /// writing one reply line per request.
    ///
    /// Lines are read as raw bytes; one that is not valid UTF-8 gets a
    /// malformed-request reply like any other bad document.
    pub async fn serve<R, W>(&self, mut reader: R, mut writer: W) -> Result<ServeStats>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut stats = ServeStats::default();
        let mut line = Vec::new();

        loop {
            line.clear();
            let read = reader
                .read_until(b'\n', &mut line)
                .await
                .map_err(|e| ReplicationError::Internal(format!("collection transport read failed: {}", e)))?;
            if read == 0 {
                break;
            }
            let document = trim_line(&line);
            if document.is_empty() {
                continue;
            }
            let reply = self.handle(document);
            stats.requests += 1;
            if reply.is_error() {
                stats.failures += 1;
            }

            let mut out = serde_json::to_vec(&reply)
                .map_err(|e| ReplicationError::Internal(format!("reply does not encode: {}", e)))?;
            out.push(b'\n');
            writer
                .write_all(&out)
                .await
                .map_err(|e| ReplicationError::Internal(format!("collection transport write failed: {}", e)))?;
            writer
                .flush()
                .await
                .map_err(|e| ReplicationError::Internal(format!("collection transport flush failed: {}", e)))?;
        }

        debug!(
            collection = %self.name,
            requests = stats.requests,
            failures = stats.failures,
            "Collection session ended"
        );
        Ok(stats)
    }
}

fn trim_line(line: &[u8]) -> &[u8] {
    let start = line.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(line.len());
    let end = line.iter().rposition(|b| !b.is_ascii_whitespace()).map_or(start, |i| i + 1);
    &line[start..end]
}

fn single<E: DeserializeOwned>(request: &CollectionRequest) -> Result<E> {
    let args = request
        .args
        .clone()
        .ok_or_else(|| ReplicationError::Rpc(format!("{} needs an argument", request.event)))?;
    serde_json::from_value(args).map_err(|e| ReplicationError::Rpc(format!("bad argument for {}: {}", request.event, e)))
}

fn many<E: DeserializeOwned>(request: &CollectionRequest) -> Result<Vec<E>> {
    match &request.args {
        None => Ok(Vec::new()),
        Some(args) => serde_json::from_value(args.clone())
            .map_err(|e| ReplicationError::Rpc(format!("bad arguments for {}: {}", request.event, e))),
    }
}
