//! Kubernetes events attached to the reconciled objects
//!
//! Events are best effort: a failure to publish is logged and never fails a reconcile.

use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Event, EventSource, ObjectReference};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, Time};
use kube::api::{Api, ObjectMeta, PostParams};
use kube::Client;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Component name reported on every event
pub const REPORTING_COMPONENT: &str = "hetzner-operator";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => f.write_str("Normal"),
            Self::Warning => f.write_str("Warning"),
        }
    }
}

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(
        &self,
        object: &ObjectReference,
        type_: EventType,
        reason: &str,
        message: &str,
    ) -> Result<()>;
}

/// Creates `core/v1` Event objects in the namespace of the involved object
#[derive(Clone)]
pub struct KubeEventSink {
    client: Client,
    instance: String,
}

impl KubeEventSink {
    pub fn new(client: Client) -> Self {
        let instance = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| REPORTING_COMPONENT.to_string());
        Self { client, instance }
    }
}

#[async_trait]
impl EventSink for KubeEventSink {
    async fn publish(
        &self,
        object: &ObjectReference,
        type_: EventType,
        reason: &str,
        message: &str,
    ) -> Result<()> {
        let namespace = object.namespace.as_deref().unwrap_or("default");
        let events: Api<Event> = Api::namespaced(self.client.clone(), namespace);

        let time = chrono::Utc::now();
        let name = object.name.as_deref().unwrap_or("unknown");
        let event = Event {
            metadata: ObjectMeta {
                generate_name: Some(format!("{name}.")),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            type_: Some(type_.to_string()),
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
            involved_object: object.clone(),
            first_timestamp: Some(Time(time)),
            last_timestamp: Some(Time(time)),
            event_time: Some(MicroTime(time)),
            count: Some(1),
            action: Some(reason.to_string()),
            reporting_component: Some(REPORTING_COMPONENT.to_string()),
            reporting_instance: Some(self.instance.clone()),
            source: Some(EventSource {
                component: Some(REPORTING_COMPONENT.to_string()),
                host: Some(self.instance.clone()),
            }),
            ..Default::default()
        };

        events
            .create(&PostParams::default(), &event)
            .await
            .map_err(Error::KubeError)?;
        Ok(())
    }
}

/// Event kept in memory by [`MemoryEventSink`]
#[derive(Clone, Debug, PartialEq)]
pub struct RecordedEvent {
    pub object: ObjectReference,
    pub type_: EventType,
    pub reason: String,
    pub message: String,
}

/// Collects events instead of publishing them
#[derive(Debug, Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<RecordedEvent>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn reasons(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.reason).collect()
    }

    pub fn has_reason(&self, reason: &str) -> bool {
        self.events().iter().any(|e| e.reason == reason)
    }
}

#[async_trait]
impl EventSink for MemoryEventSink {
    async fn publish(
        &self,
        object: &ObjectReference,
        type_: EventType,
        reason: &str,
        message: &str,
    ) -> Result<()> {
        if let Ok(mut events) = self.events.lock() {
            events.push(RecordedEvent {
                object: object.clone(),
                type_,
                reason: reason.to_string(),
                message: message.to_string(),
            });
        }
        Ok(())
    }
}

/// Publishes events for one object
#[derive(Clone)]
pub struct Recorder {
    sink: Arc<dyn EventSink>,
    object: ObjectReference,
}

impl Recorder {
    pub fn new(sink: Arc<dyn EventSink>, object: ObjectReference) -> Self {
        Self { sink, object }
    }

    /// Same sink, different involved object
    pub fn for_object(&self, object: ObjectReference) -> Self {
        Self::new(self.sink.clone(), object)
    }

    pub async fn normal(&self, reason: &str, message: impl AsRef<str>) {
        self.publish(EventType::Normal, reason, message.as_ref()).await;
    }

    pub async fn warn(&self, reason: &str, message: impl AsRef<str>) {
        self.publish(EventType::Warning, reason, message.as_ref()).await;
    }

    async fn publish(&self, type_: EventType, reason: &str, message: &str) {
        debug!(
            object = self.object.name.as_deref().unwrap_or_default(),
            %type_,
            reason,
            message,
            "Recording event"
        );
        if let Err(e) = self.sink.publish(&self.object, type_, reason, message).await {
            warn!(reason, "Failed to publish event: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object() -> ObjectReference {
        ObjectReference {
            kind: Some("HCloudMachine".into()),
            name: Some("m1".into()),
            namespace: Some("default".into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_recorder_publishes_to_sink() {
        let sink = Arc::new(MemoryEventSink::new());
        let recorder = Recorder::new(sink.clone(), object());

        recorder.normal("SuccessfulCreate", "Created new server with id 1").await;
        recorder.warn("FailedCreateHCloudServer", "boom").await;

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].type_, EventType::Normal);
        assert_eq!(events[1].type_, EventType::Warning);
        assert_eq!(events[1].object.name.as_deref(), Some("m1"));
        assert!(sink.has_reason("SuccessfulCreate"));
    }

    struct FailingSink;

    #[async_trait]
    impl EventSink for FailingSink {
        async fn publish(
            &self,
            _object: &ObjectReference,
            _type_: EventType,
            _reason: &str,
            _message: &str,
        ) -> Result<()> {
            Err(Error::ReconcileError("api down".into()))
        }
    }

    #[tokio::test]
    async fn test_publish_failure_is_swallowed() {
        let recorder = Recorder::new(Arc::new(FailingSink), object());
        recorder.warn("Anything", "message").await;
    }
}
