//! Integration tests for the tracing feature.
//!
//! A recording layer captures the spans and events a suspension emits.

#![cfg(feature = "tracing")]

use std::sync::{Arc, Mutex};

use mrt_core::test_util::{fake_runtime, run_attached, ImageBuilder};
use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Id};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

#[derive(Debug, Default)]
struct Fields(Vec<(String, String)>);

impl Visit for Fields {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.0.push((field.name().to_owned(), format!("{value:?}")));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.0.push((field.name().to_owned(), value.to_owned()));
    }
}

impl Fields {
    fn get(&self, name: &str) -> Option<&str> {
        self.0.iter().find(|(n, _)| n == name).map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Default)]
struct Recorded {
    spans: Vec<(&'static str, Fields)>,
    events: Vec<Fields>,
}

#[derive(Clone, Default)]
struct Recorder(Arc<Mutex<Recorded>>);

impl<S: Subscriber + for<'a> LookupSpan<'a>> Layer<S> for Recorder {
    fn on_new_span(&self, attrs: &Attributes<'_>, _id: &Id, _ctx: Context<'_, S>) {
        let mut fields = Fields::default();
        attrs.record(&mut fields);
        self.0.lock().unwrap().spans.push((attrs.metadata().name(), fields));
    }

    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut fields = Fields::default();
        event.record(&mut fields);
        self.0.lock().unwrap().events.push(fields);
    }
}

fn recorded<R>(f: impl FnOnce() -> R) -> (R, Recorder) {
    let recorder = Recorder::default();
    let subscriber = tracing_subscriber::registry().with(recorder.clone());
    let result = tracing::subscriber::with_default(subscriber, f);
    (result, recorder)
}

#[test]
fn test_suspension_spans_share_an_id() {
    let rt = fake_runtime();
    let (_, recorder) = recorded(|| {
        let _ = rt.suspend_ee("induced");
        rt.restart_ee();
    });

    let recorded = recorder.0.lock().unwrap();
    let (_, suspend) = recorded.spans.iter().find(|(name, _)| *name == "suspend_ee").unwrap();
    let (_, restart) = recorded.spans.iter().find(|(name, _)| *name == "restart_ee").unwrap();
    assert_eq!(suspend.get("reason"), Some("induced"));
    let id = suspend.get("suspend_id").unwrap();
    assert_ne!(id, "0");
    assert_eq!(restart.get("suspend_id"), Some(id));
    assert!(recorded
        .events
        .iter()
        .any(|event| event.get("message") == Some("suspend_complete")));
}

#[test]
fn test_suspend_ids_increase() {
    let rt = fake_runtime();
    let (_, recorder) = recorded(|| {
        for _ in 0..2 {
            let _ = rt.suspend_ee("twice");
            rt.restart_ee();
        }
    });

    let recorded = recorder.0.lock().unwrap();
    let ids: Vec<u64> = recorded
        .spans
        .iter()
        .filter(|(name, _)| *name == "suspend_ee")
        .map(|(_, fields)| fields.get("suspend_id").unwrap().parse().unwrap())
        .collect();
    assert_eq!(ids.len(), 2);
    assert!(ids[0] < ids[1]);
}

#[test]
fn test_thread_and_module_events() {
    let rt = fake_runtime();
    let (_, recorder) = recorded(|| {
        run_attached(&rt, |_| ());
        let module = ImageBuilder::new(0x60_0000, 0x100).register(&rt).unwrap();
        rt.modules().unregister(module.id()).unwrap();
    });

    let recorded = recorder.0.lock().unwrap();
    let events: Vec<&str> = recorded.events.iter().filter_map(|event| event.get("event")).collect();
    assert_eq!(events, vec!["attach", "detach", "register", "unregister"]);
}
