#![cfg(test)]

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{Subscriber, span};
use tracing_core::field::{Field, Visit};
use tracing_subscriber::registry;
use tracing_subscriber::{Layer, layer::Context, registry::LookupSpan};

#[derive(Default, Debug)]
pub struct SpanData {
    pub name: String,
    pub fields: Mutex<HashMap<String, String>>,
}

impl SpanData {
    pub fn field(&self, name: &str) -> Option<String> {
        self.fields.lock().get(name).cloned()
    }
}

#[derive(Default, Debug)]
pub struct SpanStore {
    spans: Mutex<Vec<(span::Id, Arc<SpanData>)>>,
}

impl SpanStore {
    /// Most recently created span with this name.
    pub fn find(&self, name: &str) -> Option<Arc<SpanData>> {
        self.spans
            .lock()
            .iter()
            .rev()
            .find(|(_, d)| d.name == name)
            .map(|(_, d)| d.clone())
    }

    fn get(&self, id: &span::Id) -> Option<Arc<SpanData>> {
        self.spans
            .lock()
            .iter()
            .rev()
            .find(|(i, _)| i == id)
            .map(|(_, d)| d.clone())
    }
}

struct MapVisitor<'a> {
    map: &'a mut HashMap<String, String>,
}

impl Visit for MapVisitor<'_> {
    fn record_debug(&mut self, field: &Field, value: &dyn core::fmt::Debug) {
        self.map.insert(field.name().to_string(), format!("{value:?}"));
    }
    fn record_u64(&mut self, field: &Field, value: u64) {
        self.map.insert(field.name().to_string(), value.to_string());
    }
    fn record_i64(&mut self, field: &Field, value: i64) {
        self.map.insert(field.name().to_string(), value.to_string());
    }
    fn record_str(&mut self, field: &Field, value: &str) {
        self.map.insert(field.name().to_string(), value.to_string());
    }
}

#[derive(Clone)]
pub struct CaptureLayer {
    pub store: Arc<SpanStore>,
}

impl<S> Layer<S> for CaptureLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, _ctx: Context<'_, S>) {
        let data = Arc::new(SpanData {
            name: attrs.metadata().name().to_string(),
            ..Default::default()
        });
        attrs.record(&mut MapVisitor {
            map: &mut data.fields.lock(),
        });
        self.store.spans.lock().push((id.clone(), data));
    }

    fn on_record(&self, id: &span::Id, values: &span::Record<'_>, _ctx: Context<'_, S>) {
        if let Some(data) = self.store.get(id) {
            values.record(&mut MapVisitor {
                map: &mut data.fields.lock(),
            });
        }
    }
}

/// Capture spans created on the current thread until the guard is dropped.
pub fn capture_spans() -> (Arc<SpanStore>, tracing::subscriber::DefaultGuard) {
    use tracing_subscriber::prelude::*;
    let store = Arc::new(SpanStore::default());
    let layer = CaptureLayer { store: store.clone() };
    let subscriber = registry::Registry::default().with(layer);
    let guard = tracing::subscriber::set_default(subscriber);
    (store, guard)
}
