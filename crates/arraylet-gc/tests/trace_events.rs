//! Diagnostic event coverage (requires `--features tracing,test-util`).

#![cfg(feature = "tracing")]

use std::fmt::Debug;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::field::{Field, Visit};
use tracing::subscriber::with_default;
use tracing::Event;
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::{Layer, Registry};

use arraylet_gc::test_util::{FakeMapper, VecLeafAllocator};
use arraylet_gc::{
    attach_leaves, select_layout, AllocationDescription, DoubleMapRegistry, HeapConfig,
    LayoutRequest, Spine,
};

/// Counts events by their message text.
#[derive(Clone)]
struct EventCounter {
    message: &'static str,
    hits: Arc<AtomicUsize>,
}

struct MessageVisitor<'c> {
    counter: &'c EventCounter,
}

impl Visit for MessageVisitor<'_> {
    fn record_debug(&mut self, field: &Field, value: &dyn Debug) {
        if field.name() == "message" && format!("{value:?}") == self.counter.message {
            self.counter.hits.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl<S: tracing::Subscriber> Layer<S> for EventCounter {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        event.record(&mut MessageVisitor { counter: self });
    }
}

fn counter(message: &'static str) -> (EventCounter, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    (
        EventCounter {
            message,
            hits: Arc::clone(&hits),
        },
        hits,
    )
}

#[test]
fn linking_emits_one_event_per_leaf() {
    let (layer, hits) = counter("leaf_linked");
    let subscriber = Registry::default().with(layer);

    with_default(subscriber, || {
        let config = HeapConfig::new(4096).unwrap();
        let plan = select_layout(&LayoutRequest::new(10_000, 8), &config).unwrap();
        let mut mem = vec![0u8; plan.spine_bytes];
        let spine =
            unsafe { Spine::initialize(NonNull::new(mem.as_mut_ptr()).unwrap(), &plan) };
        let desc = AllocationDescription::new(plan, spine);
        let mut allocator = VecLeafAllocator::new(config.leaf_size);
        attach_leaves(&desc, &mut allocator, &config).unwrap();
    });

    assert_eq!(hits.load(Ordering::SeqCst), 20);
}

#[test]
fn duplicate_mapping_emits_a_warning_event() {
    let (layer, hits) = counter("double_map_duplicate");
    let subscriber = Registry::default().with(layer);

    with_default(subscriber, || {
        let registry = DoubleMapRegistry::new(FakeMapper::new());
        let leaves: Vec<usize> = (0..4).map(|i| 0x10_0000 + 2 * i * 4096).collect();
        registry
            .try_create_mapping(0xA000, &leaves, 4, 4096, 4 * 4096)
            .unwrap();
        let _ = registry.try_create_mapping(0xA000, &leaves, 4, 4096, 4 * 4096);
    });

    assert_eq!(hits.load(Ordering::SeqCst), 1);
}
