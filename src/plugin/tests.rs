use std::sync::atomic::{AtomicUsize, Ordering};

use super::*;
use crate::bind::Bind;
use crate::broker::MemoryBroker;
use crate::schema::Column;

fn schema() -> EntitySchema {
    EntitySchema::builder("UserEntity")
        .column(Column::varchar("Name", 100))
        .build()
        .unwrap()
}

fn event() -> FlushEvent {
    FlushEvent::insert("UserEntity", 1, Bind::new().with("Name", "Tom"))
}

struct Failing;

impl Plugin for Failing {
    fn code(&self) -> &str {
        "failing"
    }

    fn entity_flushing(&self, _event: &mut FlushEvent, _ctx: &FlushingContext<'_>) -> Result<()> {
        Err(OrmError::Validation("rejected".to_string()))
    }

    fn entity_flushed(&self, _event: &FlushEvent, _ctx: &mut FlushedContext<'_>) -> Result<()> {
        Err(OrmError::Validation("broken".to_string()))
    }
}

struct Panicking;

impl Plugin for Panicking {
    fn code(&self) -> &str {
        "panicking"
    }

    fn entity_flushed(&self, _event: &FlushEvent, _ctx: &mut FlushedContext<'_>) -> Result<()> {
        panic!("post-flush bug");
    }
}

#[derive(Default)]
struct Publishing {
    calls: AtomicUsize,
}

impl Plugin for Publishing {
    fn code(&self) -> &str {
        "publishing"
    }

    fn entity_flushed(&self, event: &FlushEvent, ctx: &mut FlushedContext<'_>) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        ctx.publish("default", "events", event.id().to_string());
        Ok(())
    }
}

struct Prefix(&'static str);

impl Plugin for Prefix {
    fn code(&self) -> &str {
        self.0
    }

    fn entity_search(&self, _schema: &EntitySchema, filter: Where) -> Where {
        filter.prepend_condition(&format!("`{}` = 1", self.0), Vec::new())
    }
}

#[test]
fn test_flushing_error_names_plugin() {
    let mut plugins = PluginRegistry::new();
    plugins.register(Arc::new(Failing)).unwrap();
    let schema = schema();
    let meta = MetaData::new();
    let ctx = FlushingContext {
        schema: &schema,
        engine_meta: &meta,
        lazy: false,
    };
    let err = plugins.entity_flushing(&mut event(), &ctx).unwrap_err();
    match err {
        OrmError::Plugin { plugin, message } => {
            assert_eq!(plugin, "failing");
            assert!(message.contains("rejected"));
        }
        other => panic!("unexpected error {:?}", other),
    }
}

#[test]
fn test_flushed_failures_do_not_stop_later_plugins() {
    let publishing = Arc::new(Publishing::default());
    let mut plugins = PluginRegistry::new();
    plugins.register(Arc::new(Failing)).unwrap();
    plugins.register(Arc::new(Panicking)).unwrap();
    plugins.register(publishing.clone()).unwrap();

    let mut buffer = PublishBuffer::default();
    plugins.entity_flushed(&event(), &schema(), &mut buffer);
    assert_eq!(publishing.calls.load(Ordering::SeqCst), 1);
    assert!(!buffer.is_empty());
}

#[test]
fn test_search_rewrites_in_registration_order() {
    let mut plugins = PluginRegistry::new();
    plugins.register(Arc::new(Prefix("A"))).unwrap();
    plugins.register(Arc::new(Prefix("B"))).unwrap();
    let filter = plugins.entity_search(&schema(), Where::new("`Name` = ?", ["Tom"]));
    assert_eq!(filter.query(), "`B` = 1 AND (`A` = 1 AND (`Name` = ?))");
}

#[test]
fn test_duplicate_code_rejected() {
    let mut plugins = PluginRegistry::new();
    plugins.register(Arc::new(Prefix("A"))).unwrap();
    assert!(plugins.register(Arc::new(Prefix("A"))).is_err());
    assert_eq!(plugins.len(), 1);
    assert!(plugins.get("A").is_some());
    assert!(plugins.get("B").is_none());
}

#[tokio::test]
async fn test_publish_buffer_groups_per_stream() {
    let broker = Arc::new(MemoryBroker::new("default"));
    let mut brokers: BTreeMap<String, Arc<dyn Broker>> = BTreeMap::new();
    brokers.insert("default".to_string(), broker.clone());

    let mut buffer = PublishBuffer::default();
    buffer.push("default", "a", "1".to_string());
    buffer.push("default", "b", "2".to_string());
    buffer.push("default", "a", "3".to_string());
    buffer.push("missing", "a", "4".to_string());
    buffer.publish(&brokers).await;

    assert_eq!(broker.messages("a").await, vec!["1", "3"]);
    assert_eq!(broker.messages("b").await, vec!["2"]);
}
