//! Untyped registration boundary.
//!
//! Query builders hand over configuration as raw JSON; this module
//! validates it, compiles the query and returns the live collection.
//! Everything below this layer works with typed IR and typed errors.

use crate::collection::{CollectionOptions, LiveCollection};
use crate::source::CollectionRegistry;
use anyhow::{anyhow, Context, Result};
use rill_protocol::QueryIr;
use serde_json::Value;
use smol_str::SmolStr;
use std::time::Duration;
use tracing::instrument;

/// Parsed registration request data.
pub struct Registration {
    pub id: SmolStr,
    pub query: QueryIr,
    pub gc_time: Option<Duration>,
}

/// Validate a raw registration request:
/// `{ "id": ..., "query": <QueryIr>, "gcTime": <millis>? }`.
#[instrument(skip(config))]
pub fn prepare_registration(config: Value) -> Result<Registration> {
    let id = config
        .get("id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow!("missing or invalid 'id'"))?
        .to_string();

    let query_value = config
        .get("query")
        .cloned()
        .ok_or_else(|| anyhow!("missing 'query'"))?;
    let query: QueryIr = serde_json::from_value(query_value)
        .with_context(|| format!("invalid query IR for {id:?}"))?;

    let gc_time = match config.get("gcTime").or_else(|| config.get("gc_time")) {
        None | Some(Value::Null) => None,
        Some(v) => {
            let millis = v
                .as_u64()
                .ok_or_else(|| anyhow!("invalid 'gcTime' for {id:?}"))?;
            Some(Duration::from_millis(millis))
        }
    };

    Ok(Registration {
        id: SmolStr::new(id),
        query,
        gc_time,
    })
}

/// Compile a raw registration against the registry and hand back the live
/// collection, idle until preloaded or subscribed.
#[instrument(skip(registry, config), fields(query_id))]
pub fn register_query(registry: &CollectionRegistry, config: Value) -> Result<LiveCollection> {
    let registration = prepare_registration(config)?;
    tracing::Span::current().record("query_id", registration.id.as_str());

    let mut options = CollectionOptions {
        id: registration.id.clone(),
        ..Default::default()
    };
    if let Some(gc_time) = registration.gc_time {
        options.gc_time = gc_time;
    }

    LiveCollection::new(registration.query, registry.clone(), options)
        .with_context(|| format!("failed to compile query {:?}", registration.id))
}

#[cfg(test)]
mod service_tests {
    use super::*;
    use crate::source::MemoryCollection;
    use serde_json::json;
    use std::rc::Rc;

    fn registry() -> CollectionRegistry {
        let mut registry = CollectionRegistry::new();
        registry.register(Rc::new(MemoryCollection::new("users")));
        registry
    }

    fn query_json() -> Value {
        json!({
            "from": {"alias": "u", "source": {"type": "collection", "id": "users"}}
        })
    }

    #[test]
    fn test_register_minimal_query() {
        let live = register_query(
            &registry(),
            json!({"id": "q1", "query": query_json(), "gcTime": 250}),
        )
        .unwrap();
        assert!(live.is_empty());
    }

    #[test]
    fn test_missing_id_rejected() {
        let err = register_query(&registry(), json!({"query": query_json()})).unwrap_err();
        assert!(err.to_string().contains("id"));
    }

    #[test]
    fn test_unknown_source_type_rejected() {
        let config = json!({
            "id": "q1",
            "query": {
                "from": {"alias": "u", "source": {"type": "carrier-pigeon", "id": "users"}}
            }
        });
        let err = register_query(&registry(), config).unwrap_err();
        assert!(format!("{err:#}").contains("invalid query IR"));
    }

    #[test]
    fn test_unknown_collection_rejected() {
        let config = json!({
            "id": "q1",
            "query": {
                "from": {"alias": "u", "source": {"type": "collection", "id": "ghosts"}}
            }
        });
        let err = register_query(&registry(), config).unwrap_err();
        assert!(format!("{err:#}").contains("failed to compile"));
    }
}
