//! Change detection.

use crate::entity::Entity;
use crate::error::{OrmError, Result};
use crate::event::FlushEvent;
use crate::schema::EntitySchema;

/// Flush event for the entity's pending change, `None` when it is clean.
///
/// - delete requested: `Delete` with the origin as `before`
/// - not loaded: `Insert` of every column
/// - loaded: `Update` of the columns differing from the origin
pub(crate) fn build_event(schema: &EntitySchema, entity: &dyn Entity) -> Result<Option<FlushEvent>> {
    let orm = entity.orm();
    let name = schema.name();

    if orm.delete {
        if !orm.loaded {
            return Err(OrmError::NotLoaded {
                entity: name.to_string(),
            });
        }
        let before = orm.origin.clone().unwrap_or_else(|| entity.to_bind());
        return Ok(Some(FlushEvent::delete(name, orm.id, before)));
    }

    let current = entity.to_bind();
    if let Some(unknown) = current.keys().find(|column| schema.column(column).is_none()) {
        return Err(OrmError::Validation(format!(
            "entity {} has no column {}",
            name, unknown
        )));
    }

    if !orm.loaded {
        let mut event = FlushEvent::insert(name, orm.id, current);
        event.set_on_duplicate_key_update(orm.on_duplicate_key_update.clone());
        return Ok(Some(event));
    }

    let (before, after) = match &orm.origin {
        Some(origin) => origin.diff(&current),
        None => (crate::bind::Bind::new(), current),
    };
    if after.is_empty() {
        return Ok(None);
    }
    Ok(Some(FlushEvent::update(name, orm.id, before, after)))
}
