//! Entity traits.
//!
//! User types describe themselves through [`EntityType`] (a schema built once
//! at registration) and expose their field values as [`Bind`]s through the
//! object-safe [`Entity`] trait. No runtime reflection is involved.

use crate::bind::Bind;
use crate::error::Result;
use crate::schema::EntitySchema;

/// Per-instance ORM bookkeeping embedded in every entity.
#[derive(Debug, Clone, Default)]
pub struct OrmState {
    pub(crate) id: u64,
    pub(crate) origin: Option<Bind>,
    pub(crate) loaded: bool,
    pub(crate) delete: bool,
    pub(crate) force_delete: bool,
    pub(crate) on_duplicate_key_update: Option<Bind>,
}

impl OrmState {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Set an explicit id on an entity that was not loaded yet.
    pub fn set_id(&mut self, id: u64) {
        self.id = id;
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// The bind captured when the entity was loaded or last flushed.
    pub fn origin(&self) -> Option<&Bind> {
        self.origin.as_ref()
    }

    /// Turn the next insert into `INSERT ... ON DUPLICATE KEY UPDATE`.
    pub fn set_on_duplicate_key_update(&mut self, bind: Bind) {
        self.on_duplicate_key_update = Some(bind);
    }

    pub(crate) fn mark_loaded(&mut self, id: u64, origin: Bind) {
        self.id = id;
        self.loaded = true;
        self.origin = Some(origin);
        self.clear_flags();
    }

    pub(crate) fn mark_deleted(&mut self) {
        self.loaded = false;
        self.origin = None;
        self.clear_flags();
    }

    pub(crate) fn clear_flags(&mut self) {
        self.delete = false;
        self.force_delete = false;
        self.on_duplicate_key_update = None;
    }
}

/// Object-safe view of an entity instance.
pub trait Entity: Send {
    /// Registered entity name, matching [`EntitySchema::name`].
    fn entity_name(&self) -> &'static str;

    fn orm(&self) -> &OrmState;

    fn orm_mut(&mut self) -> &mut OrmState;

    /// Current values of every non-ID column, in declaration order.
    fn to_bind(&self) -> Bind;

    /// Assign column values from a bind. Columns not present are left alone.
    fn apply_bind(&mut self, bind: &Bind) -> Result<()>;

    fn id(&self) -> u64 {
        self.orm().id()
    }

    fn is_loaded(&self) -> bool {
        self.orm().is_loaded()
    }
}

/// Static side of an entity: how to build its schema and a blank instance.
pub trait EntityType: Entity + Default + Sized + 'static {
    const NAME: &'static str;

    fn schema() -> Result<EntitySchema>;
}
