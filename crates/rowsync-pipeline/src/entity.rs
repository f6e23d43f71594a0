//! Target entities
//!
//! Integrators describe their domain types by implementing [`Entity`]. Row
//! parsers yield them as `Box<dyn TargetEntity>`, and the apply engine works
//! through the type-erased [`EntityKind`] found in an [`EntityRegistry`].
//!
//! # Example
//!
//! ```
//! use rowsync_pipeline::entity::{Entity, ForeignKey, ForeignRef};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! struct Contact {
//!     email: String,
//!     company_id: Option<ForeignRef>,
//! }
//!
//! impl Entity for Contact {
//!     const TYPE: &'static str = "contact";
//!     const TABLE: &'static str = "contacts";
//!     const UNIQUE_KEY: &'static str = "email";
//!
//!     fn unique_key(&self) -> Option<String> {
//!         Some(self.email.clone())
//!     }
//!
//!     fn foreign_entity_keys() -> Vec<ForeignKey> {
//!         vec![ForeignKey::new("company", "company_id")]
//!     }
//! }
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::error::EntityError;
use crate::models::{TargetId, Values};

/// A referenced entity type and the local attribute holding its unique key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ForeignKey {
    pub entity_type: String,
    pub attribute: String,
}

impl ForeignKey {
    pub fn new(entity_type: impl Into<String>, attribute: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            attribute: attribute.into(),
        }
    }
}

/// Value of a foreign attribute: the referenced unique key until apply
/// resolves it to the target id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ForeignRef {
    Id(TargetId),
    Key(String),
}

/// A domain type the pipeline can create and update.
///
/// Serialization produces the column map written to `TABLE`; the primary key
/// column is never part of it.
pub trait Entity: Serialize + DeserializeOwned + fmt::Debug + Send + Sync + 'static {
    /// Stable type name stored in `parsed_rows.target_type`
    const TYPE: &'static str;

    const TABLE: &'static str = Self::TYPE;

    const PRIMARY_KEY: &'static str = "id";

    /// Column holding the business key
    const UNIQUE_KEY: &'static str;

    /// SQL expression over the table's columns yielding the text of
    /// [`unique_key`](Entity::unique_key), for keys that are not a plain copy of
    /// `UNIQUE_KEY` (`lower(email)`, `company_id::text || '/' || code`).
    const UNIQUE_KEY_SQL: Option<&'static str> = None;

    fn unique_key(&self) -> Option<String>;

    /// Target id when the parser matched an already stored entity
    fn id(&self) -> Option<TargetId> {
        None
    }

    fn foreign_entity_keys() -> Vec<ForeignKey> {
        Vec::new()
    }
}

/// Object-safe view of an [`Entity`] as yielded by row parsers
pub trait TargetEntity: fmt::Debug + Send + Sync {
    fn entity_type(&self) -> &str;

    fn unique_key_name(&self) -> &str;

    fn unique_key(&self) -> Option<String>;

    fn target_id(&self) -> Option<TargetId>;

    fn foreign_entity_keys(&self) -> Vec<ForeignKey>;

    /// Column map without the primary key
    fn values(&self) -> Result<Values, EntityError>;
}

impl<T: Entity> TargetEntity for T {
    fn entity_type(&self) -> &str {
        T::TYPE
    }

    fn unique_key_name(&self) -> &str {
        T::UNIQUE_KEY
    }

    fn unique_key(&self) -> Option<String> {
        Entity::unique_key(self)
    }

    fn target_id(&self) -> Option<TargetId> {
        self.id()
    }

    fn foreign_entity_keys(&self) -> Vec<ForeignKey> {
        T::foreign_entity_keys()
    }

    fn values(&self) -> Result<Values, EntityError> {
        match serde_json::to_value(self)? {
            serde_json::Value::Object(mut map) => {
                map.remove(T::PRIMARY_KEY);
                Ok(map)
            },
            _ => Err(EntityError::NotAnObject(T::TYPE.to_string())),
        }
    }
}

/// Storage description of one entity type, used by apply and the target store
pub trait EntityKind: Send + Sync {
    fn entity_type(&self) -> &str;

    fn table(&self) -> &str;

    fn primary_key(&self) -> &str;

    fn unique_key_name(&self) -> &str;

    fn unique_key_sql(&self) -> Option<&str>;

    fn foreign_entity_keys(&self) -> Vec<ForeignKey>;

    /// Rebuild a candidate entity from stored values
    fn materialize(&self, values: &Values) -> Result<Box<dyn TargetEntity>, EntityError>;

    /// Unique key of a stored target row, as [`TargetEntity::unique_key`]
    /// computes it. Rows that no longer materialize fall back to the text of
    /// the key column.
    fn stored_unique_key(&self, values: &Values) -> Option<String> {
        match self.materialize(values) {
            Ok(entity) => entity.unique_key(),
            Err(_) => values.get(self.unique_key_name()).and_then(key_text),
        }
    }
}

/// [`EntityKind`] for a concrete [`Entity`] type
pub struct KindOf<T>(PhantomData<fn() -> T>);

impl<T> KindOf<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for KindOf<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Entity> EntityKind for KindOf<T> {
    fn entity_type(&self) -> &str {
        T::TYPE
    }

    fn table(&self) -> &str {
        T::TABLE
    }

    fn primary_key(&self) -> &str {
        T::PRIMARY_KEY
    }

    fn unique_key_name(&self) -> &str {
        T::UNIQUE_KEY
    }

    fn unique_key_sql(&self) -> Option<&str> {
        T::UNIQUE_KEY_SQL
    }

    fn foreign_entity_keys(&self) -> Vec<ForeignKey> {
        T::foreign_entity_keys()
    }

    fn materialize(&self, values: &Values) -> Result<Box<dyn TargetEntity>, EntityError> {
        let entity: T = serde_json::from_value(serde_json::Value::Object(values.clone()))
            .map_err(|source| EntityError::Materialize {
                entity_type: T::TYPE.to_string(),
                source,
            })?;
        Ok(Box::new(entity))
    }
}

/// Entity kinds known to the apply engine, by type name
#[derive(Clone, Default)]
pub struct EntityRegistry {
    kinds: HashMap<String, Arc<dyn EntityKind>>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: Entity>(&mut self) -> &mut Self {
        self.kinds
            .insert(T::TYPE.to_string(), Arc::new(KindOf::<T>::new()));
        self
    }

    pub fn with<T: Entity>(mut self) -> Self {
        self.register::<T>();
        self
    }

    pub fn get(&self, entity_type: &str) -> Option<Arc<dyn EntityKind>> {
        self.kinds.get(entity_type).cloned()
    }

    pub fn require(&self, entity_type: &str) -> Result<Arc<dyn EntityKind>, EntityError> {
        self.get(entity_type)
            .ok_or_else(|| EntityError::UnknownType(entity_type.to_string()))
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }
}

impl fmt::Debug for EntityRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<&str> = self.kinds.keys().map(String::as_str).collect();
        types.sort_unstable();
        f.debug_struct("EntityRegistry").field("types", &types).finish()
    }
}

/// Unique key text of a stored attribute.
///
/// Only strings are treated as unresolved keys; numbers already are target ids.
pub fn reference_key(value: &serde_json::Value) -> Option<&str> {
    match value {
        serde_json::Value::String(key) if !key.is_empty() => Some(key),
        _ => None,
    }
}

/// Text form of a key column value
pub fn key_text(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(text) => Some(text.clone()),
        serde_json::Value::Number(number) => Some(number.to_string()),
        serde_json::Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}
