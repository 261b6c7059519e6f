//! Remote Store collaborator
//!
//! The engine never talks to a transport directly. It needs four
//! operations from whatever holds the entities of an environment, and
//! relies on `create`/`update` being idempotent per stable identifier.

use crate::entity::{Entity, EntityKind, Handle};
use crate::error::StoreError;
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

/// Which entities of one kind to list.
#[derive(Debug, Clone, Default)]
pub enum EntityFilter {
    /// Every entity of the kind
    #[default]
    All,
    /// By environment-local handle
    Handles(BTreeSet<Handle>),
    /// By stable identifier
    Uuids(BTreeSet<Uuid>),
    /// Entities listing this owner in `owners` (or `owner`)
    Owner(String),
    /// Display name matches the pattern
    NamePattern(Regex),
}

impl EntityFilter {
    pub fn matches(&self, entity: &Entity) -> bool {
        match self {
            Self::All => true,
            Self::Handles(handles) => entity.handle.is_some_and(|h| handles.contains(&h)),
            Self::Uuids(uuids) => uuids.contains(&entity.uuid),
            Self::Owner(owner) => owners_of(&entity.payload).any(|o| o == owner),
            Self::NamePattern(pattern) => pattern.is_match(&entity.name),
        }
    }
}

fn owners_of(payload: &Map<String, Value>) -> impl Iterator<Item = &str> {
    let many = payload
        .get("owners")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_str);
    let single = payload.get("owner").and_then(Value::as_str);
    many.chain(single)
}

/// Body of a create or update call.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRequest {
    pub uuid: Uuid,
    pub name: String,
    pub payload: Map<String, Value>,
}

impl From<&Entity> for WriteRequest {
    fn from(entity: &Entity) -> Self {
        Self {
            uuid: entity.uuid,
            name: entity.name.clone(),
            payload: entity.payload.clone(),
        }
    }
}

/// The four operations the engine needs from an environment.
pub trait RemoteStore: Send + Sync {
    /// Entities of `kind` matching `filter`, with handles filled in
    fn list(&self, kind: EntityKind, filter: &EntityFilter) -> Result<Vec<Entity>, StoreError>;

    /// One entity by handle
    fn get(&self, kind: EntityKind, handle: Handle) -> Result<Entity, StoreError>;

    /// Create an entity; returns its new handle
    fn create(&self, kind: EntityKind, request: &WriteRequest) -> Result<Handle, StoreError>;

    /// Replace an entity, keeping its stable identifier
    fn update(
        &self,
        kind: EntityKind,
        handle: Handle,
        request: &WriteRequest,
    ) -> Result<(), StoreError>;

    /// Look an entity up by stable identifier
    fn find_by_uuid(&self, kind: EntityKind, uuid: Uuid) -> Result<Option<Entity>, StoreError> {
        let filter = EntityFilter::Uuids(BTreeSet::from([uuid]));
        Ok(self.list(kind, &filter)?.into_iter().next())
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    next_handle: Handle,
    entities: BTreeMap<(EntityKind, Handle), Entity>,
    write_calls: usize,
    failures: HashMap<Uuid, (StoreError, Option<usize>)>,
}

/// A complete in-process Remote Store.
///
/// Handles start at 1 and are never reused. Every `create`/`update` call
/// is counted, successful or not, so tests can assert that no write was
/// issued.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store holding `entities`, keeping handles they already have
    pub fn with_entities(entities: impl IntoIterator<Item = Entity>) -> Self {
        let store = Self::new();
        for entity in entities {
            store.insert(entity);
        }
        store
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Seed an entity without counting a write. Returns its handle.
    pub fn insert(&self, mut entity: Entity) -> Handle {
        let mut state = self.lock();
        let handle = match entity.handle {
            Some(h) => h,
            None => state.next_handle + 1,
        };
        state.next_handle = state.next_handle.max(handle);
        entity.handle = Some(handle);
        state.entities.insert((entity.kind, handle), entity);
        handle
    }

    /// Drop an entity without counting a write
    pub fn remove(&self, kind: EntityKind, handle: Handle) -> Option<Entity> {
        self.lock().entities.remove(&(kind, handle))
    }

    /// Every entity, ordered by kind then handle
    pub fn entities(&self) -> Vec<Entity> {
        self.lock().entities.values().cloned().collect()
    }

    pub fn find(&self, uuid: Uuid) -> Option<Entity> {
        self.lock()
            .entities
            .values()
            .find(|e| e.uuid == uuid)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of create/update calls received
    pub fn write_count(&self) -> usize {
        self.lock().write_calls
    }

    /// Make every write for `uuid` fail with `error`
    pub fn fail_writes_for(&self, uuid: Uuid, error: StoreError) {
        self.lock().failures.insert(uuid, (error, None));
    }

    /// Make the next `times` writes for `uuid` fail with `error`
    pub fn fail_next_writes_for(&self, uuid: Uuid, times: usize, error: StoreError) {
        self.lock().failures.insert(uuid, (error, Some(times)));
    }

    fn injected_failure(state: &mut MemoryState, uuid: Uuid) -> Option<StoreError> {
        let (error, remaining) = state.failures.get_mut(&uuid)?;
        match remaining {
            None => Some(error.clone()),
            Some(0) => None,
            Some(n) => {
                *n -= 1;
                Some(error.clone())
            }
        }
    }

    fn handle_of(state: &MemoryState, kind: EntityKind, uuid: Uuid) -> Option<Handle> {
        state
            .entities
            .iter()
            .find(|((k, _), e)| *k == kind && e.uuid == uuid)
            .map(|((_, h), _)| *h)
    }
}

impl RemoteStore for MemoryStore {
    fn list(&self, kind: EntityKind, filter: &EntityFilter) -> Result<Vec<Entity>, StoreError> {
        Ok(self
            .lock()
            .entities
            .iter()
            .filter(|((k, _), e)| *k == kind && filter.matches(e))
            .map(|(_, e)| e.clone())
            .collect())
    }

    fn get(&self, kind: EntityKind, handle: Handle) -> Result<Entity, StoreError> {
        self.lock()
            .entities
            .get(&(kind, handle))
            .cloned()
            .ok_or(StoreError::NotFound { kind, handle })
    }

    fn create(&self, kind: EntityKind, request: &WriteRequest) -> Result<Handle, StoreError> {
        let mut state = self.lock();
        state.write_calls += 1;
        if let Some(error) = Self::injected_failure(&mut state, request.uuid) {
            return Err(error);
        }

        // Same stable identifier twice is the same entity
        let handle = match Self::handle_of(&state, kind, request.uuid) {
            Some(existing) => existing,
            None => {
                state.next_handle += 1;
                state.next_handle
            }
        };
        let mut entity =
            Entity::with_uuid(request.uuid, kind, &request.name, request.payload.clone());
        entity.handle = Some(handle);
        state.entities.insert((kind, handle), entity);
        Ok(handle)
    }

    fn update(
        &self,
        kind: EntityKind,
        handle: Handle,
        request: &WriteRequest,
    ) -> Result<(), StoreError> {
        let mut state = self.lock();
        state.write_calls += 1;
        if let Some(error) = Self::injected_failure(&mut state, request.uuid) {
            return Err(error);
        }

        let entity = state
            .entities
            .get_mut(&(kind, handle))
            .ok_or(StoreError::NotFound { kind, handle })?;
        if entity.uuid != request.uuid {
            return Err(StoreError::Rejected {
                message: format!(
                    "handle {handle} belongs to {}, not {}",
                    entity.uuid, request.uuid
                ),
            });
        }
        entity.name = request.name.clone();
        entity.payload = request.payload.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn connection(name: &str, owner: &str) -> Entity {
        let payload = json!({ "uri": "sqlite://", "owners": [owner] });
        Entity::new(
            EntityKind::Connection,
            name,
            payload.as_object().cloned().unwrap_or_default(),
        )
    }

    #[test]
    fn test_insert_assigns_handles() {
        let store = MemoryStore::new();
        let a = store.insert(connection("a", "ana"));
        let b = store.insert(connection("b", "ana"));
        assert_eq!((a, b), (1, 2));
        assert_eq!(store.write_count(), 0);
    }

    #[test]
    fn test_filters() {
        let store = MemoryStore::new();
        let first = connection("warehouse", "ana");
        let uuid = first.uuid;
        store.insert(first);
        store.insert(connection("scratch", "bo"));

        let by_owner = store
            .list(EntityKind::Connection, &EntityFilter::Owner("bo".into()))
            .unwrap();
        assert_eq!(by_owner.len(), 1);
        assert_eq!(by_owner[0].name, "scratch");

        let by_name = store
            .list(
                EntityKind::Connection,
                &EntityFilter::NamePattern(Regex::new("^ware").unwrap()),
            )
            .unwrap();
        assert_eq!(by_name[0].uuid, uuid);

        let by_handle = store
            .list(
                EntityKind::Connection,
                &EntityFilter::Handles(BTreeSet::from([2])),
            )
            .unwrap();
        assert_eq!(by_handle[0].name, "scratch");

        assert!(
            store
                .list(EntityKind::Table, &EntityFilter::All)
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn test_create_is_idempotent_per_uuid() {
        let store = MemoryStore::new();
        let entity = connection("warehouse", "ana");
        let request = WriteRequest::from(&entity);
        let first = store.create(EntityKind::Connection, &request).unwrap();
        let second = store.create(EntityKind::Connection, &request).unwrap();
        assert_eq!(first, second);
        assert_eq!(store.len(), 1);
        assert_eq!(store.write_count(), 2);
    }

    #[test]
    fn test_update_checks_identity() {
        let store = MemoryStore::new();
        let handle = store.insert(connection("a", "ana"));
        let other = connection("b", "ana");
        let err = store
            .update(EntityKind::Connection, handle, &WriteRequest::from(&other))
            .unwrap_err();
        assert!(matches!(err, StoreError::Rejected { .. }));
    }

    #[test]
    fn test_injected_failures() {
        let store = MemoryStore::new();
        let entity = connection("a", "ana");
        let request = WriteRequest::from(&entity);
        store.fail_next_writes_for(
            entity.uuid,
            1,
            StoreError::Transient {
                message: "timeout".into(),
            },
        );
        assert!(store.create(EntityKind::Connection, &request).is_err());
        assert!(store.create(EntityKind::Connection, &request).is_ok());
    }

    #[test]
    fn test_find_by_uuid() {
        let store = MemoryStore::new();
        let entity = connection("a", "ana");
        let uuid = entity.uuid;
        store.insert(entity);
        let found = store.find_by_uuid(EntityKind::Connection, uuid).unwrap();
        assert_eq!(found.unwrap().handle, Some(1));
        assert!(
            store
                .find_by_uuid(EntityKind::Table, uuid)
                .unwrap()
                .is_none()
        );
    }
}
