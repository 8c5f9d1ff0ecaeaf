use itertools::Itertools;
use log::debug;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use url::Url;

use crate::error::{ClientError, Result};
use crate::model::{
    ClientModel, Descriptor, EntityDescriptor, EntityHandle, EntityRef, EntityStates, HasCore,
    LinkDescriptor, LinkKey, LinkRef, MergeOption, DETACHED_CHANGE_ORDER,
};

/// Identity map for tracked entities and links.
///
/// Lock order: a map lock may be held while a descriptor lock is taken, never
/// the other way round. The identity map is only ever acquired before the
/// entity map when both are needed.
#[derive(Debug)]
pub struct EntityTracker {
    model: Arc<ClientModel>,
    entity_descriptors: RwLock<HashMap<EntityHandle, EntityRef>>,
    /// Created on first use.
    identity_to_descriptor: OnceLock<RwLock<HashMap<Url, EntityRef>>>,
    /// Created on first use.
    bindings: OnceLock<RwLock<HashMap<LinkKey, LinkRef>>>,
    next_change: AtomicU32,
    next_handle: AtomicU64,
}

impl EntityTracker {
    pub fn new(model: Arc<ClientModel>) -> Self {
        Self {
            model,
            entity_descriptors: RwLock::new(HashMap::new()),
            identity_to_descriptor: OnceLock::new(),
            bindings: OnceLock::new(),
            next_change: AtomicU32::new(0),
            next_handle: AtomicU64::new(0),
        }
    }

    pub fn model(&self) -> &ClientModel {
        &self.model
    }

    pub fn next_handle(&self) -> EntityHandle {
        EntityHandle(self.next_handle.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn identity_map(&self) -> &RwLock<HashMap<Url, EntityRef>> {
        self.identity_to_descriptor.get_or_init(Default::default)
    }

    fn binding_map(&self) -> &RwLock<HashMap<LinkKey, LinkRef>> {
        self.bindings.get_or_init(Default::default)
    }

    // ── Entities ────────────────────────────────────────────────────────

    pub fn try_get_entity_descriptor(&self, handle: EntityHandle) -> Option<EntityRef> {
        self.entity_descriptors.read().get(&handle).cloned()
    }

    pub fn get_entity_descriptor(&self, handle: EntityHandle) -> Result<EntityRef> {
        self.try_get_entity_descriptor(handle).ok_or_else(|| {
            ClientError::invalid_operation(format!(
                "the context is not currently tracking the entity {}",
                handle
            ))
        })
    }

    pub fn try_get_entity_by_identity(&self, identity: &Url) -> Option<EntityRef> {
        self.identity_to_descriptor
            .get()
            .and_then(|map| map.read().get(identity).cloned())
    }

    pub fn add_entity_descriptor(&self, descriptor: EntityDescriptor) -> Result<EntityRef> {
        let handle = descriptor.handle();
        let mut entities = self.entity_descriptors.write();
        if entities.contains_key(&handle) {
            return Err(ClientError::invalid_operation(format!(
                "the context is already tracking the entity {}",
                handle
            )));
        }
        let descriptor = Arc::new(RwLock::new(descriptor));
        entities.insert(handle, descriptor.clone());
        Ok(descriptor)
    }

    /// Detach an entity and every link it takes part in.
    pub fn detach_resource(&self, resource: &EntityRef) -> Result<bool> {
        let (handle, is_added) = {
            let resource = resource.read();
            (resource.handle(), resource.state() == EntityStates::Added)
        };

        let related = self.related_links(handle);
        let plan: Vec<(LinkRef, bool)> = related
            .into_iter()
            .map(|link| {
                let target_delete = is_added && link.read().target() == Some(handle);
                (link, target_delete)
            })
            .collect();

        // Validate every link before touching any of them.
        for (link, target_delete) in &plan {
            self.ensure_link_detachable(link, *target_delete)?;
        }
        for (link, _) in &plan {
            if self.try_remove_link_descriptor(link) {
                link.write().core_mut().mark_detached();
            }
        }

        resource.write().core_mut().mark_detached();
        self.entity_descriptors.write().remove(&handle);
        self.detach_resource_identity(resource);
        debug!("detached entity {} and {} link(s)", handle, plan.len());
        Ok(true)
    }

    fn detach_resource_identity(&self, resource: &EntityRef) {
        let Some(map) = self.identity_to_descriptor.get() else {
            return;
        };
        remove_held_identity(&mut map.write(), resource);
    }

    /// Apply the identity of a successfully inserted or updated entity.
    pub fn attach_identity(
        &self,
        from_response: &EntityDescriptor,
        merge_option: MergeOption,
    ) -> Result<EntityRef> {
        let tracked = self.get_entity_descriptor(from_response.handle())?;
        let identity = from_response.identity().cloned().ok_or_else(|| {
            ClientError::invalid_operation("the response entry does not carry an identity")
        })?;

        {
            let mut identities = self.identity_map().write();
            validate_duplicate_identity(&identities, &identity, &tracked)?;
            remove_held_identity(&mut identities, &tracked);
            {
                let mut tracked = tracked.write();
                tracked.set_identity(Some(identity.clone()));
                tracked.merge_info(from_response, merge_option);
                tracked.merge_transient(merge_option);
                tracked.set_state(EntityStates::Unchanged);
                tracked.properties_to_serialize.clear();
            }
            identities.insert(identity, tracked.clone());
        }

        self.promote_related_end(&tracked);
        Ok(tracked)
    }

    /// Apply `Location`/`OData-EntityId` of an insert response.
    pub fn attach_location(&self, handle: EntityHandle, identity: Url, edit_link: Url) -> Result<()> {
        let tracked = self.get_entity_descriptor(handle)?;

        {
            let mut identities = self.identity_map().write();
            validate_duplicate_identity(&identities, &identity, &tracked)?;
            remove_held_identity(&mut identities, &tracked);
            {
                let mut tracked = tracked.write();
                tracked.set_identity(Some(identity.clone()));
                tracked.edit_link = Some(edit_link);
            }
            identities.insert(identity, tracked.clone());
        }

        self.promote_related_end(&tracked);
        Ok(())
    }

    fn promote_related_end(&self, tracked: &EntityRef) {
        let Some(key) = tracked.read().related_end() else {
            return;
        };
        if let Some(link) = self.binding_map().read().get(&key) {
            link.write().set_state(EntityStates::Unchanged);
        }
    }

    /// Adopt an entity discovered by query materialization.
    pub fn internal_attach_entity_descriptor(
        &self,
        descriptor: EntityDescriptor,
        fail_if_duplicated: bool,
    ) -> Result<EntityRef> {
        let identity = descriptor.identity().cloned().ok_or_else(|| {
            ClientError::invalid_operation("an entity without identity cannot be attached")
        })?;
        let handle = descriptor.handle();

        let mut identities = self.identity_map().write();
        let mut entities = self.entity_descriptors.write();
        let tracked = entities.get(&handle).cloned();
        let existing = identities.get(&identity).cloned();

        if fail_if_duplicated && tracked.is_some() {
            return Err(ClientError::invalid_operation(format!(
                "the context is already tracking the entity {}",
                handle
            )));
        }
        let same = match (&tracked, &existing) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        };
        if !same {
            return Err(different_entity_contained(&identity));
        }
        if let Some(tracked) = tracked {
            return Ok(tracked);
        }

        let mut descriptor = descriptor;
        self.increment_change(&mut descriptor);
        let descriptor = Arc::new(RwLock::new(descriptor));
        entities.insert(handle, descriptor.clone());
        identities.insert(identity, descriptor.clone());
        Ok(descriptor)
    }

    pub fn increment_change<D: HasCore + ?Sized>(&self, descriptor: &mut D) {
        let order = self.next_change.fetch_add(1, Ordering::SeqCst) + 1;
        debug_assert!(order != DETACHED_CHANGE_ORDER);
        descriptor.core_mut().change_order = order;
    }

    pub fn entities(&self) -> Vec<EntityRef> {
        self.entity_descriptors
            .read()
            .iter()
            .sorted_by_key(|(handle, _)| **handle)
            .map(|(_, descriptor)| descriptor.clone())
            .collect()
    }

    // ── Links ───────────────────────────────────────────────────────────

    pub fn links(&self) -> Vec<LinkRef> {
        let Some(bindings) = self.bindings.get() else {
            return Vec::new();
        };
        bindings
            .read()
            .values()
            .cloned()
            .sorted_by_key(|link| link.read().core().change_order)
            .collect()
    }

    pub fn try_get_link_descriptor(
        &self,
        source: EntityHandle,
        source_property: &str,
        target: Option<EntityHandle>,
    ) -> Option<LinkRef> {
        let key = LinkKey::new(source, source_property, target);
        self.bindings
            .get()
            .and_then(|bindings| bindings.read().get(&key).cloned())
    }

    /// Every link on `(source, property)`, whatever the target.
    pub fn get_links(&self, source: EntityHandle, source_property: &str) -> Vec<LinkRef> {
        let Some(bindings) = self.bindings.get() else {
            return Vec::new();
        };
        bindings
            .read()
            .iter()
            .filter(|(key, _)| key.source == source && key.source_property == source_property)
            .map(|(_, link)| link.clone())
            .collect()
    }

    fn related_links(&self, handle: EntityHandle) -> Vec<LinkRef> {
        let Some(bindings) = self.bindings.get() else {
            return Vec::new();
        };
        bindings
            .read()
            .iter()
            .filter(|(key, _)| key.source == handle || key.target == Some(handle))
            .map(|(_, link)| link.clone())
            .collect()
    }

    pub fn add_link(&self, link: LinkDescriptor) -> Result<LinkRef> {
        let key = link.key().clone();
        let mut bindings = self.binding_map().write();
        if bindings.contains_key(&key) {
            return Err(ClientError::invalid_operation(
                "the context is already tracking the relationship",
            ));
        }
        let link = Arc::new(RwLock::new(link));
        bindings.insert(key, link.clone());
        Ok(link)
    }

    /// Remove `link` from the binding map if it is the instance held there.
    pub fn try_remove_link_descriptor(&self, link: &LinkRef) -> bool {
        let key = link.read().key().clone();
        let Some(bindings) = self.bindings.get() else {
            return false;
        };
        let mut bindings = bindings.write();
        match bindings.get(&key) {
            Some(held) if Arc::ptr_eq(held, link) => {
                bindings.remove(&key);
                true
            }
            _ => false,
        }
    }

    fn ensure_link_detachable(&self, link: &LinkRef, target_is_being_deleted: bool) -> Result<()> {
        let (source, target) = {
            let link = link.read();
            (link.source(), link.target())
        };
        let Some(target) = target.and_then(|t| self.try_get_entity_descriptor(t)) else {
            return Ok(());
        };
        let target = target.read();
        if target_is_being_deleted {
            return Ok(());
        }
        match target.parent_for_insert() {
            Some((parent, _)) if parent == source => Err(ClientError::invalid_operation(
                "the link cannot be detached because the target was added through it and has not been saved (child resource exists)",
            )),
            _ => Ok(()),
        }
    }

    pub fn detach_existing_link(&self, link: &LinkRef, target_is_being_deleted: bool) -> Result<()> {
        self.ensure_link_detachable(link, target_is_being_deleted)?;
        if self.try_remove_link_descriptor(link) {
            link.write().core_mut().mark_detached();
        }
        Ok(())
    }

    /// Find the link on a reference property. Returns it when it is to be
    /// kept; a link to a different target is detached and `None` returned.
    pub fn detach_reference_link(
        &self,
        source: EntityHandle,
        source_property: &str,
        target: Option<EntityHandle>,
        merge_option: MergeOption,
    ) -> Result<Option<LinkRef>> {
        let Some(existing) = self.get_links(source, source_property).into_iter().next() else {
            return Ok(None);
        };
        let (existing_target, existing_state) = {
            let link = existing.read();
            (link.target(), link.state())
        };
        if existing_target == target
            || merge_option == MergeOption::AppendOnly
            || (merge_option == MergeOption::PreserveChanges
                && existing_state == EntityStates::Modified)
        {
            return Ok(Some(existing));
        }
        self.detach_existing_link(&existing, false)?;
        Ok(None)
    }

    /// Attach a link reported by the service.
    pub fn attach_link(
        &self,
        source: EntityHandle,
        source_property: &str,
        target: Option<EntityHandle>,
        merge_option: MergeOption,
    ) -> Result<()> {
        let relation: Option<LinkRef> =
            match self.try_get_link_descriptor(source, source_property, target) {
                Some(existing) => {
                    let (state, has_target) = {
                        let link = existing.read();
                        (link.state(), link.target().is_some())
                    };
                    match merge_option {
                        MergeOption::AppendOnly => None,
                        MergeOption::OverwriteChanges => Some(existing),
                        MergeOption::PreserveChanges => match state {
                            EntityStates::Added | EntityStates::Unchanged => Some(existing),
                            EntityStates::Modified if has_target => Some(existing),
                            _ => None,
                        },
                        MergeOption::NoTracking => {
                            return Err(ClientError::invalid_operation(
                                "the context is already tracking the relationship",
                            ))
                        }
                    }
                }
                None => {
                    let type_name = self
                        .get_entity_descriptor(source)?
                        .read()
                        .entity()
                        .type_name
                        .clone();
                    let is_collection = self.model.is_collection(&type_name, source_property)?;
                    let kept = if is_collection {
                        None
                    } else {
                        self.detach_reference_link(source, source_property, target, merge_option)?
                    };
                    match kept {
                        None => {
                            let mut link = LinkDescriptor::new(
                                LinkKey::new(source, source_property, target),
                                EntityStates::Unchanged,
                            );
                            self.increment_change(&mut link);
                            Some(self.add_link(link)?)
                        }
                        Some(existing) => {
                            let state = existing.read().state();
                            let untouched = merge_option == MergeOption::AppendOnly
                                || (merge_option == MergeOption::PreserveChanges
                                    && state == EntityStates::Modified);
                            if untouched {
                                None
                            } else {
                                Some(existing)
                            }
                        }
                    }
                }
            };

        if let Some(relation) = relation {
            relation.write().set_state(EntityStates::Unchanged);
        }
        Ok(())
    }

    // ── Save support ────────────────────────────────────────────────────

    /// Pending entity, link and named-stream descriptors in change order.
    pub fn changed_entries(&self) -> Vec<Descriptor> {
        let entities = self.entities();
        let mut entries: Vec<Descriptor> = Vec::new();
        for entity in &entities {
            entries.push(Descriptor::Entity(entity.clone()));
            let streams: Vec<_> = entity.read().named_streams().cloned().collect();
            entries.extend(streams.into_iter().map(Descriptor::NamedStream));
        }
        entries.extend(self.links().into_iter().map(Descriptor::Link));

        entries
            .into_iter()
            .filter(|d| d.is_modified() && d.change_order() != DETACHED_CHANGE_ORDER)
            .sorted_by_key(|d| d.change_order())
            .collect()
    }
}

fn different_entity_contained(identity: &Url) -> ClientError {
    ClientError::invalid_operation(format!(
        "the context is already tracking a different entity with the identity '{}'",
        identity
    ))
}

fn validate_duplicate_identity(
    identities: &HashMap<Url, EntityRef>,
    identity: &Url,
    descriptor: &EntityRef,
) -> Result<()> {
    let Some(tracked) = identities.get(identity) else {
        return Ok(());
    };
    if Arc::ptr_eq(tracked, descriptor) {
        return Ok(());
    }
    // Deleted or detached holders overlap while a batch is being applied.
    let state = tracked.read().state();
    match state {
        EntityStates::Deleted | EntityStates::Detached => Ok(()),
        _ => Err(different_entity_contained(identity)),
    }
}

/// Drop the map entry for `resource`'s current identity if it still points at it.
fn remove_held_identity(identities: &mut HashMap<Url, EntityRef>, resource: &EntityRef) {
    let Some(identity) = resource.read().identity().cloned() else {
        return;
    };
    if identities
        .get(&identity)
        .map(|held| Arc::ptr_eq(held, resource))
        .unwrap_or(false)
    {
        identities.remove(&identity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ClientEntity, EntityTypeInfo};

    fn model() -> Arc<ClientModel> {
        Arc::new(
            ClientModel::new()
                .with_type(
                    EntityTypeInfo::new("Customer")
                        .entity_set("Customers")
                        .key("Id")
                        .collection("Orders", "Order")
                        .reference("BestFriend", "Customer"),
                )
                .with_type(EntityTypeInfo::new("Order").entity_set("Orders").key("Id")),
        )
    }

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn add(tracker: &EntityTracker, type_name: &str, state: EntityStates) -> EntityRef {
        let handle = tracker.next_handle();
        let mut descriptor =
            EntityDescriptor::new(handle, ClientEntity::new(type_name), None, state);
        tracker.increment_change(&mut descriptor);
        tracker.add_entity_descriptor(descriptor).unwrap()
    }

    fn attach(tracker: &EntityTracker, type_name: &str, identity: &str) -> EntityRef {
        let mut descriptor = EntityDescriptor::new(
            tracker.next_handle(),
            ClientEntity::new(type_name),
            None,
            EntityStates::Unchanged,
        );
        descriptor.set_identity(Some(url(identity)));
        tracker
            .internal_attach_entity_descriptor(descriptor, true)
            .unwrap()
    }

    #[test]
    fn add_and_lookup_by_handle() {
        let tracker = EntityTracker::new(model());
        let customer = add(&tracker, "Customer", EntityStates::Added);
        let handle = customer.read().handle();

        assert!(tracker.try_get_entity_descriptor(handle).is_some());
        assert!(tracker.get_entity_descriptor(EntityHandle(999)).is_err());
        assert!(tracker.try_get_entity_descriptor(EntityHandle(999)).is_none());
    }

    #[test]
    fn adding_the_same_handle_twice_fails() {
        let tracker = EntityTracker::new(model());
        let handle = tracker.next_handle();
        let first = EntityDescriptor::new(handle, ClientEntity::new("Customer"), None, EntityStates::Added);
        let second = EntityDescriptor::new(handle, ClientEntity::new("Customer"), None, EntityStates::Added);

        tracker.add_entity_descriptor(first).unwrap();
        let err = tracker.add_entity_descriptor(second).unwrap_err();
        assert!(err.to_string().contains("already tracking"));
    }

    #[test]
    fn change_order_is_monotonic() {
        let tracker = EntityTracker::new(model());
        let a = add(&tracker, "Customer", EntityStates::Added);
        let b = add(&tracker, "Customer", EntityStates::Added);
        assert!(a.read().core().change_order < b.read().core().change_order);
        assert_eq!(a.read().core().change_order, 1);
    }

    #[test]
    fn detach_resource_clears_maps_and_links() {
        let tracker = EntityTracker::new(model());
        let customer = attach(&tracker, "Customer", "http://svc/Customers(1)");
        let order = attach(&tracker, "Order", "http://svc/Orders(1)");
        let (c, o) = (customer.read().handle(), order.read().handle());
        tracker
            .attach_link(c, "Orders", Some(o), MergeOption::AppendOnly)
            .unwrap();

        assert!(tracker.detach_resource(&customer).unwrap());
        assert_eq!(customer.read().state(), EntityStates::Detached);
        assert_eq!(customer.read().core().change_order, DETACHED_CHANGE_ORDER);
        assert!(tracker.try_get_entity_descriptor(c).is_none());
        assert!(tracker
            .try_get_entity_by_identity(&url("http://svc/Customers(1)"))
            .is_none());
        assert!(tracker.links().is_empty());
    }

    #[test]
    fn append_only_attach_link_keeps_added_link() {
        let tracker = EntityTracker::new(model());
        let customer = attach(&tracker, "Customer", "http://svc/Customers(1)");
        let order = attach(&tracker, "Order", "http://svc/Orders(1)");
        let (c, o) = (customer.read().handle(), order.read().handle());

        let mut added = LinkDescriptor::new(LinkKey::new(c, "Orders", Some(o)), EntityStates::Added);
        tracker.increment_change(&mut added);
        let original = tracker.add_link(added).unwrap();

        tracker.attach_link(c, "Orders", Some(o), MergeOption::AppendOnly).unwrap();
        tracker.attach_link(c, "Orders", Some(o), MergeOption::AppendOnly).unwrap();

        let links = tracker.links();
        assert_eq!(links.len(), 1);
        assert!(Arc::ptr_eq(&links[0], &original));
        assert_eq!(original.read().state(), EntityStates::Added);
    }

    #[test]
    fn overwrite_attach_link_resets_existing_state() {
        let tracker = EntityTracker::new(model());
        let customer = attach(&tracker, "Customer", "http://svc/Customers(1)");
        let order = attach(&tracker, "Order", "http://svc/Orders(1)");
        let (c, o) = (customer.read().handle(), order.read().handle());
        let link = tracker
            .add_link(LinkDescriptor::new(LinkKey::new(c, "Orders", Some(o)), EntityStates::Deleted))
            .unwrap();

        tracker.attach_link(c, "Orders", Some(o), MergeOption::PreserveChanges).unwrap();
        assert_eq!(link.read().state(), EntityStates::Deleted);

        tracker.attach_link(c, "Orders", Some(o), MergeOption::OverwriteChanges).unwrap();
        assert_eq!(link.read().state(), EntityStates::Unchanged);

        let err = tracker
            .attach_link(c, "Orders", Some(o), MergeOption::NoTracking)
            .unwrap_err();
        assert!(err.to_string().contains("relationship"));
    }

    #[test]
    fn reference_link_is_replaced_unless_append_only() {
        let tracker = EntityTracker::new(model());
        let a = attach(&tracker, "Customer", "http://svc/Customers(1)");
        let b = attach(&tracker, "Customer", "http://svc/Customers(2)");
        let c = attach(&tracker, "Customer", "http://svc/Customers(3)");
        let (a, b, c) = (a.read().handle(), b.read().handle(), c.read().handle());

        tracker.attach_link(a, "BestFriend", Some(b), MergeOption::OverwriteChanges).unwrap();
        tracker.attach_link(a, "BestFriend", Some(c), MergeOption::AppendOnly).unwrap();
        let links = tracker.get_links(a, "BestFriend");
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].read().target(), Some(b));

        tracker.attach_link(a, "BestFriend", Some(c), MergeOption::OverwriteChanges).unwrap();
        let links = tracker.get_links(a, "BestFriend");
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].read().target(), Some(c));
        assert_eq!(links[0].read().state(), EntityStates::Unchanged);
    }

    #[test]
    fn deep_inserted_child_cannot_be_orphaned() {
        let tracker = EntityTracker::new(model());
        let customer = attach(&tracker, "Customer", "http://svc/Customers(1)");
        let c = customer.read().handle();

        let handle = tracker.next_handle();
        let mut order = EntityDescriptor::new(handle, ClientEntity::new("Order"), None, EntityStates::Added);
        order.set_parent_for_insert(c, "Orders");
        tracker.increment_change(&mut order);
        let order = tracker.add_entity_descriptor(order).unwrap();
        let mut link = LinkDescriptor::new(LinkKey::new(c, "Orders", Some(handle)), EntityStates::Added);
        tracker.increment_change(&mut link);
        let link = tracker.add_link(link).unwrap();

        let err = tracker.detach_existing_link(&link, false).unwrap_err();
        assert!(err.to_string().contains("child resource exists"));
        assert_eq!(link.read().state(), EntityStates::Added);

        let err = tracker.detach_resource(&customer).unwrap_err();
        assert!(err.to_string().contains("child resource exists"));
        assert_eq!(customer.read().state(), EntityStates::Unchanged);
        assert_eq!(tracker.links().len(), 1);

        // Detaching the child itself is allowed.
        assert!(tracker.detach_resource(&order).unwrap());
        assert!(tracker.links().is_empty());
        assert_eq!(link.read().state(), EntityStates::Detached);
    }

    #[test]
    fn attach_identity_rejects_live_duplicate_and_tolerates_deleted_holder() {
        let tracker = EntityTracker::new(model());
        let existing = attach(&tracker, "Customer", "http://svc/Customers(1)");
        let added = add(&tracker, "Customer", EntityStates::Added);

        let mut from_response = EntityDescriptor::new(
            added.read().handle(),
            ClientEntity::new("Customer"),
            None,
            EntityStates::Unchanged,
        );
        from_response.set_identity(Some(url("http://svc/Customers(1)")));

        let err = tracker
            .attach_identity(&from_response, MergeOption::OverwriteChanges)
            .unwrap_err();
        assert!(err.to_string().contains("different entity"));
        assert_eq!(added.read().state(), EntityStates::Added);

        existing.write().set_state(EntityStates::Deleted);
        tracker
            .attach_identity(&from_response, MergeOption::OverwriteChanges)
            .unwrap();
        assert_eq!(added.read().state(), EntityStates::Unchanged);
        let held = tracker
            .try_get_entity_by_identity(&url("http://svc/Customers(1)"))
            .unwrap();
        assert!(Arc::ptr_eq(&held, &added));
    }

    #[test]
    fn attach_identity_promotes_deep_insert_link() {
        let tracker = EntityTracker::new(model());
        let customer = attach(&tracker, "Customer", "http://svc/Customers(1)");
        let c = customer.read().handle();
        let handle = tracker.next_handle();
        let mut order = EntityDescriptor::new(handle, ClientEntity::new("Order"), None, EntityStates::Added);
        order.set_parent_for_insert(c, "Orders");
        order.properties_to_serialize.insert("Total".to_string());
        let order = tracker.add_entity_descriptor(order).unwrap();
        let link = tracker
            .add_link(LinkDescriptor::new(LinkKey::new(c, "Orders", Some(handle)), EntityStates::Added))
            .unwrap();

        let mut from_response = EntityDescriptor::new(handle, ClientEntity::new("Order"), None, EntityStates::Unchanged);
        from_response.set_identity(Some(url("http://svc/Orders(7)")));
        from_response.etag = Some("W/\"1\"".to_string());
        tracker
            .attach_identity(&from_response, MergeOption::OverwriteChanges)
            .unwrap();

        assert_eq!(link.read().state(), EntityStates::Unchanged);
        let order = order.read();
        assert_eq!(order.state(), EntityStates::Unchanged);
        assert!(!order.is_deep_insert());
        assert!(order.properties_to_serialize.is_empty());
        assert_eq!(order.etag.as_deref(), Some("W/\"1\""));
    }

    #[test]
    fn internal_attach_detects_duplicates() {
        let tracker = EntityTracker::new(model());
        let first = attach(&tracker, "Customer", "http://svc/Customers(1)");
        let handle = first.read().handle();

        let mut again = EntityDescriptor::new(handle, ClientEntity::new("Customer"), None, EntityStates::Unchanged);
        again.set_identity(Some(url("http://svc/Customers(1)")));
        assert!(tracker.internal_attach_entity_descriptor(again, true).is_err());

        let mut same = EntityDescriptor::new(handle, ClientEntity::new("Customer"), None, EntityStates::Unchanged);
        same.set_identity(Some(url("http://svc/Customers(1)")));
        let resolved = tracker.internal_attach_entity_descriptor(same, false).unwrap();
        assert!(Arc::ptr_eq(&resolved, &first));

        let mut other = EntityDescriptor::new(
            tracker.next_handle(),
            ClientEntity::new("Customer"),
            None,
            EntityStates::Unchanged,
        );
        other.set_identity(Some(url("http://svc/Customers(1)")));
        let err = tracker.internal_attach_entity_descriptor(other, false).unwrap_err();
        assert!(err.to_string().contains("different entity"));
    }

    #[test]
    fn concurrent_attach_keeps_identities_unique() {
        let tracker = Arc::new(EntityTracker::new(model()));
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let tracker = tracker.clone();
                std::thread::spawn(move || {
                    let mut results = Vec::new();
                    // Every thread races on the same 20 identities.
                    for n in 0..20 {
                        let mut descriptor = EntityDescriptor::new(
                            tracker.next_handle(),
                            ClientEntity::new("Customer"),
                            None,
                            EntityStates::Unchanged,
                        );
                        descriptor.set_identity(Some(url(&format!("http://svc/Customers({})", n))));
                        results.push(tracker.internal_attach_entity_descriptor(descriptor, true).is_ok());
                    }
                    results
                })
            })
            .collect();

        let wins: usize = threads
            .into_iter()
            .map(|t| t.join().unwrap().into_iter().filter(|ok| *ok).count())
            .sum();
        assert_eq!(wins, 20);
        assert_eq!(tracker.entities().len(), 20);
    }

    #[test]
    fn concurrent_attach_identity_keeps_identities_unique() {
        let tracker = Arc::new(EntityTracker::new(model()));
        let added: Vec<EntityRef> = (0..8)
            .map(|_| add(&tracker, "Customer", EntityStates::Added))
            .collect();
        let barrier = Arc::new(std::sync::Barrier::new(added.len()));

        let threads: Vec<_> = added
            .iter()
            .map(|descriptor| {
                let tracker = tracker.clone();
                let barrier = barrier.clone();
                let handle = descriptor.read().handle();
                std::thread::spawn(move || {
                    let mut from_response = EntityDescriptor::new(
                        handle,
                        ClientEntity::new("Customer"),
                        None,
                        EntityStates::Unchanged,
                    );
                    from_response.set_identity(Some(url("http://svc/Customers(7)")));
                    barrier.wait();
                    tracker
                        .attach_identity(&from_response, MergeOption::AppendOnly)
                        .ok()
                })
            })
            .collect();

        let winners: Vec<EntityRef> = threads
            .into_iter()
            .filter_map(|t| t.join().unwrap())
            .collect();
        assert_eq!(winners.len(), 1);

        let held = tracker
            .try_get_entity_by_identity(&url("http://svc/Customers(7)"))
            .unwrap();
        assert!(Arc::ptr_eq(&held, &winners[0]));
        let unchanged = added
            .iter()
            .filter(|d| d.read().state() == EntityStates::Unchanged)
            .count();
        assert_eq!(unchanged, 1);
        let with_identity = added.iter().filter(|d| d.read().identity().is_some()).count();
        assert_eq!(with_identity, 1);
    }

    #[test]
    fn changed_entries_are_ordered_and_skip_unchanged() {
        let tracker = EntityTracker::new(model());
        let unchanged = attach(&tracker, "Customer", "http://svc/Customers(1)");
        let added = add(&tracker, "Customer", EntityStates::Added);
        {
            let mut guard = unchanged.write();
            guard.set_state(EntityStates::Modified);
            tracker.increment_change(&mut *guard);
        }

        let entries = tracker.changed_entries();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].as_entity().map(|e| Arc::ptr_eq(e, &added)).unwrap());
        assert!(entries[1].as_entity().map(|e| Arc::ptr_eq(e, &unchanged)).unwrap());
    }
}
