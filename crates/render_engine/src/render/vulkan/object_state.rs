//! Per-object descriptor bookkeeping
//!
//! Each drawable object owns one descriptor set per frame slot. For every
//! (binding, frame slot) pair a [`BindingStamp`] records which resource
//! generation was last written into that set, so an update only writes the
//! bindings whose backing data actually changed. Stamps for GPU copies also
//! carry the copy's registry key, so a destroyed and re-created resource never
//! matches a stamp written for its predecessor.
//!
//! ```text
//! unallocated -> acquired (stamps INVALID) -> bound (stamps current) -> released
//! ```
//!
//! The table holds no Vulkan handles of its own beyond the opaque set handles
//! it is given; the shader owning the descriptor pool does the driver work.

use ash::vk;

use super::context::{VulkanError, VulkanResult};
use crate::render::types::{ObjectId, INVALID_ID};

/// Number of bindings in the object descriptor set
pub const OBJECT_BINDING_COUNT: usize = 2;

/// Binding 0: per-object uniform block
pub const OBJECT_UNIFORM_BINDING: usize = 0;

/// Binding 1: diffuse combined image sampler
pub const DIFFUSE_SAMPLER_BINDING: usize = 1;

/// Identity and generation of the resource last written into a binding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindingStamp {
    /// Resource id
    pub id: u32,
    /// Resource generation
    pub generation: u32,
    /// Registry key of the GPU copy, 0 when the resource has none of its own
    pub resource: u64,
}

impl BindingStamp {
    /// Never written
    pub const INVALID: Self = Self {
        id: INVALID_ID,
        generation: INVALID_ID,
        resource: 0,
    };

    /// Stamp for a resource
    pub const fn new(id: u32, generation: u32) -> Self {
        Self {
            id,
            generation,
            resource: 0,
        }
    }

    /// Same stamp, tied to the GPU copy registered under `resource`
    pub const fn with_resource(self, resource: u64) -> Self {
        Self { resource, ..self }
    }

    /// Whether anything has been written yet
    pub fn is_valid(&self) -> bool {
        self.generation != INVALID_ID
    }
}

/// Which bindings of which set need a descriptor write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WritePlan {
    /// Descriptor set for the frame slot
    pub set: vk::DescriptorSet,
    /// Uniform binding is stale
    pub write_uniform: bool,
    /// Sampler binding is stale
    pub write_texture: bool,
}

impl WritePlan {
    /// Number of descriptor writes this plan issues
    pub fn write_count(&self) -> usize {
        usize::from(self.write_uniform) + usize::from(self.write_texture)
    }
}

#[derive(Debug, Clone)]
struct ObjectSlot {
    sets: Vec<vk::DescriptorSet>,
    // stamps[binding][frame]
    stamps: [Vec<BindingStamp>; OBJECT_BINDING_COUNT],
}

impl ObjectSlot {
    fn new(frame_count: usize) -> Self {
        Self {
            sets: Vec::new(),
            stamps: [
                vec![BindingStamp::INVALID; frame_count],
                vec![BindingStamp::INVALID; frame_count],
            ],
        }
    }

    fn invalidate(&mut self, frame_count: usize) {
        for stamps in &mut self.stamps {
            stamps.clear();
            stamps.resize(frame_count, BindingStamp::INVALID);
        }
    }
}

/// Object id allocator plus per-binding freshness tracking
#[derive(Debug)]
pub struct ObjectStateTable {
    slots: Vec<Option<ObjectSlot>>,
    next_id: u32,
    free_ids: Vec<u32>,
    max_objects: u32,
    frame_count: usize,
}

impl ObjectStateTable {
    /// Empty table for `max_objects` objects and `frame_count` frame slots
    pub fn new(max_objects: u32, frame_count: usize) -> Self {
        Self {
            slots: Vec::new(),
            next_id: 0,
            free_ids: Vec::new(),
            max_objects,
            frame_count,
        }
    }

    /// Reserve an id, reusing released ids before growing the counter
    pub fn reserve(&mut self) -> VulkanResult<ObjectId> {
        let id = if let Some(id) = self.free_ids.pop() {
            id
        } else if self.next_id < self.max_objects {
            let id = self.next_id;
            self.next_id += 1;
            id
        } else {
            return Err(VulkanError::CapacityExceeded {
                max: self.max_objects as usize,
            });
        };

        let index = id as usize;
        if self.slots.len() <= index {
            self.slots.resize(index + 1, None);
        }
        self.slots[index] = Some(ObjectSlot::new(self.frame_count));
        Ok(ObjectId(id))
    }

    /// Give a reserved id back without it ever having had sets
    pub fn unreserve(&mut self, id: ObjectId) {
        if self.take_slot(id).is_ok() {
            self.free_ids.push(id.0);
        }
    }

    /// Attach the per-frame descriptor sets allocated for `id`
    pub fn attach_sets(&mut self, id: ObjectId, sets: Vec<vk::DescriptorSet>) -> VulkanResult<()> {
        let frame_count = self.frame_count;
        let slot = self.slot_mut(id)?;
        slot.sets = sets;
        slot.invalidate(frame_count);
        Ok(())
    }

    /// Release `id`: its sets are handed back for freeing and the id becomes reusable
    pub fn release(&mut self, id: ObjectId) -> VulkanResult<Vec<vk::DescriptorSet>> {
        let slot = self.take_slot(id)?;
        self.free_ids.push(id.0);
        Ok(slot.sets)
    }

    /// Decide which bindings of `id`'s set for `frame` must be written
    pub fn plan_writes(
        &self,
        id: ObjectId,
        frame: usize,
        uniform: BindingStamp,
        texture: BindingStamp,
    ) -> VulkanResult<WritePlan> {
        let slot = self.slot(id)?;
        let set = slot.sets.get(frame).copied().ok_or_else(|| VulkanError::InvalidOperation {
            reason: format!("Object {} has no descriptor set for frame {frame}", id.0),
        })?;

        Ok(WritePlan {
            set,
            write_uniform: slot.stamps[OBJECT_UNIFORM_BINDING][frame] != uniform,
            write_texture: slot.stamps[DIFFUSE_SAMPLER_BINDING][frame] != texture,
        })
    }

    /// Record that the writes of `plan` were issued
    pub fn commit(
        &mut self,
        id: ObjectId,
        frame: usize,
        plan: &WritePlan,
        uniform: BindingStamp,
        texture: BindingStamp,
    ) -> VulkanResult<()> {
        let slot = self.slot_mut(id)?;
        if plan.write_uniform {
            slot.stamps[OBJECT_UNIFORM_BINDING][frame] = uniform;
        }
        if plan.write_texture {
            slot.stamps[DIFFUSE_SAMPLER_BINDING][frame] = texture;
        }
        Ok(())
    }

    /// Stamp currently stored for (`binding`, `frame`)
    pub fn stamp(&self, id: ObjectId, binding: usize, frame: usize) -> Option<BindingStamp> {
        self.slot(id).ok()?.stamps.get(binding)?.get(frame).copied()
    }

    /// Change the frame slot count; every live object's stamps are invalidated
    pub fn set_frame_count(&mut self, frame_count: usize) {
        self.frame_count = frame_count;
        for slot in self.slots.iter_mut().flatten() {
            slot.invalidate(frame_count);
        }
    }

    /// Swap in freshly allocated sets for `id`, returning the old ones
    pub fn replace_sets(&mut self, id: ObjectId, sets: Vec<vk::DescriptorSet>) -> VulkanResult<Vec<vk::DescriptorSet>> {
        let frame_count = self.frame_count;
        let slot = self.slot_mut(id)?;
        let old = std::mem::replace(&mut slot.sets, sets);
        slot.invalidate(frame_count);
        Ok(old)
    }

    /// Ids currently acquired
    pub fn live_ids(&self) -> Vec<ObjectId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .filter_map(|(index, _)| u32::try_from(index).ok().map(ObjectId))
            .collect()
    }

    /// Number of live objects
    pub fn live_count(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    /// Configured maximum
    pub fn max_objects(&self) -> u32 {
        self.max_objects
    }

    /// Current frame slot count
    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    fn slot(&self, id: ObjectId) -> VulkanResult<&ObjectSlot> {
        self.slots
            .get(id.0 as usize)
            .and_then(Option::as_ref)
            .ok_or(VulkanError::InvalidObjectId { id: id.0 })
    }

    fn slot_mut(&mut self, id: ObjectId) -> VulkanResult<&mut ObjectSlot> {
        self.slots
            .get_mut(id.0 as usize)
            .and_then(Option::as_mut)
            .ok_or(VulkanError::InvalidObjectId { id: id.0 })
    }

    fn take_slot(&mut self, id: ObjectId) -> VulkanResult<ObjectSlot> {
        self.slots
            .get_mut(id.0 as usize)
            .and_then(Option::take)
            .ok_or(VulkanError::InvalidObjectId { id: id.0 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn sets(base: u64, count: usize) -> Vec<vk::DescriptorSet> {
        (0..count as u64).map(|i| vk::DescriptorSet::from_raw(base + i + 1)).collect()
    }

    fn acquire(table: &mut ObjectStateTable) -> ObjectId {
        let id = table.reserve().unwrap();
        let frames = table.frame_count();
        table.attach_sets(id, sets(u64::from(id.0) * 100, frames)).unwrap();
        id
    }

    #[test]
    fn test_acquire_starts_with_invalid_stamps() {
        let mut table = ObjectStateTable::new(4, 3);
        let id = acquire(&mut table);
        for binding in 0..OBJECT_BINDING_COUNT {
            for frame in 0..3 {
                assert_eq!(table.stamp(id, binding, frame), Some(BindingStamp::INVALID));
            }
        }

        let plan = table
            .plan_writes(id, 0, BindingStamp::new(id.0, 0), BindingStamp::new(7, 0))
            .unwrap();
        assert!(plan.write_uniform);
        assert!(plan.write_texture);
    }

    #[test]
    fn test_second_update_issues_no_writes() {
        let mut table = ObjectStateTable::new(4, 2);
        let id = acquire(&mut table);
        let uniform = BindingStamp::new(id.0, 0);
        let texture = BindingStamp::new(3, 1);

        let first = table.plan_writes(id, 1, uniform, texture).unwrap();
        assert_eq!(first.write_count(), 2);
        table.commit(id, 1, &first, uniform, texture).unwrap();

        let second = table.plan_writes(id, 1, uniform, texture).unwrap();
        assert_eq!(second.write_count(), 0);
        assert_eq!(second.set, first.set);

        // other frame slot is tracked separately
        assert_eq!(table.plan_writes(id, 0, uniform, texture).unwrap().write_count(), 2);
    }

    #[test]
    fn test_texture_reload_rewrites_only_sampler() {
        let mut table = ObjectStateTable::new(4, 1);
        let id = acquire(&mut table);
        let uniform = BindingStamp::new(id.0, 0);
        let plan = table.plan_writes(id, 0, uniform, BindingStamp::new(3, 0)).unwrap();
        table.commit(id, 0, &plan, uniform, BindingStamp::new(3, 0)).unwrap();

        let reloaded = table.plan_writes(id, 0, uniform, BindingStamp::new(3, 1)).unwrap();
        assert!(!reloaded.write_uniform);
        assert!(reloaded.write_texture);

        let swapped = table.plan_writes(id, 0, uniform, BindingStamp::new(4, 0)).unwrap();
        assert!(swapped.write_texture);
    }

    #[test]
    fn test_recreated_texture_copy_rewrites_sampler() {
        let mut table = ObjectStateTable::new(4, 2);
        let id = acquire(&mut table);
        let uniform = BindingStamp::new(id.0, 0);
        let first_copy = BindingStamp::new(1, 0).with_resource(11);
        let plan = table.plan_writes(id, 0, uniform, first_copy).unwrap();
        table.commit(id, 0, &plan, uniform, first_copy).unwrap();

        // same texture id and generation, new GPU copy after destroy and create
        let second_copy = BindingStamp::new(1, 0).with_resource(12);
        let plan = table.plan_writes(id, 0, uniform, second_copy).unwrap();
        assert!(!plan.write_uniform);
        assert!(plan.write_texture);

        // two textures sharing an id but registered separately never alias
        assert_ne!(BindingStamp::new(0, 3).with_resource(5), BindingStamp::new(0, 3).with_resource(6));
    }

    #[test]
    fn test_capacity_error_keeps_existing_objects() {
        let mut table = ObjectStateTable::new(2, 2);
        let a = acquire(&mut table);
        let b = acquire(&mut table);

        let err = table.reserve().unwrap_err();
        assert!(matches!(err, VulkanError::CapacityExceeded { max: 2 }));
        assert!(!err.is_fatal());

        assert_eq!(table.live_ids(), vec![a, b]);
        assert!(table.plan_writes(a, 0, BindingStamp::INVALID, BindingStamp::INVALID).is_ok());
        assert!(table.plan_writes(b, 1, BindingStamp::INVALID, BindingStamp::INVALID).is_ok());
    }

    #[test]
    fn test_released_ids_are_reused() {
        let mut table = ObjectStateTable::new(2, 1);
        let a = acquire(&mut table);
        let _b = acquire(&mut table);

        let freed = table.release(a).unwrap();
        assert_eq!(freed.len(), 1);
        assert_eq!(table.live_count(), 1);

        let c = table.reserve().unwrap();
        assert_eq!(c, a);
        assert_eq!(table.stamp(c, OBJECT_UNIFORM_BINDING, 0), Some(BindingStamp::INVALID));
    }

    #[test]
    fn test_unknown_ids_are_rejected() {
        let mut table = ObjectStateTable::new(2, 1);
        let id = acquire(&mut table);
        table.release(id).unwrap();

        assert!(matches!(table.release(id), Err(VulkanError::InvalidObjectId { id: 0 })));
        assert!(matches!(
            table.plan_writes(ObjectId(9), 0, BindingStamp::INVALID, BindingStamp::INVALID),
            Err(VulkanError::InvalidObjectId { id: 9 })
        ));
    }

    #[test]
    fn test_frame_count_change_invalidates_stamps() {
        let mut table = ObjectStateTable::new(2, 2);
        let id = acquire(&mut table);
        let stamp = BindingStamp::new(id.0, 0);
        let plan = table.plan_writes(id, 0, stamp, stamp).unwrap();
        table.commit(id, 0, &plan, stamp, stamp).unwrap();

        table.set_frame_count(3);
        let old = table.replace_sets(id, sets(500, 3)).unwrap();
        assert_eq!(old.len(), 2);
        for frame in 0..3 {
            assert_eq!(table.plan_writes(id, frame, stamp, stamp).unwrap().write_count(), 2);
        }
    }

    #[test]
    fn test_missing_frame_set_is_an_error() {
        let mut table = ObjectStateTable::new(1, 2);
        let id = table.reserve().unwrap();
        assert!(matches!(
            table.plan_writes(id, 0, BindingStamp::INVALID, BindingStamp::INVALID),
            Err(VulkanError::InvalidOperation { .. })
        ));
        table.unreserve(id);
        assert_eq!(table.reserve().unwrap(), id);
    }
}
