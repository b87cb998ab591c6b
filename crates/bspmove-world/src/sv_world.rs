// sv_world.rs -- entity area checking and world-plus-entity traces
//
// Dynamic entities are kept in a flat index keyed by id. Traces sweep the
// world first, then every linked entity whose bounds overlap the move, and
// the closest hit wins.

use std::collections::BTreeMap;

use bspmove_common::cmodel::CollisionModel;
use bspmove_common::pmove::PmoveCallbacks;
use bspmove_common::q_shared::*;
use log::debug;

// ============================================================
// Entity links
// ============================================================

/// Collision shape of a linked entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityShape {
    /// Axis-aligned box `mins..maxs` around the origin.
    Box,
    /// Inline model of the world (doors, platforms), offset by the origin.
    SubModel(usize),
}

/// What the caller hands to `EntityIndex::link`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EntityLink {
    pub id: EntityId,
    pub origin: Vec3,
    /// Bounds relative to `origin`.
    pub mins: Vec3,
    pub maxs: Vec3,
    pub contents: Contents,
    /// Traces passing as the owner skip this entity, and the other way round.
    pub owner: Option<EntityId>,
    pub shape: EntityShape,
}

impl EntityLink {
    pub fn new(id: EntityId, origin: Vec3, mins: Vec3, maxs: Vec3, contents: Contents) -> Self {
        Self {
            id,
            origin,
            mins,
            maxs,
            contents,
            owner: None,
            shape: EntityShape::Box,
        }
    }

    /// A brush mover using inline model `num`. Bounds are taken from the
    /// model so area checks match its brushes.
    pub fn sub_model(
        id: EntityId,
        model: &CollisionModel,
        num: usize,
        origin: Vec3,
        contents: Contents,
    ) -> Self {
        let (mins, maxs) = model
            .inline_model(num)
            .map_or(([0.0; 3], [0.0; 3]), |m| (m.mins, m.maxs));
        Self {
            id,
            origin,
            mins,
            maxs,
            contents,
            owner: None,
            shape: EntityShape::SubModel(num),
        }
    }

    pub fn with_owner(mut self, owner: EntityId) -> Self {
        self.owner = Some(owner);
        self
    }
}

#[derive(Debug)]
struct LinkedEntity {
    link: EntityLink,
    /// Box hull for `EntityShape::Box`, built once per link.
    hull: Option<CollisionModel>,
    absmin: Vec3,
    absmax: Vec3,
}

impl LinkedEntity {
    fn new(link: EntityLink) -> Self {
        let hull = match link.shape {
            EntityShape::Box => Some(CollisionModel::box_hull(&link.mins, &link.maxs, link.contents)),
            EntityShape::SubModel(_) => None,
        };

        // expand by one so that touching boxes still get checked
        let mut absmin = vector_add(&link.origin, &link.mins);
        let mut absmax = vector_add(&link.origin, &link.maxs);
        for i in 0..3 {
            absmin[i] -= 1.0;
            absmax[i] += 1.0;
        }

        Self {
            link,
            hull,
            absmin,
            absmax,
        }
    }

    fn is_trigger(&self) -> bool {
        self.link.contents.contains(Contents::TRIGGER)
    }

    /// Sweeps against this entity alone. `None` when its sub-model is gone.
    fn clip(
        &self,
        world: &CollisionModel,
        start: &Vec3,
        end: &Vec3,
        mins: &Vec3,
        maxs: &Vec3,
        mask: Contents,
    ) -> Option<Trace> {
        let origin = &self.link.origin;
        match (&self.hull, self.link.shape) {
            (Some(hull), _) => Some(hull.transformed_box_trace(
                start,
                end,
                mins,
                maxs,
                hull.world_root(),
                mask,
                origin,
            )),
            (None, EntityShape::SubModel(num)) => {
                let Some(cmodel) = world.inline_model(num) else {
                    debug!("entity {:?}: no inline model {}", self.link.id, num);
                    return None;
                };
                Some(world.transformed_box_trace(start, end, mins, maxs, cmodel.headnode, mask, origin))
            }
            (None, EntityShape::Box) => None,
        }
    }

    fn point_contents(&self, world: &CollisionModel, p: &Vec3) -> Contents {
        let origin = &self.link.origin;
        match (&self.hull, self.link.shape) {
            (Some(hull), _) => hull.transformed_point_contents(p, hull.world_root(), origin),
            (None, EntityShape::SubModel(num)) => world
                .inline_model(num)
                .map_or(Contents::empty(), |m| world.transformed_point_contents(p, m.headnode, origin)),
            (None, EntityShape::Box) => Contents::empty(),
        }
    }
}

/// Which entities an area query returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AreaKind {
    Solid,
    Triggers,
}

// ============================================================
// Move clipping
// ============================================================

struct MoveClip<'a> {
    boxmins: Vec3,
    boxmaxs: Vec3,
    mins: &'a Vec3,
    maxs: &'a Vec3,
    start: &'a Vec3,
    end: &'a Vec3,
    trace: Trace,
    pass_id: Option<EntityId>,
    contentmask: Contents,
}

/// Bounds of the whole move, expanded by one.
fn trace_bounds(start: &Vec3, mins: &Vec3, maxs: &Vec3, end: &Vec3) -> (Vec3, Vec3) {
    let mut boxmins = [0.0f32; 3];
    let mut boxmaxs = [0.0f32; 3];
    for i in 0..3 {
        if end[i] > start[i] {
            boxmins[i] = start[i] + mins[i] - 1.0;
            boxmaxs[i] = end[i] + maxs[i] + 1.0;
        } else {
            boxmins[i] = end[i] + mins[i] - 1.0;
            boxmaxs[i] = start[i] + maxs[i] + 1.0;
        }
    }
    (boxmins, boxmaxs)
}

// ============================================================
// Entity index
// ============================================================

/// Per-tick registry of entity bounds, iterated in ascending id.
#[derive(Debug, Default)]
pub struct EntityIndex {
    entities: BTreeMap<EntityId, LinkedEntity>,
}

impl EntityIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Links an entity at its current origin. Relinking an id replaces it.
    pub fn link(&mut self, link: EntityLink) {
        self.entities.insert(link.id, LinkedEntity::new(link));
    }

    pub fn unlink(&mut self, id: EntityId) {
        self.entities.remove(&id);
    }

    pub fn get(&self, id: EntityId) -> Option<&EntityLink> {
        self.entities.get(&id).map(|e| &e.link)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn clear(&mut self) {
        self.entities.clear();
    }

    /// Ids of solid or trigger entities whose linked bounds overlap the box.
    pub fn area_entities(&self, mins: &Vec3, maxs: &Vec3, kind: AreaKind) -> Vec<EntityId> {
        self.entities
            .values()
            .filter(|e| e.is_trigger() == (kind == AreaKind::Triggers))
            .filter(|e| bounds_intersect(mins, maxs, &e.absmin, &e.absmax))
            .map(|e| e.link.id)
            .collect()
    }

    /// Trigger entities a box at `origin` is touching.
    pub fn gather_trigger_touches(&self, origin: &Vec3, mins: &Vec3, maxs: &Vec3) -> Vec<EntityId> {
        let absmin = vector_add(origin, mins);
        let absmax = vector_add(origin, maxs);
        self.area_entities(&absmin, &absmax, AreaKind::Triggers)
    }

    /// World contents at `p`, plus the contents of every entity covering it.
    pub fn point_contents(&self, world: &CollisionModel, p: &Vec3) -> Contents {
        let mut contents = world.point_contents(p, world.world_root());
        for e in self.entities.values() {
            if !bounds_intersect(p, p, &e.absmin, &e.absmax) {
                continue;
            }
            contents |= e.point_contents(world, p);
        }
        contents
    }

    /// Moves the given mins/maxs volume through the world from start to end.
    /// `pass_id` and anything it owns (or is owned by) are not tested.
    pub fn trace(
        &self,
        world: &CollisionModel,
        start: &Vec3,
        end: &Vec3,
        mins: &Vec3,
        maxs: &Vec3,
        mask: Contents,
        pass_id: Option<EntityId>,
    ) -> Trace {
        // clip to world
        let mut trace = world.box_trace(start, end, mins, maxs, world.world_root(), mask);
        trace.ent = None;
        if trace.fraction == 0.0 {
            return trace; // blocked by the world
        }

        let (boxmins, boxmaxs) = trace_bounds(start, mins, maxs, end);
        let mut clip = MoveClip {
            boxmins,
            boxmaxs,
            mins,
            maxs,
            start,
            end,
            trace,
            pass_id,
            contentmask: mask,
        };

        // clip to other solid entities
        self.clip_move_to_entities(world, &mut clip);
        clip.trace
    }

    /// Replaces the world result with an entity result that is allsolid,
    /// startsolid, or strictly nearer. A startsolid entity wins over a nearer
    /// world hit even at fraction 1; an equal fraction keeps the world.
    fn clip_move_to_entities(&self, world: &CollisionModel, clip: &mut MoveClip<'_>) {
        let pass = clip.pass_id.and_then(|id| self.entities.get(&id));

        for touch in self.entities.values() {
            if clip.trace.allsolid {
                return;
            }
            if !bounds_intersect(&clip.boxmins, &clip.boxmaxs, &touch.absmin, &touch.absmax) {
                continue;
            }
            if !touch.link.contents.intersects(clip.contentmask) {
                continue;
            }
            if let Some(pass) = pass {
                let pass_id = pass.link.id;
                if touch.link.id == pass_id {
                    continue;
                }
                if touch.link.owner == Some(pass_id) {
                    continue; // don't clip against own missiles
                }
                if pass.link.owner == Some(touch.link.id) {
                    continue; // don't clip against owner
                }
            }
            if !clip.contentmask.contains(Contents::DEADMONSTER)
                && touch.link.contents.contains(Contents::DEADMONSTER)
            {
                continue;
            }

            let Some(mut trace) =
                touch.clip(world, clip.start, clip.end, clip.mins, clip.maxs, clip.contentmask)
            else {
                continue;
            };

            if trace.allsolid || trace.startsolid || trace.fraction < clip.trace.fraction {
                trace.ent = Some(touch.link.id);
                if clip.trace.startsolid {
                    clip.trace = trace;
                    clip.trace.startsolid = true;
                } else {
                    clip.trace = trace;
                }
            } else if trace.startsolid {
                clip.trace.startsolid = true;
            }
        }
    }
}

// ============================================================
// Movement callbacks
// ============================================================

/// Runs player movement against the world and every linked entity except
/// the mover itself.
pub struct WorldPmoveCallbacks<'a> {
    pub model: &'a CollisionModel,
    pub index: &'a EntityIndex,
    pub pass_id: Option<EntityId>,
}

impl PmoveCallbacks for WorldPmoveCallbacks<'_> {
    fn trace(&self, start: &Vec3, mins: &Vec3, maxs: &Vec3, end: &Vec3, mask: Contents) -> Trace {
        self.index
            .trace(self.model, start, end, mins, maxs, mask, self.pass_id)
    }

    fn pointcontents(&self, point: &Vec3) -> Contents {
        self.index.point_contents(self.model, point)
    }
}

// ============================================================
// Tests
// ============================================================
