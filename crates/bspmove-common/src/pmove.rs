// pmove.rs -- Player movement code
//
// Runs one command tick for a player box. Shared by client prediction and
// server authority, so every branch must be deterministic given the same
// state, command and collision callbacks.

use log::trace;

use crate::q_shared::{
    angle_vectors, cross_product, dot_product, short2angle, vector_length, vector_ma,
    vector_normalize, vector_scale, Buttons, CPlane, Contents, PmFlags, PmType, PmoveState,
    SurfaceFlags, Touched, Trace, UserCmd, Vec3, WaterLevel, MASK_CURRENT, MASK_DEADSOLID,
    MASK_PLAYERSOLID, MASK_SOLID, MASK_WATER, MAX_CLIP_PLANES, PITCH, ROLL, VEC3_ORIGIN, YAW,
};
use crate::stuck::{initial_snap_position, snap_position, SnapResolution};

// ============================================================
// Constants
// ============================================================

pub const MAXTOUCH: usize = 32;

const STEPSIZE: f32 = 18.0;
const STOP_EPSILON: f32 = 0.1;
const MIN_STEP_NORMAL: f32 = 0.7;
const OVERBOUNCE: f32 = 1.01;
const MAX_BUMPS: usize = 4;

// timer lengths, milliseconds
const TRICK_TIME: u16 = 64;
const LAND_TIME: u16 = 128;
const WATERJUMP_TIME: u16 = 2048;

const WATERJUMP_FORWARD_CHECK: f32 = 40.0;
const WATERJUMP_FORWARD_SPEED: f32 = 50.0;
const WATERJUMP_UPWARD_SPEED: f32 = 350.0;
const WATERJUMP_SIM_STEP: f32 = 0.1;
const WATERJUMP_MAX_STEPS: usize = 50;

/// Tunable movement parameters. `CvarContext::pmove_params` builds one from
/// the `pm_*` variables.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PmoveParams {
    pub stopspeed: f32,
    pub maxspeed: f32,
    pub duckspeed: f32,
    pub accelerate: f32,
    pub airaccelerate: f32,
    pub wateraccelerate: f32,
    pub friction: f32,
    pub waterfriction: f32,
    pub waterspeed: f32,
    pub jump_height: f32,
    /// Classic console physics: no crouch-sliding, no trick jumps, and a
    /// landing delay after every fall.
    pub n64_physics: bool,
}

impl Default for PmoveParams {
    fn default() -> Self {
        Self {
            stopspeed: 100.0,
            maxspeed: 300.0,
            duckspeed: 100.0,
            accelerate: 10.0,
            airaccelerate: 0.0,
            wateraccelerate: 10.0,
            friction: 6.0,
            waterfriction: 1.0,
            waterspeed: 400.0,
            jump_height: 270.0,
            n64_physics: false,
        }
    }
}

bitflags::bitflags! {
    /// What stopped a slide move.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct Blocked: u8 {
        /// a walkable floor
        const FLOOR = 1 << 0;
        /// a vertical wall
        const WALL  = 1 << 1;
    }
}

// ============================================================
// Pmove data -- one tick of input and output
// ============================================================

#[derive(Debug, Clone, Default)]
pub struct PmoveData {
    /// state (in / out)
    pub s: PmoveState,

    /// command (in)
    pub cmd: UserCmd,
    /// if the state has been changed outside pmove
    pub snapinitial: bool,

    // results (out)
    pub touchents: Vec<Touched>,
    pub viewangles: Vec3,
    pub mins: Vec3,
    pub maxs: Vec3,
    pub groundentity: Option<Touched>,
    pub groundplane: Option<CPlane>,
    pub watertype: Contents,
    pub waterlevel: WaterLevel,
    /// Vertical speed lost on the landing this tick; 0 when not landing.
    pub impact_delta: f32,
    pub blocked: Blocked,
    pub snap: SnapResolution,
}

impl PmoveData {
    pub fn new(s: PmoveState, cmd: UserCmd) -> Self {
        Self {
            s,
            cmd,
            ..Default::default()
        }
    }
}

/// Box bounds and eye height for a player state.
pub fn player_dimensions(pm_type: PmType, pm_flags: PmFlags) -> (Vec3, Vec3, i8) {
    if pm_type == PmType::Gib {
        return ([-16.0, -16.0, 0.0], [16.0, 16.0, 16.0], 8);
    }
    if pm_flags.contains(PmFlags::DUCKED) {
        ([-16.0, -16.0, -24.0], [16.0, 16.0, 4.0], -2)
    } else {
        ([-16.0, -16.0, -24.0], [16.0, 16.0, 32.0], 22)
    }
}

// ============================================================
// Pmove local state -- zeroed before each pmove
// ============================================================

#[derive(Clone, Default)]
struct PmLocal {
    origin: Vec3,
    velocity: Vec3,
    start_velocity: Vec3,

    forward: Vec3,
    right: Vec3,
    frametime: f32,

    groundsurface: SurfaceFlags,
    groundcontents: Contents,

    previous_origin: Vec3,
}

// ============================================================
// Callbacks trait
// ============================================================

/// Collision queries the simulator needs from whoever owns the world.
pub trait PmoveCallbacks {
    fn trace(&self, start: &Vec3, mins: &Vec3, maxs: &Vec3, end: &Vec3, mask: Contents) -> Trace;
    fn pointcontents(&self, point: &Vec3) -> Contents;
}

// ============================================================
// Pmove context -- holds all state for one pmove() call
// ============================================================

struct PmoveContext<'a, C: PmoveCallbacks + ?Sized> {
    pm: &'a mut PmoveData,
    pml: PmLocal,
    params: &'a PmoveParams,
    cb: &'a C,
}

/// Slide off of the impacting surface.
fn pm_clip_velocity(inv: &Vec3, normal: &Vec3, overbounce: f32) -> Vec3 {
    let backoff = dot_product(inv, normal) * overbounce;
    let mut out = [0.0f32; 3];
    for i in 0..3 {
        out[i] = inv[i] - normal[i] * backoff;
        if out[i] > -STOP_EPSILON && out[i] < STOP_EPSILON {
            out[i] = 0.0;
        }
    }
    out
}

fn current_vector(contents: Contents) -> Vec3 {
    let mut v = VEC3_ORIGIN;
    if contents.contains(Contents::CURRENT_0) {
        v[0] += 1.0;
    }
    if contents.contains(Contents::CURRENT_90) {
        v[1] += 1.0;
    }
    if contents.contains(Contents::CURRENT_180) {
        v[0] -= 1.0;
    }
    if contents.contains(Contents::CURRENT_270) {
        v[1] -= 1.0;
    }
    if contents.contains(Contents::CURRENT_UP) {
        v[2] += 1.0;
    }
    if contents.contains(Contents::CURRENT_DOWN) {
        v[2] -= 1.0;
    }
    v
}

fn is_water(cont: Contents) -> bool {
    cont.intersects(MASK_WATER)
}

impl<'a, C: PmoveCallbacks + ?Sized> PmoveContext<'a, C> {
    fn clip_mask(&self) -> Contents {
        match self.pm.s.pm_type {
            PmType::Spectator => MASK_SOLID,
            PmType::Dead | PmType::Gib => MASK_DEADSOLID,
            _ if self.pm.s.pm_flags.contains(PmFlags::IGNORE_PLAYER_COLLISION) => {
                MASK_PLAYERSOLID - Contents::PLAYER
            }
            _ => MASK_PLAYERSOLID,
        }
    }

    fn trace_box(&self, start: &Vec3, mins: &Vec3, maxs: &Vec3, end: &Vec3) -> Trace {
        self.cb.trace(start, mins, maxs, end, self.clip_mask())
    }

    fn trace(&self, start: &Vec3, end: &Vec3) -> Trace {
        self.trace_box(start, &self.pm.mins, &self.pm.maxs, end)
    }

    fn record_touch(&mut self, tr: &Trace) {
        if let Some(touched) = tr.touched() {
            if self.pm.touchents.len() < MAXTOUCH && !self.pm.touchents.contains(&touched) {
                self.pm.touchents.push(touched);
            }
        }
    }

    // --------------------------------------------------------
    // Slide move
    // --------------------------------------------------------
    fn slide_move(
        &mut self,
        origin: &mut Vec3,
        velocity: &mut Vec3,
        frametime: f32,
        has_time: bool,
    ) -> Blocked {
        let primal_velocity = *velocity;
        let mut numplanes: usize = 0;
        let mut planes = [[0.0f32; 3]; MAX_CLIP_PLANES];
        let mut blocked = Blocked::empty();

        let mut time_left = frametime;

        for _bumpcount in 0..MAX_BUMPS {
            let end = vector_ma(origin, time_left, velocity);
            let tr = self.trace(origin, &end);

            if tr.allsolid {
                // entity is trapped in another solid
                velocity[2] = 0.0;
                return blocked;
            }

            if tr.fraction > 0.0 {
                // actually covered some distance
                *origin = tr.endpos;
                numplanes = 0;
            }

            if tr.fraction == 1.0 {
                break; // moved the entire distance
            }

            self.record_touch(&tr);

            let normal = tr.plane_normal();
            if normal[2] > MIN_STEP_NORMAL {
                blocked |= Blocked::FLOOR;
            }
            if normal[2] == 0.0 {
                blocked |= Blocked::WALL;
            }

            time_left -= time_left * tr.fraction;

            // slide along this plane
            if numplanes >= MAX_CLIP_PLANES {
                trace!("clip planes exhausted at {:?}", origin);
                *velocity = VEC3_ORIGIN;
                break;
            }

            planes[numplanes] = normal;
            numplanes += 1;

            // modify velocity so it parallels all of the clip planes
            let mut found = false;
            for i in 0..numplanes {
                *velocity = pm_clip_velocity(velocity, &planes[i], OVERBOUNCE);
                let ok = (0..numplanes)
                    .all(|j| j == i || dot_product(velocity, &planes[j]) >= 0.0);
                if ok {
                    found = true;
                    break;
                }
            }

            if !found {
                // go along the crease
                if numplanes != 2 {
                    *velocity = VEC3_ORIGIN;
                    break;
                }
                let dir = cross_product(&planes[0], &planes[1]);
                let d = dot_product(&dir, velocity);
                *velocity = vector_scale(&dir, d);
            }

            // if velocity is against the original velocity, stop dead
            if dot_product(velocity, &primal_velocity) <= 0.0 {
                *velocity = VEC3_ORIGIN;
                break;
            }
        }

        if has_time {
            *velocity = primal_velocity;
        }

        blocked
    }

    // --------------------------------------------------------
    // Step slide move
    // --------------------------------------------------------
    fn step_slide_move_generic(
        &mut self,
        origin: &mut Vec3,
        velocity: &mut Vec3,
        frametime: f32,
        has_time: bool,
    ) -> Blocked {
        let start_o = *origin;
        let start_v = *velocity;

        let down_blocked = self.slide_move(origin, velocity, frametime, has_time);

        let down_o = *origin;
        let down_v = *velocity;

        let mut up = start_o;
        up[2] += STEPSIZE;

        let tr = self.trace(&start_o, &up);
        if tr.allsolid {
            return down_blocked; // can't step up
        }

        let step_size = tr.endpos[2] - start_o[2];

        // try sliding above
        *origin = tr.endpos;
        *velocity = start_v;

        let up_blocked = self.slide_move(origin, velocity, frametime, has_time);

        // push down the final amount
        let mut down = *origin;
        down[2] -= step_size;
        let tr = self.trace(origin, &down);
        if !tr.allsolid {
            *origin = tr.endpos;
        }

        let up = *origin;

        // decide which one went farther
        let down_dist = (down_o[0] - start_o[0]) * (down_o[0] - start_o[0])
            + (down_o[1] - start_o[1]) * (down_o[1] - start_o[1]);
        let up_dist = (up[0] - start_o[0]) * (up[0] - start_o[0])
            + (up[1] - start_o[1]) * (up[1] - start_o[1]);

        if down_dist > up_dist || tr.plane_normal()[2] < MIN_STEP_NORMAL {
            *origin = down_o;
            *velocity = down_v;
            return down_blocked;
        }

        // if we were walking along a plane, then we need to copy the Z over
        velocity[2] = down_v[2];
        up_blocked
    }

    fn step_slide_move(&mut self) {
        let mut origin = self.pml.origin;
        let mut velocity = self.pml.velocity;
        let has_time = self.pm.s.pm_time != 0;
        let blocked =
            self.step_slide_move_generic(&mut origin, &mut velocity, self.pml.frametime, has_time);
        self.pml.origin = origin;
        self.pml.velocity = velocity;
        self.pm.blocked |= blocked;
    }

    // --------------------------------------------------------
    // Friction
    // --------------------------------------------------------
    fn friction(&mut self) {
        let vel = &mut self.pml.velocity;
        let speed = vector_length(vel);
        if speed < 1.0 {
            vel[0] = 0.0;
            vel[1] = 0.0;
            return;
        }

        let on_ladder = self.pm.s.pm_flags.contains(PmFlags::ON_LADDER);
        let mut drop = 0.0f32;

        // apply ground friction
        let slick = self.pml.groundsurface.contains(SurfaceFlags::SLICK);
        if (self.pm.groundentity.is_some() && !slick) || on_ladder {
            let control = speed.max(self.params.stopspeed);
            drop += control * self.params.friction * self.pml.frametime;
        }

        // apply water friction
        if self.pm.waterlevel != WaterLevel::None && !on_ladder {
            drop += speed
                * self.params.waterfriction
                * self.pm.waterlevel as u8 as f32
                * self.pml.frametime;
        }

        // scale the velocity
        let newspeed = (speed - drop).max(0.0) / speed;
        *vel = vector_scale(vel, newspeed);
    }

    // --------------------------------------------------------
    // Accelerate
    // --------------------------------------------------------
    fn accelerate(&mut self, wishdir: &Vec3, wishspeed: f32, accel: f32) {
        let currentspeed = dot_product(&self.pml.velocity, wishdir);
        let addspeed = wishspeed - currentspeed;
        if addspeed <= 0.0 {
            return;
        }
        let accelspeed = (accel * self.pml.frametime * wishspeed).min(addspeed);
        self.pml.velocity = vector_ma(&self.pml.velocity, accelspeed, wishdir);
    }

    fn air_accelerate(&mut self, wishdir: &Vec3, wishspeed: f32, accel: f32) {
        let wishspd = wishspeed.min(30.0);
        let currentspeed = dot_product(&self.pml.velocity, wishdir);
        let addspeed = wishspd - currentspeed;
        if addspeed <= 0.0 {
            return;
        }
        let accelspeed = (accel * wishspeed * self.pml.frametime).min(addspeed);
        self.pml.velocity = vector_ma(&self.pml.velocity, accelspeed, wishdir);
    }

    // --------------------------------------------------------
    // Currents
    // --------------------------------------------------------
    fn add_currents(&self, wishvel: &mut Vec3) {
        // account for ladders
        if self.pm.s.pm_flags.contains(PmFlags::ON_LADDER) && self.pml.velocity[2].abs() <= 200.0 {
            let mut pitch = self.pm.viewangles[PITCH];
            if pitch > 180.0 {
                pitch -= 360.0;
            }
            let buttons = self.pm.cmd.buttons;
            wishvel[2] = if pitch <= -15.0 && self.pm.cmd.forwardmove > 0 {
                200.0
            } else if pitch >= 15.0 && self.pm.cmd.forwardmove > 0 {
                -200.0
            } else if buttons.contains(Buttons::JUMP) {
                200.0
            } else if buttons.contains(Buttons::CROUCH) {
                -200.0
            } else {
                0.0
            };

            // limit horizontal speed when on a ladder
            wishvel[0] = wishvel[0].clamp(-25.0, 25.0);
            wishvel[1] = wishvel[1].clamp(-25.0, 25.0);
        }

        // add water currents
        if self.pm.watertype.intersects(MASK_CURRENT) {
            let v = current_vector(self.pm.watertype);
            let mut s = self.params.waterspeed;
            if self.pm.waterlevel == WaterLevel::Feet && self.pm.groundentity.is_some() {
                s /= 2.0;
            }
            *wishvel = vector_ma(wishvel, s, &v);
        }

        // add conveyor belt velocities
        if self.pm.groundentity.is_some() {
            let v = current_vector(self.pml.groundcontents);
            *wishvel = vector_ma(wishvel, 100.0, &v);
        }
    }

    // --------------------------------------------------------
    // Water move
    // --------------------------------------------------------
    fn water_move(&mut self) {
        let fm = self.pm.cmd.forwardmove as f32;
        let sm = self.pm.cmd.sidemove as f32;
        let buttons = self.pm.cmd.buttons;

        let mut wishvel: Vec3 = [0.0; 3];
        for i in 0..3 {
            wishvel[i] = self.pml.forward[i] * fm + self.pml.right[i] * sm;
        }

        let idle = fm == 0.0
            && sm == 0.0
            && !buttons.intersects(Buttons::JUMP | Buttons::CROUCH)
            && self.pm.groundentity.is_none();
        if idle {
            wishvel[2] -= 60.0; // drift towards bottom
        } else if buttons.contains(Buttons::CROUCH) {
            wishvel[2] -= self.params.waterspeed * 0.5;
        } else if buttons.contains(Buttons::JUMP) {
            wishvel[2] += self.params.waterspeed * 0.5;
        }

        self.add_currents(&mut wishvel);

        let mut wishdir = wishvel;
        let mut wishspeed = vector_normalize(&mut wishdir);

        if wishspeed > self.params.maxspeed {
            wishspeed = self.params.maxspeed;
        }
        wishspeed *= 0.5;

        if self.pm.s.pm_flags.contains(PmFlags::DUCKED) && wishspeed > self.params.duckspeed {
            wishspeed = self.params.duckspeed;
        }

        self.accelerate(&wishdir, wishspeed, self.params.wateraccelerate);
        self.step_slide_move();
    }

    // --------------------------------------------------------
    // Air move (also ground and ladder)
    // --------------------------------------------------------
    fn air_move(&mut self) {
        let fmove = self.pm.cmd.forwardmove as f32;
        let smove = self.pm.cmd.sidemove as f32;

        let mut wishvel: Vec3 = [0.0; 3];
        for i in 0..2 {
            wishvel[i] = self.pml.forward[i] * fmove + self.pml.right[i] * smove;
        }

        self.add_currents(&mut wishvel);

        let mut wishdir = wishvel;
        let mut wishspeed = vector_normalize(&mut wishdir);

        // clamp to server defined max speed
        let maxspeed = if self.pm.s.pm_flags.contains(PmFlags::DUCKED) {
            self.params.duckspeed
        } else {
            self.params.maxspeed
        };
        if wishspeed > maxspeed {
            wishvel = vector_scale(&wishvel, maxspeed / wishspeed);
            wishspeed = maxspeed;
        }

        let gravity = self.pm.s.gravity as f32;
        let ft = self.pml.frametime;

        if self.pm.s.pm_flags.contains(PmFlags::ON_LADDER) {
            self.accelerate(&wishdir, wishspeed, self.params.accelerate);
            if wishvel[2] == 0.0 {
                let vz = &mut self.pml.velocity[2];
                if *vz > 0.0 {
                    *vz = (*vz - gravity * ft).max(0.0);
                } else {
                    *vz = (*vz + gravity * ft).min(0.0);
                }
            }
            self.step_slide_move();
        } else if self.pm.groundentity.is_some() {
            // walking on ground
            self.pml.velocity[2] = 0.0;
            self.accelerate(&wishdir, wishspeed, self.params.accelerate);

            // fix for negative gravity fields
            if gravity > 0.0 {
                self.pml.velocity[2] = 0.0;
            } else {
                self.pml.velocity[2] -= gravity * ft;
            }

            if self.pml.velocity[0] == 0.0 && self.pml.velocity[1] == 0.0 {
                return;
            }
            self.step_slide_move();
        } else {
            // not on ground, so little effect on velocity
            if self.params.airaccelerate != 0.0 {
                self.air_accelerate(&wishdir, wishspeed, self.params.airaccelerate);
            } else {
                self.accelerate(&wishdir, wishspeed, 1.0);
            }
            if self.pm.s.pm_type != PmType::Grapple {
                self.pml.velocity[2] -= gravity * ft;
            }
            self.step_slide_move();
        }
    }

    // --------------------------------------------------------
    // Categorize position
    // --------------------------------------------------------
    fn categorize_position(&mut self) {
        // see if standing on something solid
        let mut point = self.pml.origin;
        point[2] -= 0.25;

        if self.pml.velocity[2] > 180.0 || self.pm.s.pm_type == PmType::Grapple {
            self.pm.s.pm_flags.remove(PmFlags::ON_GROUND);
            self.pm.groundentity = None;
        } else {
            let tr = self.trace(&self.pml.origin, &point);
            self.pm.groundplane = tr.plane;
            self.pml.groundsurface = tr.surface_flags;
            self.pml.groundcontents = tr.contents;

            let normal = tr.plane_normal();

            // allow standing on a steep slope when wedged against a wall
            let mut slanted_ground = tr.fraction < 1.0 && normal[2] < MIN_STEP_NORMAL;
            if slanted_ground {
                let end = vector_ma(&self.pml.origin, 1.0, &normal);
                let slant = self.trace(&self.pml.origin, &end);
                if slant.fraction < 1.0 && !slant.startsolid {
                    slanted_ground = false;
                }
            }

            if tr.fraction == 1.0 || (slanted_ground && !tr.startsolid) {
                self.pm.groundentity = None;
                self.pm.s.pm_flags.remove(PmFlags::ON_GROUND);
            } else {
                self.pm.groundentity = tr.touched();

                // hitting solid ground will end a waterjump
                if self.pm.s.pm_flags.contains(PmFlags::TIME_WATERJUMP) {
                    self.pm.s.pm_flags.remove(PmFlags::ALL_TIMES);
                    self.pm.s.pm_time = 0;
                }

                if !self.pm.s.pm_flags.contains(PmFlags::ON_GROUND) {
                    // just hit the ground
                    let ducked = self.pm.s.pm_flags.contains(PmFlags::DUCKED);
                    if !self.params.n64_physics
                        && self.pml.velocity[2] >= 100.0
                        && normal[2] >= 0.9
                        && !ducked
                    {
                        self.pm.s.pm_flags.insert(PmFlags::TIME_TRICK);
                        self.pm.s.pm_time = TRICK_TIME;
                    }

                    let clipped = pm_clip_velocity(&self.pml.velocity, &normal, OVERBOUNCE);
                    self.pm.impact_delta = self.pml.start_velocity[2] - clipped[2];

                    self.pm.s.pm_flags.insert(PmFlags::ON_GROUND);

                    if self.params.n64_physics || ducked {
                        self.pm.s.pm_flags.insert(PmFlags::TIME_LAND);
                        self.pm.s.pm_time = LAND_TIME;
                    }
                }
            }

            self.record_touch(&tr);
        }

        let (level, watertype) = self.water_level(&self.pml.origin);
        self.pm.waterlevel = level;
        self.pm.watertype = watertype;
    }

    /// Water depth at `origin`, accounting for ducking.
    fn water_level(&self, origin: &Vec3) -> (WaterLevel, Contents) {
        let sample2 = (self.pm.s.viewheight as f32 - self.pm.mins[2]) as i32;
        let sample1 = sample2 / 2;

        let mut point = [origin[0], origin[1], origin[2] + self.pm.mins[2] + 1.0];
        let cont = self.cb.pointcontents(&point);
        if !is_water(cont) {
            return (WaterLevel::None, Contents::empty());
        }

        let watertype = cont;
        point[2] = origin[2] + self.pm.mins[2] + sample1 as f32;
        if !is_water(self.cb.pointcontents(&point)) {
            return (WaterLevel::Feet, watertype);
        }

        point[2] = origin[2] + self.pm.mins[2] + sample2 as f32;
        if !is_water(self.cb.pointcontents(&point)) {
            return (WaterLevel::Waist, watertype);
        }

        (WaterLevel::Under, watertype)
    }

    // --------------------------------------------------------
    // Jump
    // --------------------------------------------------------
    fn check_jump(&mut self) {
        // hasn't been long enough since landing to jump again
        if self.pm.s.pm_flags.contains(PmFlags::TIME_LAND) {
            return;
        }

        // not holding jump
        if !self.pm.cmd.buttons.contains(Buttons::JUMP) {
            self.pm.s.pm_flags.remove(PmFlags::JUMP_HELD);
            return;
        }

        // must wait for jump to be released
        if self.pm.s.pm_flags.contains(PmFlags::JUMP_HELD) {
            return;
        }

        if self.pm.s.pm_type == PmType::Dead {
            return;
        }

        if self.pm.waterlevel >= WaterLevel::Waist {
            // swimming, not jumping
            self.pm.groundentity = None;
            return;
        }

        if self.pm.groundentity.is_none() {
            return; // in air, so no effect
        }

        self.pm.s.pm_flags.insert(PmFlags::JUMP_HELD);
        self.pm.groundentity = None;
        self.pm.s.pm_flags.remove(PmFlags::ON_GROUND);

        let jump_height = self.params.jump_height;
        self.pml.velocity[2] = (self.pml.velocity[2] + jump_height).max(jump_height);
    }

    // --------------------------------------------------------
    // Ladders and water jumps
    // --------------------------------------------------------
    fn check_special_movement(&mut self) {
        if self.pm.s.pm_time != 0 {
            return;
        }

        self.pm.s.pm_flags.remove(PmFlags::ON_LADDER);

        let mut flatforward: Vec3 = [self.pml.forward[0], self.pml.forward[1], 0.0];
        if vector_normalize(&mut flatforward) == 0.0 {
            return;
        }

        // check for ladder
        if self.pm.waterlevel < WaterLevel::Waist {
            let spot = vector_ma(&self.pml.origin, 1.0, &flatforward);
            let tr = self.trace(&self.pml.origin, &spot);
            if tr.fraction < 1.0 && tr.contents.contains(Contents::LADDER) {
                self.pm.s.pm_flags.insert(PmFlags::ON_LADDER);
            }
        }

        // check for water jump
        let gravity = self.pm.s.gravity as f32;
        if gravity == 0.0 {
            return;
        }
        if !self.pm.cmd.buttons.contains(Buttons::JUMP) && self.pm.cmd.forwardmove <= 0 {
            return;
        }
        if self.pm.waterlevel != WaterLevel::Waist
            || self.pm.watertype.contains(Contents::NO_WATERJUMP)
        {
            return;
        }

        // quick check that something is even blocking us forward
        let spot = vector_ma(&self.pml.origin, WATERJUMP_FORWARD_CHECK, &flatforward);
        let tr = self.trace(&self.pml.origin, &spot);
        if tr.fraction == 1.0 || tr.plane_normal()[2] >= MIN_STEP_NORMAL {
            return;
        }

        // simulate the jump to see where it lands
        let launch = [
            flatforward[0] * WATERJUMP_FORWARD_SPEED,
            flatforward[1] * WATERJUMP_FORWARD_SPEED,
            WATERJUMP_UPWARD_SPEED,
        ];
        let mut origin = self.pml.origin;
        let mut velocity = launch;
        let mut has_time = true;
        let steps = ((10.0 * (800.0 / gravity)).floor().max(0.0) as usize).min(WATERJUMP_MAX_STEPS);

        for _ in 0..steps {
            velocity[2] -= gravity * WATERJUMP_SIM_STEP;
            if velocity[2] < 0.0 {
                has_time = false;
            }
            self.step_slide_move_generic(&mut origin, &mut velocity, WATERJUMP_SIM_STEP, has_time);
        }

        // snap down to ground
        let mut down = origin;
        down[2] -= 2.0;
        let tr = self.trace(&origin, &down);

        // can't land on a non-walkable surface or below where we started
        if tr.fraction == 1.0
            || tr.plane_normal()[2] < MIN_STEP_NORMAL
            || tr.endpos[2] < self.pml.origin[2]
        {
            return;
        }

        // we're currently standing on ground and the landing is a normal step up
        if self.pm.groundentity.is_some() && (self.pml.origin[2] - tr.endpos[2]).abs() <= STEPSIZE {
            return;
        }

        // landing spot is still under water
        let (level, _) = self.water_level(&tr.endpos);
        if level >= WaterLevel::Waist {
            return;
        }

        // jump out of water
        self.pml.velocity = launch;
        self.pm.s.pm_flags.insert(PmFlags::TIME_WATERJUMP);
        self.pm.s.pm_time = WATERJUMP_TIME;
    }

    // --------------------------------------------------------
    // Fly move (spectators and noclip)
    // --------------------------------------------------------
    fn fly_move(&mut self, doclip: bool) {
        self.pm.s.viewheight = 22;

        // friction
        let speed = vector_length(&self.pml.velocity);
        if speed < 1.0 {
            self.pml.velocity = VEC3_ORIGIN;
        } else {
            let friction = self.params.friction * 1.5; // extra friction
            let control = speed.max(self.params.stopspeed);
            let drop = control * friction * self.pml.frametime;
            let newspeed = (speed - drop).max(0.0) / speed;
            self.pml.velocity = vector_scale(&self.pml.velocity, newspeed);
        }

        // accelerate
        let fmove = self.pm.cmd.forwardmove as f32;
        let smove = self.pm.cmd.sidemove as f32;

        vector_normalize(&mut self.pml.forward);
        vector_normalize(&mut self.pml.right);

        let mut wishvel: Vec3 = [0.0; 3];
        for i in 0..3 {
            wishvel[i] = self.pml.forward[i] * fmove + self.pml.right[i] * smove;
        }
        wishvel[2] += self.pm.cmd.upmove as f32;

        let mut wishdir = wishvel;
        let wishspeed = vector_normalize(&mut wishdir).min(self.params.maxspeed);

        self.accelerate(&wishdir, wishspeed, self.params.accelerate);

        if doclip {
            let mut origin = self.pml.origin;
            let mut velocity = self.pml.velocity;
            self.slide_move(&mut origin, &mut velocity, self.pml.frametime, false);
            self.pml.origin = origin;
            self.pml.velocity = velocity;
        } else {
            self.pml.origin = vector_ma(&self.pml.origin, self.pml.frametime, &self.pml.velocity);
        }
    }

    // --------------------------------------------------------
    // Duck
    // --------------------------------------------------------
    fn set_dimensions(&mut self) {
        let (mins, maxs, viewheight) = player_dimensions(self.pm.s.pm_type, self.pm.s.pm_flags);
        self.pm.mins = mins;
        self.pm.maxs = maxs;
        self.pm.s.viewheight = viewheight;
    }

    /// True when standing on nothing solid but with water just below.
    fn above_water(&self) -> bool {
        let mut below = self.pml.origin;
        below[2] -= 8.0;

        let solid = self
            .cb
            .trace(&self.pml.origin, &self.pm.mins, &self.pm.maxs, &below, MASK_SOLID)
            .fraction
            < 1.0;
        if solid {
            return false;
        }

        self.cb.pointcontents(&below).intersects(MASK_WATER)
    }

    /// Returns true when the duck state changed.
    fn check_duck(&mut self) -> bool {
        if self.pm.s.pm_type == PmType::Gib {
            return false;
        }

        let flags = self.pm.s.pm_flags;
        let ducked = flags.contains(PmFlags::DUCKED);

        if self.pm.s.pm_type == PmType::Dead {
            if ducked {
                return false;
            }
            self.pm.s.pm_flags.insert(PmFlags::DUCKED);
            return true;
        }

        let wants_duck = self.pm.cmd.buttons.contains(Buttons::CROUCH)
            && (self.pm.groundentity.is_some()
                || (self.pm.waterlevel <= WaterLevel::Feet && !self.above_water()))
            && !flags.contains(PmFlags::ON_LADDER)
            && !self.params.n64_physics;

        if wants_duck {
            if ducked {
                return false;
            }
            // check that duck won't be blocked
            let check_maxs = [self.pm.maxs[0], self.pm.maxs[1], 4.0];
            let tr = self.trace_box(&self.pml.origin, &self.pm.mins, &check_maxs, &self.pml.origin);
            if tr.allsolid {
                return false;
            }
            self.pm.s.pm_flags.insert(PmFlags::DUCKED);
            true
        } else {
            if !ducked {
                return false;
            }
            // try to stand up
            let check_maxs = [self.pm.maxs[0], self.pm.maxs[1], 32.0];
            let tr = self.trace_box(&self.pml.origin, &self.pm.mins, &check_maxs, &self.pml.origin);
            if tr.allsolid {
                return false;
            }
            self.pm.s.pm_flags.remove(PmFlags::DUCKED);
            true
        }
    }

    // --------------------------------------------------------
    // Dead move
    // --------------------------------------------------------
    fn dead_move(&mut self) {
        if self.pm.groundentity.is_none() {
            return;
        }

        // extra friction
        let forward = vector_length(&self.pml.velocity) - 20.0;
        if forward <= 0.0 {
            self.pml.velocity = VEC3_ORIGIN;
        } else {
            vector_normalize(&mut self.pml.velocity);
            self.pml.velocity = vector_scale(&self.pml.velocity, forward);
        }
    }

    // --------------------------------------------------------
    // Snapping
    // --------------------------------------------------------
    fn initial_snap(&mut self) {
        let snap = initial_snap_position(&self.pml.origin, &self.pm.mins, &self.pm.maxs, |s, mn, mx, e| {
            self.trace_box(s, mn, mx, e)
        });
        if snap.snapped {
            self.pml.origin = snap.origin;
            self.pml.previous_origin = snap.origin;
        }
    }

    fn snap_position(&mut self) {
        let snap = snap_position(
            &self.pml.origin,
            &self.pml.velocity,
            &self.pm.mins,
            &self.pm.maxs,
            &self.pml.previous_origin,
            |s, mn, mx, e| self.trace_box(s, mn, mx, e),
        );
        self.pm.s.origin = snap.origin;
        self.pm.s.velocity = snap.velocity;
        self.pm.snap = snap.resolution;
    }

    // --------------------------------------------------------
    // Clamp angles
    // --------------------------------------------------------
    fn clamp_angles(&mut self) {
        if self.pm.s.pm_flags.contains(PmFlags::TIME_TELEPORT) {
            self.pm.viewangles[YAW] = short2angle(
                self.pm.cmd.angles[YAW].wrapping_add(self.pm.s.delta_angles[YAW]),
            );
            self.pm.viewangles[PITCH] = 0.0;
            self.pm.viewangles[ROLL] = 0.0;
        } else {
            // circularly clamp the angles with deltas
            for i in 0..3 {
                let temp = self.pm.cmd.angles[i].wrapping_add(self.pm.s.delta_angles[i]);
                self.pm.viewangles[i] = short2angle(temp);
            }

            // don't let the player look up or down more than 90 degrees
            let pitch = &mut self.pm.viewangles[PITCH];
            if *pitch > 89.0 && *pitch < 180.0 {
                *pitch = 89.0;
            } else if *pitch < 271.0 && *pitch >= 180.0 {
                *pitch = 271.0;
            }
        }
        angle_vectors(
            &self.pm.viewangles,
            Some(&mut self.pml.forward),
            Some(&mut self.pml.right),
            None,
        );
    }

    // --------------------------------------------------------
    // Main pmove execution
    // --------------------------------------------------------
    fn execute(&mut self) {
        // clear results
        self.pm.touchents.clear();
        self.pm.viewangles = VEC3_ORIGIN;
        self.pm.groundentity = None;
        self.pm.groundplane = None;
        self.pm.watertype = Contents::empty();
        self.pm.waterlevel = WaterLevel::None;
        self.pm.impact_delta = 0.0;
        self.pm.blocked = Blocked::empty();
        self.pm.snap = SnapResolution::Unchanged;

        // clear all pmove local vars
        self.pml = PmLocal {
            origin: self.pm.s.origin,
            velocity: self.pm.s.velocity,
            start_velocity: self.pm.s.velocity,
            // save old org in case we get stuck
            previous_origin: self.pm.s.origin,
            frametime: self.pm.cmd.msec as f32 * 0.001,
            ..Default::default()
        };

        self.clamp_angles();

        match self.pm.s.pm_type {
            PmType::Spectator => {
                self.set_dimensions();
                self.fly_move(true);
                self.snap_position();
                return;
            }
            PmType::NoClip => {
                self.set_dimensions();
                self.fly_move(false);
                self.pm.s.origin = self.pml.origin;
                self.pm.s.velocity = self.pml.velocity;
                return;
            }
            _ => {}
        }

        if self.pm.s.pm_type >= PmType::Dead {
            self.pm.cmd.forwardmove = 0;
            self.pm.cmd.sidemove = 0;
            self.pm.cmd.upmove = 0;
            self.pm.cmd.buttons.remove(Buttons::JUMP | Buttons::CROUCH);
        }

        if self.pm.s.pm_type == PmType::Freeze {
            return; // no movement at all
        }

        // set mins, maxs, and viewheight
        self.set_dimensions();

        // set groundentity, watertype, and waterlevel
        self.categorize_position();

        if self.pm.snapinitial {
            self.initial_snap();
        }

        if self.check_duck() {
            self.set_dimensions();
            self.categorize_position();
        }

        if self.pm.s.pm_type == PmType::Dead {
            self.dead_move();
        }

        self.check_special_movement();

        // drop timing counter
        if self.pm.s.pm_time != 0 {
            let msec = self.pm.cmd.msec as u16;
            if msec >= self.pm.s.pm_time {
                self.pm.s.pm_flags.remove(PmFlags::ALL_TIMES);
                self.pm.s.pm_time = 0;
            } else {
                self.pm.s.pm_time -= msec;
            }
        }

        if self.pm.s.pm_flags.contains(PmFlags::TIME_TELEPORT) {
            // teleport pause stays exactly in place
        } else if self.pm.s.pm_flags.contains(PmFlags::TIME_WATERJUMP) {
            // waterjump has no control, but falls
            self.pml.velocity[2] -= self.pm.s.gravity as f32 * self.pml.frametime;
            if self.pml.velocity[2] < 0.0 {
                // cancel as soon as we are falling down again
                self.pm.s.pm_flags.remove(PmFlags::ALL_TIMES);
                self.pm.s.pm_time = 0;
            }

            self.step_slide_move();
        } else {
            self.check_jump();

            self.friction();

            if self.pm.waterlevel >= WaterLevel::Waist {
                self.water_move();
            } else {
                let mut angles = self.pm.viewangles;
                if angles[PITCH] > 180.0 {
                    angles[PITCH] -= 360.0;
                }
                angles[PITCH] /= 3.0;

                angle_vectors(
                    &angles,
                    Some(&mut self.pml.forward),
                    Some(&mut self.pml.right),
                    None,
                );

                self.air_move();
            }
        }

        // set groundentity, watertype, and waterlevel for final spot
        self.categorize_position();

        // trick jump: a jump pressed inside the window right after landing
        if self.pm.s.pm_flags.contains(PmFlags::TIME_TRICK) {
            self.check_jump();
        }

        self.snap_position();
    }
}

// ============================================================
// Public API
// ============================================================

/// Run one tick of player movement with the default parameters.
/// Can be called by either the server or the client.
pub fn pmove<C: PmoveCallbacks + ?Sized>(pm: &mut PmoveData, callbacks: &C) {
    pmove_with_params(pm, &PmoveParams::default(), callbacks);
}

/// Run one tick of player movement.
pub fn pmove_with_params<C: PmoveCallbacks + ?Sized>(
    pm: &mut PmoveData,
    params: &PmoveParams,
    callbacks: &C,
) {
    let mut ctx = PmoveContext {
        pm,
        pml: PmLocal::default(),
        params,
        cb: callbacks,
    };
    ctx.execute();
}

struct FnCallbacks<T, P> {
    trace: T,
    point_contents: P,
}

impl<T, P> PmoveCallbacks for FnCallbacks<T, P>
where
    T: Fn(&Vec3, &Vec3, &Vec3, &Vec3, Contents) -> Trace,
    P: Fn(&Vec3) -> Contents,
{
    fn trace(&self, start: &Vec3, mins: &Vec3, maxs: &Vec3, end: &Vec3, mask: Contents) -> Trace {
        (self.trace)(start, mins, maxs, end, mask)
    }

    fn pointcontents(&self, point: &Vec3) -> Contents {
        (self.point_contents)(point)
    }
}

/// Functional form of `pmove`: returns the next state without exposing the
/// per-tick outputs.
pub fn apply_pmove<T, P>(state: &PmoveState, cmd: &UserCmd, trace: T, point_contents: P) -> PmoveState
where
    T: Fn(&Vec3, &Vec3, &Vec3, &Vec3, Contents) -> Trace,
    P: Fn(&Vec3) -> Contents,
{
    let mut pm = PmoveData::new(*state, *cmd);
    pmove(&mut pm, &FnCallbacks { trace, point_contents });
    pm.s
}

// ============================================================
// Unit tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmodel::tests::push_axis_brush;
    use crate::cmodel::CollisionModel;
    use crate::cmtrace;
    use crate::qfiles::{CollisionLumps, DLeaf};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::cell::RefCell;

    /// Stub callbacks for testing: open air, no collisions.
    struct OpenAirCallbacks;

    impl PmoveCallbacks for OpenAirCallbacks {
        fn trace(&self, _start: &Vec3, _mins: &Vec3, _maxs: &Vec3, end: &Vec3, _mask: Contents) -> Trace {
            Trace {
                endpos: *end,
                ..Default::default()
            }
        }

        fn pointcontents(&self, _point: &Vec3) -> Contents {
            Contents::empty()
        }
    }

    /// Open air with a water surface at z = 100.
    struct WaterCallbacks;

    impl PmoveCallbacks for WaterCallbacks {
        fn trace(&self, _start: &Vec3, _mins: &Vec3, _maxs: &Vec3, end: &Vec3, _mask: Contents) -> Trace {
            Trace {
                endpos: *end,
                ..Default::default()
            }
        }

        fn pointcontents(&self, point: &Vec3) -> Contents {
            if point[2] < 100.0 {
                Contents::WATER
            } else {
                Contents::empty()
            }
        }
    }

    /// Collision against a real model.
    struct ModelCallbacks<'a>(&'a CollisionModel);

    impl PmoveCallbacks for ModelCallbacks<'_> {
        fn trace(&self, start: &Vec3, mins: &Vec3, maxs: &Vec3, end: &Vec3, mask: Contents) -> Trace {
            cmtrace::trace(self.0, start, end, mins, maxs, mask)
        }

        fn pointcontents(&self, _point: &Vec3) -> Contents {
            // single-leaf fixtures report every brush's contents everywhere
            Contents::empty()
        }
    }

    /// Floor with its top at z = 0, plus extra brushes.
    fn room_lumps(extra: &[(Vec3, Vec3)]) -> CollisionLumps {
        let mut lumps = CollisionLumps::default();
        let mut brushes = vec![([-1024.0, -1024.0, -64.0], [1024.0, 1024.0, 0.0])];
        brushes.extend_from_slice(extra);
        for (mins, maxs) in &brushes {
            let b = push_axis_brush(&mut lumps, *mins, *maxs, Contents::SOLID);
            lumps.leafbrushes.push(b);
        }
        lumps.leafs.push(DLeaf {
            contents: Contents::SOLID.bits(),
            numleafbrushes: brushes.len() as u16,
            ..Default::default()
        });
        lumps
    }

    fn room(extra: &[(Vec3, Vec3)]) -> CollisionModel {
        CollisionModel::from_lumps(&room_lumps(extra)).expect("room")
    }

    // standing height over the floor after a ground probe settles
    const REST_Z: f32 = 24.03125;

    fn standing(origin: Vec3) -> PmoveData {
        let mut pm = PmoveData::default();
        pm.s.gravity = 800;
        pm.s.origin = origin;
        pm.s.pm_flags = PmFlags::ON_GROUND;
        pm.cmd.msec = 16;
        pm
    }

    fn context<'a, C: PmoveCallbacks>(
        pm: &'a mut PmoveData,
        params: &'a PmoveParams,
        cb: &'a C,
    ) -> PmoveContext<'a, C> {
        let (mins, maxs, viewheight) = player_dimensions(pm.s.pm_type, pm.s.pm_flags);
        pm.mins = mins;
        pm.maxs = maxs;
        pm.s.viewheight = viewheight;
        let pml = PmLocal {
            origin: pm.s.origin,
            velocity: pm.s.velocity,
            start_velocity: pm.s.velocity,
            previous_origin: pm.s.origin,
            frametime: pm.cmd.msec as f32 * 0.001,
            ..Default::default()
        };
        PmoveContext { pm, pml, params, cb }
    }

    #[test]
    fn test_clip_velocity() {
        let out = pm_clip_velocity(&[10.0, 0.0, -10.0], &[0.0, 0.0, 1.0], 1.0);
        assert!((out[0] - 10.0).abs() < 1e-6);
        assert!(out[1].abs() < 1e-6);
        assert!(out[2].abs() < 1e-6); // vertical component removed
    }

    #[test]
    fn test_clip_velocity_overbounce() {
        // -100 - (-100 * 1.01) = 1.0
        let out = pm_clip_velocity(&[0.0, 0.0, -100.0], &[0.0, 0.0, 1.0], 1.01);
        assert!((out[2] - 1.0).abs() < 0.01);
    }

    #[test]
    fn test_clip_velocity_stop_epsilon_clamping() {
        let out = pm_clip_velocity(&[0.05, -0.05, 0.0], &[0.0, 0.0, 1.0], 1.0);
        assert_eq!(out[0], 0.0);
        assert_eq!(out[1], 0.0);
    }

    #[test]
    fn test_clip_velocity_diagonal_surface() {
        let n = 1.0 / 2.0f32.sqrt();
        let out = pm_clip_velocity(&[100.0, 0.0, -100.0], &[0.0, n, n], 1.0);
        assert!((out[0] - 100.0).abs() < 0.1, "out[0]={}", out[0]);
        assert!((out[1] - 50.0).abs() < 0.1, "out[1]={}", out[1]);
        assert!((out[2] + 50.0).abs() < 0.1, "out[2]={}", out[2]);
    }

    #[test]
    fn test_player_dimensions() {
        let (mins, maxs, vh) = player_dimensions(PmType::Normal, PmFlags::empty());
        assert_eq!((mins, maxs, vh), ([-16.0, -16.0, -24.0], [16.0, 16.0, 32.0], 22));
        let (_, maxs, vh) = player_dimensions(PmType::Normal, PmFlags::DUCKED);
        assert_eq!((maxs[2], vh), (4.0, -2));
        let (mins, maxs, vh) = player_dimensions(PmType::Gib, PmFlags::DUCKED);
        assert_eq!((mins[2], maxs[2], vh), (0.0, 16.0, 8));
    }

    #[test]
    fn test_clip_mask_per_type() {
        struct MaskRecorder(RefCell<Vec<Contents>>);
        impl PmoveCallbacks for MaskRecorder {
            fn trace(&self, _s: &Vec3, _mn: &Vec3, _mx: &Vec3, end: &Vec3, mask: Contents) -> Trace {
                self.0.borrow_mut().push(mask);
                Trace {
                    endpos: *end,
                    ..Default::default()
                }
            }
            fn pointcontents(&self, _p: &Vec3) -> Contents {
                Contents::empty()
            }
        }

        let masks_for = |pm_type: PmType, flags: PmFlags| {
            let cb = MaskRecorder(RefCell::new(Vec::new()));
            let mut pm = PmoveData::default();
            pm.s.pm_type = pm_type;
            pm.s.pm_flags = flags;
            pm.s.gravity = 800;
            pm.cmd.msec = 16;
            pm.cmd.forwardmove = 200;
            pmove(&mut pm, &cb);
            cb.0.into_inner()
        };

        let normal = masks_for(PmType::Normal, PmFlags::empty());
        assert!(!normal.is_empty());
        assert!(normal.iter().all(|&m| m == MASK_PLAYERSOLID));

        let ghost = masks_for(PmType::Normal, PmFlags::IGNORE_PLAYER_COLLISION);
        assert!(ghost.iter().all(|&m| m == MASK_PLAYERSOLID - Contents::PLAYER));

        let dead = masks_for(PmType::Dead, PmFlags::empty());
        assert!(dead.iter().all(|&m| m == MASK_DEADSOLID));

        let spectator = masks_for(PmType::Spectator, PmFlags::empty());
        assert!(spectator.iter().all(|&m| m == MASK_SOLID));
    }

    #[test]
    fn test_pmove_spectator_moves() {
        let mut pm = PmoveData::default();
        pm.s.pm_type = PmType::Spectator;
        pm.s.origin = [0.0, 0.0, 100.0];
        pm.cmd.msec = 16;
        pm.cmd.forwardmove = 200;

        pmove(&mut pm, &OpenAirCallbacks);

        // viewangles default to 0 so forward = +x
        assert!(pm.s.velocity[0] > 0.0);
        assert!(pm.s.origin[0] > 0.0);
        assert_eq!(pm.s.origin[2], 100.0);
    }

    #[test]
    fn test_pmove_noclip_passes_through_walls() {
        let model = room(&[([8.0, -64.0, 0.0], [24.0, 64.0, 128.0])]);
        let mut pm = PmoveData::default();
        pm.s.pm_type = PmType::NoClip;
        pm.s.origin = [0.0, 0.0, 40.0];
        pm.s.velocity = [400.0, 0.0, 0.0];
        pm.cmd.msec = 100;
        pm.cmd.forwardmove = 400;

        pmove(&mut pm, &ModelCallbacks(&model));
        assert!(pm.s.origin[0] > 24.0, "origin {:?}", pm.s.origin);
    }

    #[test]
    fn test_pmove_freeze_no_movement() {
        let mut pm = PmoveData::default();
        pm.s.pm_type = PmType::Freeze;
        pm.s.origin = [100.0, 100.0, 100.0];
        pm.s.gravity = 800;
        pm.cmd.msec = 16;
        pm.cmd.forwardmove = 127;

        pmove(&mut pm, &OpenAirCallbacks);
        assert_eq!(pm.s.origin, [100.0, 100.0, 100.0]);
    }

    #[test]
    fn test_pmove_gravity_in_air() {
        let mut pm = PmoveData::default();
        pm.s.gravity = 800;
        pm.s.origin = [0.0, 0.0, 1000.0];
        pm.cmd.msec = 100;

        pmove(&mut pm, &OpenAirCallbacks);

        // -800 * 0.1
        assert!((pm.s.velocity[2] + 80.0).abs() < 1e-3, "vel_z = {}", pm.s.velocity[2]);
        assert!(pm.s.origin[2] < 1000.0);
        assert!(pm.groundentity.is_none());
    }

    #[test]
    fn test_pmove_on_ground() {
        let model = room(&[]);
        let mut pm = standing([0.0, 0.0, 24.125]);
        pm.s.pm_flags = PmFlags::empty();

        pmove(&mut pm, &ModelCallbacks(&model));

        assert!(pm.s.pm_flags.contains(PmFlags::ON_GROUND));
        assert_eq!(pm.groundentity, Some(Touched::World));
        assert_eq!(pm.groundplane.map(|p| p.normal), Some([0.0, 0.0, 1.0]));
        assert_eq!(pm.snap, SnapResolution::Unchanged);
        assert!(pm.touchents.contains(&Touched::World));
    }

    #[test]
    fn test_ground_friction() {
        let model = room(&[]);
        let mut pm = standing([0.0, 0.0, REST_Z]);
        pm.s.velocity = [200.0, 0.0, 0.0];

        pmove(&mut pm, &ModelCallbacks(&model));

        // 200 - 200 * 6 * 0.016
        assert!((pm.s.velocity[0] - 180.8).abs() < 1e-3, "vel {:?}", pm.s.velocity);
        assert!(pm.s.origin[0] > 2.8 && pm.s.origin[0] < 3.0);
        assert_eq!(pm.s.velocity[2], 0.0);
    }

    #[test]
    fn test_friction_stops_slow_movement() {
        let model = room(&[]);
        let mut pm = standing([0.0, 0.0, REST_Z]);
        pm.s.velocity = [0.5, 0.5, 0.0];

        pmove(&mut pm, &ModelCallbacks(&model));
        assert_eq!(pm.s.velocity, [0.0, 0.0, 0.0]);
        assert_eq!(pm.s.origin, [0.0, 0.0, REST_Z]);
    }

    #[test]
    fn test_categorize_trick_window() {
        let model = room(&[]);
        let cb = ModelCallbacks(&model);
        let params = PmoveParams::default();
        let mut pm = standing([0.0, 0.0, 24.125]);
        pm.s.pm_flags = PmFlags::empty();

        let mut ctx = context(&mut pm, &params, &cb);
        ctx.pml.velocity = [0.0, 0.0, 120.0];
        ctx.pml.start_velocity = [0.0, 0.0, 220.0];
        ctx.categorize_position();

        assert!(pm.s.pm_flags.contains(PmFlags::ON_GROUND));
        assert!(pm.s.pm_flags.contains(PmFlags::TIME_TRICK));
        assert!(!pm.s.pm_flags.contains(PmFlags::TIME_LAND));
        assert_eq!(pm.s.pm_time, 64);
        assert!((pm.impact_delta - 221.2).abs() < 1e-3, "impact {}", pm.impact_delta);
    }

    #[test]
    fn test_categorize_ducked_landing() {
        let model = room(&[]);
        let cb = ModelCallbacks(&model);
        let params = PmoveParams::default();
        let mut pm = standing([0.0, 0.0, 24.125]);
        pm.s.pm_flags = PmFlags::DUCKED;

        let mut ctx = context(&mut pm, &params, &cb);
        ctx.pml.velocity = [0.0, 0.0, -120.0];
        ctx.pml.start_velocity = [0.0, 0.0, 200.0];
        ctx.categorize_position();

        assert!(!pm.s.pm_flags.contains(PmFlags::TIME_TRICK));
        assert!(pm.s.pm_flags.contains(PmFlags::TIME_LAND));
        assert_eq!(pm.s.pm_time, 128);
        assert!((pm.impact_delta - 198.8).abs() < 1e-3, "impact {}", pm.impact_delta);
    }

    #[test]
    fn test_categorize_n64_landing_blocks_trick() {
        let model = room(&[]);
        let cb = ModelCallbacks(&model);
        let params = PmoveParams {
            n64_physics: true,
            ..Default::default()
        };
        let mut pm = standing([0.0, 0.0, 24.125]);
        pm.s.pm_flags = PmFlags::empty();

        let mut ctx = context(&mut pm, &params, &cb);
        ctx.pml.velocity = [0.0, 0.0, 150.0];
        ctx.categorize_position();

        assert!(!pm.s.pm_flags.contains(PmFlags::TIME_TRICK));
        assert!(pm.s.pm_flags.contains(PmFlags::TIME_LAND));
        assert_eq!(pm.s.pm_time, 128);
    }

    #[test]
    fn test_categorize_fast_rise_is_airborne() {
        let model = room(&[]);
        let cb = ModelCallbacks(&model);
        let params = PmoveParams::default();
        let mut pm = standing([0.0, 0.0, 24.125]);

        let mut ctx = context(&mut pm, &params, &cb);
        ctx.pml.velocity = [0.0, 0.0, 181.0];
        ctx.categorize_position();

        assert!(pm.groundentity.is_none());
        assert!(!pm.s.pm_flags.contains(PmFlags::ON_GROUND));
    }

    #[test]
    fn test_water_levels() {
        let params = PmoveParams::default();
        let mut pm = PmoveData::default();
        let ctx = context(&mut pm, &params, &WaterCallbacks);

        assert_eq!(ctx.water_level(&[0.0, 0.0, 60.0]), (WaterLevel::Under, Contents::WATER));
        assert_eq!(ctx.water_level(&[0.0, 0.0, 100.0]), (WaterLevel::Waist, Contents::WATER));
        assert_eq!(ctx.water_level(&[0.0, 0.0, 120.0]), (WaterLevel::Feet, Contents::WATER));
        assert_eq!(ctx.water_level(&[0.0, 0.0, 200.0]), (WaterLevel::None, Contents::empty()));
    }

    #[test]
    fn test_jump_from_ground() {
        let model = room(&[]);
        let mut pm = standing([0.0, 0.0, REST_Z]);
        pm.cmd.buttons = Buttons::JUMP;

        pmove(&mut pm, &ModelCallbacks(&model));

        // 270 - 800 * 0.016
        assert!((pm.s.velocity[2] - 257.2).abs() < 1e-3, "vel {:?}", pm.s.velocity);
        assert!(pm.s.origin[2] > REST_Z);
        assert!(pm.s.pm_flags.contains(PmFlags::JUMP_HELD));
        assert!(!pm.s.pm_flags.contains(PmFlags::ON_GROUND));
        assert!(pm.groundentity.is_none());
    }

    #[test]
    fn test_jump_held_does_not_repeat() {
        let model = room(&[]);
        let mut pm = standing([0.0, 0.0, REST_Z]);
        pm.s.pm_flags |= PmFlags::JUMP_HELD;
        pm.cmd.buttons = Buttons::JUMP;

        pmove(&mut pm, &ModelCallbacks(&model));
        assert_eq!(pm.s.velocity[2], 0.0);
        assert!(pm.s.pm_flags.contains(PmFlags::ON_GROUND));

        // releasing the button clears the latch
        pm.cmd.buttons = Buttons::empty();
        pmove(&mut pm, &ModelCallbacks(&model));
        assert!(!pm.s.pm_flags.contains(PmFlags::JUMP_HELD));
    }

    #[test]
    fn test_land_timer_blocks_jump() {
        let model = room(&[]);
        let mut pm = standing([0.0, 0.0, REST_Z]);
        pm.s.pm_flags |= PmFlags::TIME_LAND;
        pm.s.pm_time = 100;
        pm.cmd.buttons = Buttons::JUMP;

        pmove(&mut pm, &ModelCallbacks(&model));
        assert_eq!(pm.s.velocity[2], 0.0);
        assert_eq!(pm.s.pm_time, 84);
        assert!(pm.s.pm_flags.contains(PmFlags::TIME_LAND));
    }

    #[test]
    fn test_timer_expires() {
        let model = room(&[]);
        let mut pm = standing([0.0, 0.0, REST_Z]);
        pm.s.pm_flags |= PmFlags::TIME_LAND;
        pm.s.pm_time = 10;

        pmove(&mut pm, &ModelCallbacks(&model));
        assert_eq!(pm.s.pm_time, 0);
        assert!(!pm.s.pm_flags.intersects(PmFlags::ALL_TIMES));
    }

    #[test]
    fn test_teleport_pause_holds_position() {
        let mut pm = PmoveData::default();
        pm.s.gravity = 800;
        pm.s.origin = [10.0, 20.0, 500.0];
        pm.s.pm_flags = PmFlags::TIME_TELEPORT;
        pm.s.pm_time = 100;
        pm.cmd.msec = 16;
        pm.cmd.forwardmove = 300;
        pm.cmd.angles[PITCH] = 2000;

        pmove(&mut pm, &OpenAirCallbacks);
        assert_eq!(pm.s.origin, [10.0, 20.0, 500.0]);
        assert_eq!(pm.s.pm_time, 84);
        assert_eq!(pm.viewangles[PITCH], 0.0);
    }

    #[test]
    fn test_duck_with_headroom() {
        let model = room(&[]);
        let mut pm = standing([0.0, 0.0, REST_Z]);
        pm.cmd.buttons = Buttons::CROUCH;

        pmove(&mut pm, &ModelCallbacks(&model));
        assert!(pm.s.pm_flags.contains(PmFlags::DUCKED));
        assert_eq!(pm.maxs[2], 4.0);
        assert_eq!(pm.s.viewheight, -2);

        // stand back up in the open
        pm.cmd.buttons = Buttons::empty();
        pmove(&mut pm, &ModelCallbacks(&model));
        assert!(!pm.s.pm_flags.contains(PmFlags::DUCKED));
        assert_eq!(pm.maxs[2], 32.0);
        assert_eq!(pm.s.viewheight, 22);
    }

    #[test]
    fn test_duck_stays_under_low_ceiling() {
        // ceiling 14 units above the crouched head
        let model = room(&[([-256.0, -256.0, 42.0], [256.0, 256.0, 64.0])]);
        let mut pm = standing([0.0, 0.0, REST_Z]);
        pm.s.pm_flags |= PmFlags::DUCKED;

        pmove(&mut pm, &ModelCallbacks(&model));
        assert!(pm.s.pm_flags.contains(PmFlags::DUCKED));
        assert_eq!(pm.maxs[2], 4.0);
        assert_eq!(pm.s.viewheight, -2);
        assert_eq!(pm.snap, SnapResolution::Unchanged);
    }

    #[test]
    fn test_crouch_without_room_stays_standing() {
        /// The room floor, but every crouch-sized position test is solid.
        struct NoCrouchRoom<'a>(&'a CollisionModel);

        impl PmoveCallbacks for NoCrouchRoom<'_> {
            fn trace(&self, start: &Vec3, mins: &Vec3, maxs: &Vec3, end: &Vec3, mask: Contents) -> Trace {
                if start == end && maxs[2] == 4.0 {
                    return Trace {
                        allsolid: true,
                        startsolid: true,
                        fraction: 0.0,
                        endpos: *start,
                        ..Default::default()
                    };
                }
                cmtrace::trace(self.0, start, end, mins, maxs, mask)
            }

            fn pointcontents(&self, _point: &Vec3) -> Contents {
                Contents::empty()
            }
        }

        let model = room(&[]);
        let mut pm = standing([0.0, 0.0, REST_Z]);
        pm.cmd.buttons = Buttons::CROUCH;

        pmove(&mut pm, &NoCrouchRoom(&model));
        assert!(!pm.s.pm_flags.contains(PmFlags::DUCKED));
        assert!(pm.s.pm_flags.contains(PmFlags::ON_GROUND));
        assert_eq!(pm.maxs[2], 32.0);
        assert_eq!(pm.s.viewheight, 22);
    }

    #[test]
    fn test_duck_needs_ground() {
        let mut pm = PmoveData::default();
        pm.s.gravity = 800;
        pm.s.origin = [0.0, 0.0, 500.0];
        pm.cmd.msec = 16;
        pm.cmd.buttons = Buttons::CROUCH;

        // airborne crouching is allowed unless hovering just above water
        pmove(&mut pm, &OpenAirCallbacks);
        assert!(pm.s.pm_flags.contains(PmFlags::DUCKED));

        let params = PmoveParams {
            n64_physics: true,
            ..Default::default()
        };
        let mut pm = standing([0.0, 0.0, REST_Z]);
        pm.cmd.buttons = Buttons::CROUCH;
        let model = room(&[]);
        pmove_with_params(&mut pm, &params, &ModelCallbacks(&model));
        assert!(!pm.s.pm_flags.contains(PmFlags::DUCKED));
    }

    #[test]
    fn test_dead_forces_duck_and_slows() {
        let model = room(&[]);
        let mut pm = standing([0.0, 0.0, REST_Z]);
        pm.s.pm_type = PmType::Dead;
        pm.s.velocity = [15.0, 0.0, 0.0];
        pm.cmd.forwardmove = 400;
        pm.cmd.buttons = Buttons::JUMP;

        pmove(&mut pm, &ModelCallbacks(&model));
        assert!(pm.s.pm_flags.contains(PmFlags::DUCKED));
        assert_eq!(pm.s.velocity, [0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_walk_into_wall_reports_blocked() {
        let model = room(&[([40.0, -256.0, 0.0], [80.0, 256.0, 128.0])]);
        let mut pm = standing([0.0, 0.0, REST_Z]);
        pm.s.velocity = [300.0, 0.0, 0.0];
        pm.cmd.msec = 100;
        pm.cmd.forwardmove = 400;

        pmove(&mut pm, &ModelCallbacks(&model));
        assert!(pm.blocked.contains(Blocked::WALL));
        assert!(pm.s.origin[0] > 20.0 && pm.s.origin[0] < 24.0, "origin {:?}", pm.s.origin);
        assert_eq!(pm.s.velocity[0], 0.0);
    }

    #[test]
    fn test_step_up_onto_stair() {
        // 16 unit stair starting just ahead
        let model = room(&[([20.0, -256.0, 0.0], [512.0, 256.0, 16.0])]);
        let mut pm = standing([0.0, 0.0, REST_Z]);
        pm.s.velocity = [300.0, 0.0, 0.0];
        pm.cmd.msec = 100;
        pm.cmd.forwardmove = 400;

        pmove(&mut pm, &ModelCallbacks(&model));
        assert!(pm.s.origin[2] > REST_Z + 15.0, "origin {:?}", pm.s.origin);
        assert!(pm.s.origin[0] > 20.0);
    }

    #[test]
    fn test_ladder_sets_flag_and_holds_height() {
        struct LadderCallbacks;
        impl PmoveCallbacks for LadderCallbacks {
            fn trace(&self, start: &Vec3, _mn: &Vec3, _mx: &Vec3, end: &Vec3, _mask: Contents) -> Trace {
                if end[0] > start[0] + 0.5 && end[2] == start[2] {
                    Trace {
                        fraction: 0.5,
                        endpos: [start[0] + 0.5 * (end[0] - start[0]), start[1], start[2]],
                        plane: Some(CPlane::new([-1.0, 0.0, 0.0], -start[0] - 0.5)),
                        contents: Contents::LADDER | Contents::SOLID,
                        ..Default::default()
                    }
                } else {
                    Trace {
                        endpos: *end,
                        ..Default::default()
                    }
                }
            }
            fn pointcontents(&self, _p: &Vec3) -> Contents {
                Contents::empty()
            }
        }

        let mut pm = PmoveData::default();
        pm.s.gravity = 800;
        pm.s.origin = [0.0, 0.0, 300.0];
        pm.cmd.msec = 16;

        pmove(&mut pm, &LadderCallbacks);
        assert!(pm.s.pm_flags.contains(PmFlags::ON_LADDER));
        assert_eq!(pm.s.velocity, [0.0, 0.0, 0.0]);
        assert_eq!(pm.s.origin, [0.0, 0.0, 300.0]);
    }

    #[test]
    fn test_currents_and_conveyor() {
        let params = PmoveParams::default();

        // shallow current on a conveyor: half water speed plus belt speed
        let mut pm = standing([0.0, 0.0, REST_Z]);
        pm.groundentity = Some(Touched::World);
        pm.waterlevel = WaterLevel::Feet;
        pm.watertype = Contents::WATER | Contents::CURRENT_90;
        let mut ctx = context(&mut pm, &params, &OpenAirCallbacks);
        ctx.pml.groundcontents = Contents::SOLID | Contents::CURRENT_0;
        let mut wishvel = [0.0; 3];
        ctx.add_currents(&mut wishvel);
        assert_eq!(wishvel, [100.0, 200.0, 0.0]);

        // swimming in a current gets the full water speed
        let mut pm = standing([0.0, 0.0, 50.0]);
        pm.waterlevel = WaterLevel::Under;
        pm.watertype = Contents::WATER | Contents::CURRENT_180;
        let ctx = context(&mut pm, &params, &OpenAirCallbacks);
        let mut wishvel = [0.0; 3];
        ctx.add_currents(&mut wishvel);
        assert_eq!(wishvel, [-400.0, 0.0, 0.0]);
    }

    /// A model with water everywhere below z = 60.
    struct PoolCallbacks<'a> {
        model: &'a CollisionModel,
        water: Contents,
    }

    impl PmoveCallbacks for PoolCallbacks<'_> {
        fn trace(&self, start: &Vec3, mins: &Vec3, maxs: &Vec3, end: &Vec3, mask: Contents) -> Trace {
            cmtrace::trace(self.model, start, end, mins, maxs, mask)
        }

        fn pointcontents(&self, point: &Vec3) -> Contents {
            if point[2] < 60.0 {
                self.water
            } else {
                Contents::empty()
            }
        }
    }

    fn waist_deep_at_ledge() -> PmoveData {
        let mut pm = PmoveData::default();
        pm.s.gravity = 800;
        pm.s.origin = [0.0, 0.0, 50.0];
        pm.cmd.msec = 16;
        pm.cmd.forwardmove = 200;
        pm
    }

    #[test]
    fn test_water_jump_onto_ledge() {
        let model = room(&[([40.0, -256.0, 0.0], [296.0, 256.0, 80.0])]);
        let cb = PoolCallbacks {
            model: &model,
            water: Contents::WATER,
        };

        let mut pm = waist_deep_at_ledge();
        pmove(&mut pm, &cb);
        assert!(pm.s.pm_flags.contains(PmFlags::TIME_WATERJUMP));
        assert_eq!(pm.s.pm_time, WATERJUMP_TIME - 16);
        assert!(pm.s.velocity[2] > 300.0 && pm.s.velocity[2] < 350.0);
        assert!(pm.s.origin[2] > 50.0);
    }

    #[test]
    fn test_no_waterjump_contents_blocks_jump() {
        let model = room(&[([40.0, -256.0, 0.0], [296.0, 256.0, 80.0])]);
        let cb = PoolCallbacks {
            model: &model,
            water: Contents::WATER | Contents::NO_WATERJUMP,
        };

        let mut pm = waist_deep_at_ledge();
        pmove(&mut pm, &cb);
        assert!(!pm.s.pm_flags.contains(PmFlags::TIME_WATERJUMP));
        assert_eq!(pm.s.pm_time, 0);
    }

    #[test]
    fn test_swim_drifts_down_when_idle() {
        let mut pm = PmoveData::default();
        pm.s.gravity = 800;
        pm.s.origin = [0.0, 0.0, 50.0];
        pm.cmd.msec = 16;

        pmove(&mut pm, &WaterCallbacks);
        assert_eq!(pm.waterlevel, WaterLevel::Under);
        assert_eq!(pm.watertype, Contents::WATER);
        // no gravity under water, only the slow drift
        assert!(pm.s.velocity[2] < 0.0 && pm.s.velocity[2] > -10.0, "vel {:?}", pm.s.velocity);
    }

    #[test]
    fn test_initial_snap_moves_out_of_floor() {
        let model = room(&[]);
        let mut pm = standing([0.0, 0.0, 23.5]);
        pm.snapinitial = true;

        pmove(&mut pm, &ModelCallbacks(&model));
        assert!(pm.s.origin[2] > 24.0, "origin {:?}", pm.s.origin);
        assert_ne!(pm.snap, SnapResolution::Reverted);
    }

    #[test]
    fn test_apply_pmove_matches_pmove() {
        let model = room(&[([64.0, -64.0, 0.0], [128.0, 64.0, 16.0])]);
        let state = PmoveState {
            origin: [0.0, 0.0, REST_Z],
            gravity: 800,
            pm_flags: PmFlags::ON_GROUND,
            ..Default::default()
        };
        let cmd = UserCmd {
            msec: 16,
            forwardmove: 300,
            ..Default::default()
        };

        let functional = apply_pmove(
            &state,
            &cmd,
            |s, mn, mx, e, mask| cmtrace::trace(&model, s, e, mn, mx, mask),
            |_| Contents::empty(),
        );

        let mut pm = PmoveData::new(state, cmd);
        pmove(&mut pm, &ModelCallbacks(&model));
        assert_eq!(functional, pm.s);
        assert!(functional.origin[0] > 0.0);
    }

    fn random_cmds(seed: u64, count: usize) -> Vec<UserCmd> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..count)
            .map(|_| {
                let mut buttons = Buttons::empty();
                if rng.gen_bool(0.2) {
                    buttons |= Buttons::JUMP;
                }
                if rng.gen_bool(0.1) {
                    buttons |= Buttons::CROUCH;
                }
                UserCmd {
                    msec: rng.gen_range(8..=25),
                    buttons,
                    angles: [rng.gen_range(-3000..3000), rng.gen(), 0],
                    forwardmove: rng.gen_range(-400..=400),
                    sidemove: rng.gen_range(-400..=400),
                    upmove: 0,
                }
            })
            .collect()
    }

    fn run_ticks(model: &CollisionModel, cmds: &[UserCmd]) -> Vec<PmoveState> {
        let mut pm = standing([0.0, 0.0, REST_Z]);
        let cb = ModelCallbacks(model);
        cmds.iter()
            .map(|cmd| {
                pm.cmd = *cmd;
                pmove(&mut pm, &cb);
                pm.s
            })
            .collect()
    }

    #[test]
    fn test_pmove_is_deterministic() {
        let extra = [
            ([64.0, -64.0, 0.0], [128.0, 64.0, 16.0]),
            ([-512.0, 256.0, 0.0], [512.0, 288.0, 128.0]),
            ([-300.0, -300.0, 0.0], [-200.0, -200.0, 200.0]),
        ];
        let lumps = room_lumps(&extra);
        let a = CollisionModel::from_lumps(&lumps).expect("model a");
        let b = CollisionModel::from_lumps(&lumps).expect("model b");

        let cmds = random_cmds(0x5eed, 300);
        let first = run_ticks(&a, &cmds);
        let second = run_ticks(&a, &cmds);
        let other_model = run_ticks(&b, &cmds);

        assert_eq!(first, second);
        assert_eq!(first, other_model);
        assert!(first.iter().any(|s| s.origin != first[0].origin));
    }

    #[test]
    fn test_movement_defaults() {
        let p = PmoveParams::default();
        assert_eq!(p.stopspeed, 100.0);
        assert_eq!(p.maxspeed, 300.0);
        assert_eq!(p.duckspeed, 100.0);
        assert_eq!(p.accelerate, 10.0);
        assert_eq!(p.airaccelerate, 0.0);
        assert_eq!(p.wateraccelerate, 10.0);
        assert_eq!(p.friction, 6.0);
        assert_eq!(p.waterfriction, 1.0);
        assert_eq!(p.waterspeed, 400.0);
        assert_eq!(p.jump_height, 270.0);
        assert!(!p.n64_physics);
        assert_eq!(STEPSIZE, 18.0);
        assert_eq!(MIN_STEP_NORMAL, 0.7);
        assert_eq!(STOP_EPSILON, 0.1);
    }
}
