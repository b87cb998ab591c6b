// q_shared.rs -- foundational types and math shared by collision and movement

// ============================================================
// Basic types
// ============================================================

pub type Vec3 = [f32; 3];

pub const VEC3_ORIGIN: Vec3 = [0.0, 0.0, 0.0];

// Angle indexes
pub const PITCH: usize = 0; // up / down
pub const YAW: usize = 1; // left / right
pub const ROLL: usize = 2; // fall over

pub const MAX_CLIP_PLANES: usize = 5;

// ============================================================
// Content flags
// ============================================================

bitflags::bitflags! {
    /// Brush and leaf contents. Lower bits are visible, higher bits are not.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct Contents: u32 {
        const SOLID         = 1 << 0;
        const WINDOW        = 1 << 1;
        const AUX           = 1 << 2;
        const LAVA          = 1 << 3;
        const SLIME         = 1 << 4;
        const WATER         = 1 << 5;
        const MIST          = 1 << 6;
        /// Touch volumes; never blocks movement.
        const TRIGGER       = 1 << 12;
        const NO_WATERJUMP  = 1 << 13;
        const PROJECTILECLIP = 1 << 14;
        const AREAPORTAL    = 1 << 15;
        const PLAYERCLIP    = 1 << 16;
        const MONSTERCLIP   = 1 << 17;
        const CURRENT_0     = 1 << 18;
        const CURRENT_90    = 1 << 19;
        const CURRENT_180   = 1 << 20;
        const CURRENT_270   = 1 << 21;
        const CURRENT_UP    = 1 << 22;
        const CURRENT_DOWN  = 1 << 23;
        const ORIGIN        = 1 << 24;
        const MONSTER       = 1 << 25;
        const DEADMONSTER   = 1 << 26;
        const DETAIL        = 1 << 27;
        const TRANSLUCENT   = 1 << 28;
        const LADDER        = 1 << 29;
        const PLAYER        = 1 << 30;
        const PROJECTILE    = 1 << 31;
    }
}

pub const MASK_ALL: Contents = Contents::all();
pub const MASK_SOLID: Contents = Contents::SOLID.union(Contents::WINDOW);
pub const MASK_PLAYERSOLID: Contents = Contents::SOLID
    .union(Contents::PLAYERCLIP)
    .union(Contents::WINDOW)
    .union(Contents::MONSTER)
    .union(Contents::PLAYER);
pub const MASK_DEADSOLID: Contents = Contents::SOLID
    .union(Contents::PLAYERCLIP)
    .union(Contents::WINDOW);
pub const MASK_MONSTERSOLID: Contents = Contents::SOLID
    .union(Contents::MONSTERCLIP)
    .union(Contents::WINDOW)
    .union(Contents::MONSTER)
    .union(Contents::PLAYER);
pub const MASK_WATER: Contents = Contents::WATER
    .union(Contents::LAVA)
    .union(Contents::SLIME);
pub const MASK_CURRENT: Contents = Contents::CURRENT_0
    .union(Contents::CURRENT_90)
    .union(Contents::CURRENT_180)
    .union(Contents::CURRENT_270)
    .union(Contents::CURRENT_UP)
    .union(Contents::CURRENT_DOWN);

// ============================================================
// Surface flags
// ============================================================

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct SurfaceFlags: u32 {
        const LIGHT    = 0x1;
        const SLICK    = 0x2; // effects game physics
        const SKY      = 0x4;
        const WARP     = 0x8;
        const TRANS33  = 0x10;
        const TRANS66  = 0x20;
        const FLOWING  = 0x40;
        const NODRAW   = 0x80;
    }
}

// ============================================================
// Plane
// ============================================================

// plane_type values; 0-2 are axial planes
pub const PLANE_X: u8 = 0;
pub const PLANE_Y: u8 = 1;
pub const PLANE_Z: u8 = 2;
pub const PLANE_ANYX: u8 = 3;
pub const PLANE_ANYY: u8 = 4;
pub const PLANE_ANYZ: u8 = 5;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CPlane {
    pub normal: Vec3,
    pub dist: f32,
    pub plane_type: u8,
    /// Bit `i` set when `normal[i] < 0`, used by `box_on_plane_side`.
    pub signbits: u8,
}

impl CPlane {
    /// Builds a plane and derives its type and sign bits from the normal.
    pub fn new(normal: Vec3, dist: f32) -> Self {
        Self {
            normal,
            dist,
            plane_type: plane_type_for_normal(&normal),
            signbits: signbits_for_plane(&normal),
        }
    }
}

/// Axial types are only given to positive-facing planes, since the fast
/// paths read `p[type] - dist` directly. Negative axial planes fall through
/// to the dominant-axis types.
pub fn plane_type_for_normal(normal: &Vec3) -> u8 {
    if normal[0] == 1.0 {
        return PLANE_X;
    }
    if normal[1] == 1.0 {
        return PLANE_Y;
    }
    if normal[2] == 1.0 {
        return PLANE_Z;
    }

    let ax = normal[0].abs();
    let ay = normal[1].abs();
    let az = normal[2].abs();
    if ax >= ay && ax >= az {
        PLANE_ANYX
    } else if ay >= ax && ay >= az {
        PLANE_ANYY
    } else {
        PLANE_ANYZ
    }
}

pub fn signbits_for_plane(normal: &Vec3) -> u8 {
    let mut bits = 0u8;
    for (j, n) in normal.iter().enumerate() {
        if *n < 0.0 {
            bits |= 1 << j;
        }
    }
    bits
}

// ============================================================
// Entities and traces
// ============================================================

/// Stable handle for a dynamic entity linked into the world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntityId(pub u32);

/// Whatever a trace or ground probe ran into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Touched {
    World,
    Entity(EntityId),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Trace {
    /// The entire move stayed inside solid.
    pub allsolid: bool,
    /// The move began inside solid.
    pub startsolid: bool,
    /// 1.0 means nothing was hit.
    pub fraction: f32,
    pub endpos: Vec3,
    /// Surface normal at impact, `None` when nothing was hit.
    pub plane: Option<CPlane>,
    pub surface_flags: SurfaceFlags,
    /// Contents of the brush that was hit.
    pub contents: Contents,
    /// `None` for world geometry.
    pub ent: Option<EntityId>,
}

impl Default for Trace {
    fn default() -> Self {
        Self {
            allsolid: false,
            startsolid: false,
            fraction: 1.0,
            endpos: [0.0; 3],
            plane: None,
            surface_flags: SurfaceFlags::empty(),
            contents: Contents::empty(),
            ent: None,
        }
    }
}

impl Trace {
    pub fn plane_normal(&self) -> Vec3 {
        self.plane.map_or([0.0; 3], |p| p.normal)
    }

    /// What the trace ran into, if it was blocked at all.
    pub fn touched(&self) -> Option<Touched> {
        if self.fraction < 1.0 || self.startsolid {
            Some(self.ent.map_or(Touched::World, Touched::Entity))
        } else {
            None
        }
    }
}

// ============================================================
// Player movement types
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum PmType {
    #[default]
    Normal,
    Grapple,
    NoClip,
    Spectator,
    // no acceleration or turning
    Dead,
    Gib,
    Freeze,
}

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct PmFlags: u16 {
        const DUCKED                   = 1 << 0;
        const JUMP_HELD                = 1 << 1;
        const ON_GROUND                = 1 << 2;
        /// pm_time is waterjump
        const TIME_WATERJUMP           = 1 << 3;
        /// pm_time is time before rejump
        const TIME_LAND                = 1 << 4;
        /// pm_time is non-moving time
        const TIME_TELEPORT            = 1 << 5;
        const NO_POSITIONAL_PREDICTION = 1 << 6;
        const ON_LADDER                = 1 << 7;
        const NO_ANGULAR_PREDICTION    = 1 << 8;
        const IGNORE_PLAYER_COLLISION  = 1 << 9;
        /// pm_time is the trick jump window
        const TIME_TRICK               = 1 << 10;
    }
}

impl PmFlags {
    pub const ALL_TIMES: PmFlags = PmFlags::TIME_WATERJUMP
        .union(PmFlags::TIME_LAND)
        .union(PmFlags::TIME_TELEPORT)
        .union(PmFlags::TIME_TRICK);
}

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct Buttons: u8 {
        const ATTACK  = 1 << 0;
        const USE     = 1 << 1;
        const HOLSTER = 1 << 2;
        const JUMP    = 1 << 3;
        const CROUCH  = 1 << 4;
        const ANY     = 1 << 7;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum WaterLevel {
    #[default]
    None,
    Feet,
    Waist,
    Under,
}

/// Everything the simulator carries from one tick to the next.
/// Client prediction and server authority must agree on every bit of it.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PmoveState {
    pub pm_type: PmType,
    pub origin: Vec3,
    pub velocity: Vec3,
    pub pm_flags: PmFlags,
    /// Milliseconds left on whichever `TIME_*` flag is set.
    pub pm_time: u16,
    pub gravity: i16,
    /// Added to command angles to get view direction.
    pub delta_angles: [i16; 3],
    pub viewheight: i8,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UserCmd {
    pub msec: u8,
    pub buttons: Buttons,
    pub angles: [i16; 3],
    pub forwardmove: i16,
    pub sidemove: i16,
    pub upmove: i16,
}

// ============================================================
// Angle/short conversion
// ============================================================

#[inline]
pub fn angle2short(x: f32) -> i32 {
    ((x * 65536.0 / 360.0) as i32) & 65535
}

#[inline]
pub fn short2angle(x: i16) -> f32 {
    (x as f32) * (360.0 / 65536.0)
}

// ============================================================
// MATHLIB -- Vector operations
// ============================================================

#[inline]
pub fn dot_product(a: &Vec3, b: &Vec3) -> f32 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

#[inline]
pub fn vector_subtract(a: &Vec3, b: &Vec3) -> Vec3 {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

#[inline]
pub fn vector_add(a: &Vec3, b: &Vec3) -> Vec3 {
    [a[0] + b[0], a[1] + b[1], a[2] + b[2]]
}

/// veca + scale * vecb
#[inline]
pub fn vector_ma(veca: &Vec3, scale: f32, vecb: &Vec3) -> Vec3 {
    [
        veca[0] + scale * vecb[0],
        veca[1] + scale * vecb[1],
        veca[2] + scale * vecb[2],
    ]
}

#[inline]
pub fn vector_scale(v: &Vec3, scale: f32) -> Vec3 {
    [v[0] * scale, v[1] * scale, v[2] * scale]
}

pub fn vector_compare(v1: &Vec3, v2: &Vec3) -> bool {
    v1[0] == v2[0] && v1[1] == v2[1] && v1[2] == v2[2]
}

/// Normalize in place, returns original length.
pub fn vector_normalize(v: &mut Vec3) -> f32 {
    let length = vector_length(v);
    if length != 0.0 {
        let ilength = 1.0 / length;
        v[0] *= ilength;
        v[1] *= ilength;
        v[2] *= ilength;
    }
    length
}

pub fn vector_length(v: &Vec3) -> f32 {
    (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt()
}

pub fn vector_length_squared(v: &Vec3) -> f32 {
    v[0] * v[0] + v[1] * v[1] + v[2] * v[2]
}

pub fn cross_product(v1: &Vec3, v2: &Vec3) -> Vec3 {
    [
        v1[1] * v2[2] - v1[2] * v2[1],
        v1[2] * v2[0] - v1[0] * v2[2],
        v1[0] * v2[1] - v1[1] * v2[0],
    ]
}

pub fn add_point_to_bounds(v: &Vec3, mins: &mut Vec3, maxs: &mut Vec3) {
    for i in 0..3 {
        if v[i] < mins[i] {
            mins[i] = v[i];
        }
        if v[i] > maxs[i] {
            maxs[i] = v[i];
        }
    }
}

/// True when the two boxes overlap or touch.
pub fn bounds_intersect(mins1: &Vec3, maxs1: &Vec3, mins2: &Vec3, maxs2: &Vec3) -> bool {
    (0..3).all(|i| mins1[i] <= maxs2[i] && maxs1[i] >= mins2[i])
}

// ============================================================
// Angle functions
// ============================================================

pub fn angle_vectors(
    angles: &Vec3,
    forward: Option<&mut Vec3>,
    right: Option<&mut Vec3>,
    up: Option<&mut Vec3>,
) {
    let angle_yaw = angles[YAW].to_radians();
    let sy = angle_yaw.sin();
    let cy = angle_yaw.cos();

    let angle_pitch = angles[PITCH].to_radians();
    let sp = angle_pitch.sin();
    let cp = angle_pitch.cos();

    let angle_roll = angles[ROLL].to_radians();
    let sr = angle_roll.sin();
    let cr = angle_roll.cos();

    if let Some(fwd) = forward {
        fwd[0] = cp * cy;
        fwd[1] = cp * sy;
        fwd[2] = -sp;
    }
    if let Some(r) = right {
        r[0] = -sr * sp * cy + -cr * -sy;
        r[1] = -sr * sp * sy + -cr * cy;
        r[2] = -sr * cp;
    }
    if let Some(u) = up {
        u[0] = cr * sp * cy + -sr * -sy;
        u[1] = cr * sp * sy + -sr * cy;
        u[2] = cr * cp;
    }
}

/// Returns 1 (front), 2 (back), or 3 (crossing) for a box vs. plane test.
pub fn box_on_plane_side(emins: &Vec3, emaxs: &Vec3, p: &CPlane) -> i32 {
    // fast axial cases
    if p.plane_type < 3 {
        let t = p.plane_type as usize;
        if p.dist <= emins[t] {
            return 1;
        }
        if p.dist >= emaxs[t] {
            return 2;
        }
        return 3;
    }

    // general case: pick the corners nearest and farthest along the normal
    let mut near = [0.0f32; 3];
    let mut far = [0.0f32; 3];
    for j in 0..3 {
        if p.signbits & (1 << j) != 0 {
            near[j] = emaxs[j];
            far[j] = emins[j];
        } else {
            near[j] = emins[j];
            far[j] = emaxs[j];
        }
    }
    let dist1 = dot_product(&p.normal, &far);
    let dist2 = dot_product(&p.normal, &near);

    let mut sides = 0;
    if dist1 >= p.dist {
        sides = 1;
    }
    if dist2 < p.dist {
        sides |= 2;
    }
    sides
}

// ============================================================
// Tests
// ============================================================
