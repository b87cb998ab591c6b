// cvar.rs -- named physics tunables
//
// Movement constants live as string-valued variables so a host can load them
// from a config file, tweak them at runtime and hand the simulator a typed
// `PmoveParams` snapshot.

use std::collections::HashMap;

use log::{debug, warn};
use thiserror::Error;

use crate::pmove::PmoveParams;

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct CvarFlags: u32 {
        /// Written out by `write_variables`.
        const ARCHIVE = 1 << 0;
        /// Not changeable through `set`.
        const NOSET   = 1 << 1;
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CvarError {
    #[error("unknown variable \"{0}\"")]
    Unknown(String),
    #[error("\"{value}\" is not a number (variable \"{name}\")")]
    InvalidValue { name: String, value: String },
    #[error("\"{value}\" is not a finite number (variable \"{name}\")")]
    NonFinite { name: String, value: String },
    #[error("{0} is write protected")]
    WriteProtected(String),
    #[error("line {line}: {reason}")]
    Config { line: usize, reason: String },
}

/// A physics variable.
#[derive(Debug, Clone, PartialEq)]
pub struct Cvar {
    pub name: String,
    pub string: String,
    pub default: String,
    pub flags: CvarFlags,
    pub modified: bool,
    pub value: f32,
}

// Variable names
pub const PM_STOPSPEED: &str = "pm_stopspeed";
pub const PM_MAXSPEED: &str = "pm_maxspeed";
pub const PM_DUCKSPEED: &str = "pm_duckspeed";
pub const PM_ACCELERATE: &str = "pm_accelerate";
pub const PM_AIRACCELERATE: &str = "pm_airaccelerate";
pub const PM_WATERACCELERATE: &str = "pm_wateraccelerate";
pub const PM_FRICTION: &str = "pm_friction";
pub const PM_WATERFRICTION: &str = "pm_waterfriction";
pub const PM_WATERSPEED: &str = "pm_waterspeed";
pub const PM_JUMPHEIGHT: &str = "pm_jumpheight";
pub const PM_N64PHYSICS: &str = "pm_n64physics";

#[derive(Debug, Clone, Default)]
pub struct CvarContext {
    pub cvar_vars: Vec<Cvar>,
    /// O(1) cvar lookup by name -> index in cvar_vars
    cvar_index: HashMap<String, usize>,
}

impl CvarContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// A context with every movement variable registered at its default.
    pub fn with_physics_defaults() -> Self {
        let d = PmoveParams::default();
        let mut ctx = Self::new();
        let archive = CvarFlags::ARCHIVE;
        ctx.get(PM_STOPSPEED, &format_value(d.stopspeed), archive);
        ctx.get(PM_MAXSPEED, &format_value(d.maxspeed), archive);
        ctx.get(PM_DUCKSPEED, &format_value(d.duckspeed), archive);
        ctx.get(PM_ACCELERATE, &format_value(d.accelerate), archive);
        ctx.get(PM_AIRACCELERATE, &format_value(d.airaccelerate), archive);
        ctx.get(PM_WATERACCELERATE, &format_value(d.wateraccelerate), archive);
        ctx.get(PM_FRICTION, &format_value(d.friction), archive);
        ctx.get(PM_WATERFRICTION, &format_value(d.waterfriction), archive);
        ctx.get(PM_WATERSPEED, &format_value(d.waterspeed), archive);
        ctx.get(PM_JUMPHEIGHT, &format_value(d.jump_height), archive);
        ctx.get(PM_N64PHYSICS, if d.n64_physics { "1" } else { "0" }, archive);
        ctx
    }

    /// Find a cvar by name. O(1) via HashMap.
    pub fn find_var(&self, name: &str) -> Option<&Cvar> {
        self.cvar_index.get(name).map(|&idx| &self.cvar_vars[idx])
    }

    /// Get the floating-point value of a cvar. Returns 0 if not found.
    pub fn variable_value(&self, name: &str) -> f32 {
        self.find_var(name).map_or(0.0, |v| v.value)
    }

    /// Get the string value of a cvar. Returns "" if not found.
    pub fn variable_string(&self, name: &str) -> &str {
        self.find_var(name).map_or("", |v| v.string.as_str())
    }

    /// Get or create a cvar. If it already exists, the value is not changed
    /// but flags are OR'd in.
    pub fn get(&mut self, name: &str, value: &str, flags: CvarFlags) -> usize {
        if let Some(&idx) = self.cvar_index.get(name) {
            self.cvar_vars[idx].flags |= flags;
            return idx;
        }

        let idx = self.cvar_vars.len();
        self.cvar_vars.push(Cvar {
            name: name.to_string(),
            string: value.to_string(),
            default: value.to_string(),
            flags,
            modified: true,
            value: value.parse::<f32>().ok().filter(|v| v.is_finite()).unwrap_or(0.0),
        });
        self.cvar_index.insert(name.to_string(), idx);
        idx
    }

    fn set2(&mut self, name: &str, value: &str, force: bool) -> Result<usize, CvarError> {
        let idx = self
            .cvar_index
            .get(name)
            .copied()
            .ok_or_else(|| CvarError::Unknown(name.to_string()))?;

        let parsed = value.parse::<f32>().map_err(|_| CvarError::InvalidValue {
            name: name.to_string(),
            value: value.to_string(),
        })?;
        if !parsed.is_finite() {
            return Err(CvarError::NonFinite {
                name: name.to_string(),
                value: value.to_string(),
            });
        }

        let var = &mut self.cvar_vars[idx];
        if !force && var.flags.contains(CvarFlags::NOSET) {
            return Err(CvarError::WriteProtected(name.to_string()));
        }
        if value == var.string {
            return Ok(idx); // not changed
        }

        debug!("{} changed from {} to {}", name, var.string, value);
        var.modified = true;
        var.string = value.to_string();
        var.value = parsed;
        Ok(idx)
    }

    /// Set a cvar value (respects NOSET).
    pub fn set(&mut self, name: &str, value: &str) -> Result<usize, CvarError> {
        self.set2(name, value, false)
    }

    /// Force-set a cvar value (ignores NOSET).
    pub fn force_set(&mut self, name: &str, value: &str) -> Result<usize, CvarError> {
        self.set2(name, value, true)
    }

    /// Set a cvar from a float value.
    pub fn set_value(&mut self, name: &str, value: f32) -> Result<usize, CvarError> {
        self.set(name, &format_value(value))
    }

    /// Restore every variable to its registered default.
    pub fn reset_defaults(&mut self) {
        for var in &mut self.cvar_vars {
            if var.string != var.default {
                var.string = var.default.clone();
                var.value = var.string.parse::<f32>().unwrap_or(0.0);
                var.modified = true;
            }
        }
    }

    /// Names of variables changed since the last call, in registration order.
    pub fn check_modified(&mut self) -> Vec<String> {
        let mut names = Vec::new();
        for var in &mut self.cvar_vars {
            if var.modified {
                var.modified = false;
                names.push(var.name.clone());
            }
        }
        names
    }

    /// Console handler for "set <variable> <value>".
    pub fn set_f(&mut self, argv: &[&str]) -> Result<(), CvarError> {
        match argv {
            [name, value] => self.set(name, value).map(|_| ()),
            _ => Err(CvarError::Config {
                line: 0,
                reason: "usage: set <variable> <value>".to_string(),
            }),
        }
    }

    /// Runs a config script of `set <name> <value>` lines. Blank lines and
    /// `//` comments are skipped. Stops at the first bad line and returns the
    /// number of variables set before it.
    pub fn exec_config(&mut self, text: &str) -> Result<usize, CvarError> {
        let mut count = 0;
        for (i, raw) in text.lines().enumerate() {
            let line = raw.split("//").next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }

            let tokens: Vec<&str> = line
                .split_whitespace()
                .map(|t| t.trim_matches('"'))
                .collect();
            let result = match tokens.split_first() {
                Some((&"set", rest)) => self.set_f(rest),
                Some((cmd, _)) => Err(CvarError::Config {
                    line: 0,
                    reason: format!("unknown command \"{}\"", cmd),
                }),
                None => Ok(()),
            };

            if let Err(e) = result {
                let reason = match e {
                    CvarError::Config { reason, .. } => reason,
                    other => other.to_string(),
                };
                warn!("config line {}: {}", i + 1, reason);
                return Err(CvarError::Config { line: i + 1, reason });
            }
            count += 1;
        }
        Ok(count)
    }

    /// Write archived variables in a form `exec_config` reads back.
    pub fn write_variables(&self, writer: &mut dyn std::io::Write) -> std::io::Result<()> {
        for var in &self.cvar_vars {
            if var.flags.contains(CvarFlags::ARCHIVE) {
                writeln!(writer, "set {} \"{}\"", var.name, var.string)?;
            }
        }
        Ok(())
    }

    /// Typed snapshot of the movement variables. Missing variables keep
    /// their defaults.
    pub fn pmove_params(&self) -> PmoveParams {
        let d = PmoveParams::default();
        let value = |name: &str, default: f32| self.find_var(name).map_or(default, |v| v.value);
        PmoveParams {
            stopspeed: value(PM_STOPSPEED, d.stopspeed),
            maxspeed: value(PM_MAXSPEED, d.maxspeed),
            duckspeed: value(PM_DUCKSPEED, d.duckspeed),
            accelerate: value(PM_ACCELERATE, d.accelerate),
            airaccelerate: value(PM_AIRACCELERATE, d.airaccelerate),
            wateraccelerate: value(PM_WATERACCELERATE, d.wateraccelerate),
            friction: value(PM_FRICTION, d.friction),
            waterfriction: value(PM_WATERFRICTION, d.waterfriction),
            waterspeed: value(PM_WATERSPEED, d.waterspeed),
            jump_height: value(PM_JUMPHEIGHT, d.jump_height),
            n64_physics: value(PM_N64PHYSICS, 0.0) != 0.0,
        }
    }
}

fn format_value(value: f32) -> String {
    if value == (value as i32) as f32 {
        format!("{}", value as i32)
    } else {
        format!("{}", value)
    }
}

// ============================================================
// Tests
// ============================================================
