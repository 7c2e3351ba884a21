//! Runtime configuration for the flocking rules and the simulated domain.
//!
//! Defaults reproduce the reference constants:
//!
//! | rule        | distance | scale |
//! |-------------|----------|-------|
//! | cohesion    | 5.0      | 0.01  |
//! | separation  | 3.0      | 0.1   |
//! | alignment   | 5.0      | 0.1   |
//!
//! with `max_speed = 1.0` and `scene_scale = 100.0`.
//!
//! ```ignore
//! let config = FlockConfig::default()
//!     .with_scene_scale(50.0)
//!     .with_separation(RuleParams::new(2.0, 0.2))
//!     .with_seed(7);
//! ```

use serde::{Deserialize, Serialize};

use crate::error::FlockError;

/// Interaction radius and weight of one flocking rule.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RuleParams {
    /// Neighbours strictly closer than this contribute to the rule.
    pub distance: f32,
    /// Multiplier applied to the rule's velocity change.
    pub scale: f32,
}

impl RuleParams {
    pub const fn new(distance: f32, scale: f32) -> Self {
        Self { distance, scale }
    }
}

/// Flock parameters. Everything the engine derives (grid layout, buffer
/// sizes) is computed from these at creation time.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlockConfig {
    /// Rule 1: steer toward the neighbours' centre of mass.
    pub cohesion: RuleParams,
    /// Rule 2: keep a small distance from neighbours.
    pub separation: RuleParams,
    /// Rule 3: match the neighbours' velocity.
    pub alignment: RuleParams,
    /// Speed every new velocity is clamped to.
    pub max_speed: f32,
    /// Half-size of the simulated cube; positions live in `[-scene_scale, scene_scale]³`.
    pub scene_scale: f32,
    /// Number of steps averaged by the step timer before it resets.
    pub timing_window: u32,
    /// Seed for initial placement. `None` draws one from system entropy.
    pub seed: Option<u64>,
}

impl Default for FlockConfig {
    fn default() -> Self {
        Self {
            cohesion: RuleParams::new(5.0, 0.01),
            separation: RuleParams::new(3.0, 0.1),
            alignment: RuleParams::new(5.0, 0.1),
            max_speed: 1.0,
            scene_scale: 100.0,
            timing_window: 500,
            seed: None,
        }
    }
}

impl FlockConfig {
    /// Parse a configuration from JSON. Missing fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self, FlockError> {
        let config: FlockConfig = serde_json::from_str(json)
            .map_err(|e| FlockError::invalid(format!("malformed config JSON: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to pretty JSON.
    pub fn to_json(&self) -> String {
        // A struct of plain floats and integers always serializes.
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    pub fn with_cohesion(mut self, rule: RuleParams) -> Self {
        self.cohesion = rule;
        self
    }

    pub fn with_separation(mut self, rule: RuleParams) -> Self {
        self.separation = rule;
        self
    }

    pub fn with_alignment(mut self, rule: RuleParams) -> Self {
        self.alignment = rule;
        self
    }

    pub fn with_max_speed(mut self, max_speed: f32) -> Self {
        self.max_speed = max_speed;
        self
    }

    /// Set the bounding cube half-size (cube from -scale to +scale).
    pub fn with_scene_scale(mut self, scene_scale: f32) -> Self {
        self.scene_scale = scene_scale;
        self
    }

    pub fn with_timing_window(mut self, steps: u32) -> Self {
        self.timing_window = steps;
        self
    }

    /// Make initial placement reproducible.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Largest of the three interaction radii.
    pub fn max_rule_distance(&self) -> f32 {
        self.cohesion
            .distance
            .max(self.separation.distance)
            .max(self.alignment.distance)
    }

    /// Reject parameters the engine cannot run with.
    pub fn validate(&self) -> Result<(), FlockError> {
        for (name, rule) in [
            ("cohesion", self.cohesion),
            ("separation", self.separation),
            ("alignment", self.alignment),
        ] {
            if !rule.distance.is_finite() || rule.distance < 0.0 {
                return Err(FlockError::invalid(format!(
                    "{name} distance must be finite and non-negative, got {}",
                    rule.distance
                )));
            }
            if !rule.scale.is_finite() {
                return Err(FlockError::invalid(format!(
                    "{name} scale must be finite, got {}",
                    rule.scale
                )));
            }
        }
        if self.max_rule_distance() <= 0.0 {
            return Err(FlockError::invalid(
                "grid cell width is zero: at least one rule distance must be positive",
            ));
        }
        if !self.max_speed.is_finite() || self.max_speed <= 0.0 {
            return Err(FlockError::invalid(format!(
                "max_speed must be finite and positive, got {}",
                self.max_speed
            )));
        }
        if !self.scene_scale.is_finite() || self.scene_scale <= 0.0 {
            return Err(FlockError::invalid(format!(
                "scene_scale must be finite and positive, got {}",
                self.scene_scale
            )));
        }
        if self.timing_window == 0 {
            return Err(FlockError::invalid("timing_window must be at least one step"));
        }
        Ok(())
    }
}

/// Check a timestep before it reaches any stage.
pub(crate) fn validate_dt(dt: f32) -> Result<(), FlockError> {
    if dt.is_finite() {
        Ok(())
    } else {
        Err(FlockError::invalid(format!("timestep must be finite, got {dt}")))
    }
}
