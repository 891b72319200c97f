//! Shadow-casting light

use glam::{Mat4, Quat, Vec3};

use super::Projection;
use crate::LightConfig;

/// Directional shadow caster with an orthographic light frustum.
///
/// When animated the light orbits its look-at point around the Y axis,
/// keeping its height and distance.
#[derive(Debug, Clone)]
pub struct Light {
    pub position: Vec3,
    pub look_at: Vec3,
    /// Half-extent of the orthographic frustum
    pub radius: f32,
    pub near: f32,
    pub far: f32,
    pub animate: bool,
    /// Radians per second
    pub rotation_speed: f32,
    pub color: Vec3,
    base_position: Vec3,
    angle: f32,
}

impl Default for Light {
    fn default() -> Self {
        Self::from_config(&LightConfig::default())
    }
}

impl Light {
    pub fn from_config(config: &LightConfig) -> Self {
        Self {
            position: config.position,
            look_at: config.look_at,
            radius: config.radius,
            near: config.near,
            far: config.far,
            animate: config.animate,
            rotation_speed: config.rotation_speed,
            color: config.color,
            base_position: config.position,
            angle: 0.0,
        }
    }

    /// Advance the orbit by `dt` seconds
    pub fn update(&mut self, dt: f32) {
        if !self.animate {
            return;
        }
        self.angle = (self.angle + dt * self.rotation_speed) % std::f32::consts::TAU;
        let offset = self.base_position - self.look_at;
        self.position = self.look_at + Quat::from_rotation_y(self.angle) * offset;
    }

    /// Current orbit angle in radians
    pub fn angle(&self) -> f32 {
        self.angle
    }

    pub fn direction(&self) -> Vec3 {
        (self.look_at - self.position).normalize_or_zero()
    }

    /// World to light clip space
    pub fn light_matrix(&self) -> Mat4 {
        let projection = Projection::orthographic(self.radius, self.near, self.far);
        projection.matrix() * Mat4::look_at_rh(self.position, self.look_at, self.up())
    }

    fn up(&self) -> Vec3 {
        // look_at_rh degenerates when looking straight along Y
        if self.direction().cross(Vec3::Y).length_squared() < 1e-6 {
            Vec3::Z
        } else {
            Vec3::Y
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn light(animate: bool) -> Light {
        Light::from_config(&LightConfig {
            position: Vec3::new(0.0, 10.0, 10.0),
            look_at: Vec3::ZERO,
            animate,
            rotation_speed: std::f32::consts::FRAC_PI_2,
            ..LightConfig::default()
        })
    }

    #[test]
    fn test_static_light_does_not_move() {
        let mut light = light(false);
        light.update(1.0);
        assert_eq!(light.position, Vec3::new(0.0, 10.0, 10.0));
    }

    #[test]
    fn test_animation_orbits_around_target() {
        let mut light = light(true);
        light.update(1.0);
        assert!((light.angle() - std::f32::consts::FRAC_PI_2).abs() < 1e-6);
        assert!((light.position.y - 10.0).abs() < 1e-4);
        assert!((light.position.x - 10.0).abs() < 1e-4);
        assert!(light.position.z.abs() < 1e-4);
    }

    #[test]
    fn test_look_at_maps_inside_light_frustum() {
        let light = light(false);
        let clip = light.light_matrix() * Vec3::ZERO.extend(1.0);
        assert!(clip.x.abs() < 1e-5 && clip.y.abs() < 1e-5);
        assert!(clip.z > 0.0 && clip.z < 1.0);
    }

    #[test]
    fn test_vertical_light_has_valid_matrix() {
        let light = Light::from_config(&LightConfig {
            position: Vec3::new(0.0, 20.0, 0.0),
            look_at: Vec3::ZERO,
            ..LightConfig::default()
        });
        assert!(!light.light_matrix().is_nan());
    }
}
