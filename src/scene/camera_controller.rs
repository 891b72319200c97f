//! Free-fly camera control for the interactive demo

use glam::{Vec2, Vec3};
use winit::keyboard::KeyCode;

use super::Camera;

/// Input state for camera controllers
#[derive(Debug, Clone, Default)]
pub struct CameraInput {
    pub forward: bool,
    pub backward: bool,
    pub left: bool,
    pub right: bool,
    pub up: bool,
    pub down: bool,
    pub sprint: bool,

    /// Mouse delta since last frame (in pixels)
    pub mouse_delta: Vec2,
    /// Positive when scrolling up
    pub scroll_delta: f32,
    /// Right mouse button held
    pub mouse_look_active: bool,
}

impl CameraInput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a movement key; returns false for keys the camera ignores
    pub fn handle_key(&mut self, key: KeyCode, pressed: bool) -> bool {
        let state = match key {
            KeyCode::KeyW => &mut self.forward,
            KeyCode::KeyS => &mut self.backward,
            KeyCode::KeyA => &mut self.left,
            KeyCode::KeyD => &mut self.right,
            KeyCode::KeyE | KeyCode::Space => &mut self.up,
            KeyCode::KeyC | KeyCode::ControlLeft => &mut self.down,
            KeyCode::ShiftLeft | KeyCode::ShiftRight => &mut self.sprint,
            _ => return false,
        };
        *state = pressed;
        true
    }

    /// Reset per-frame deltas (call after update)
    pub fn reset_deltas(&mut self) {
        self.mouse_delta = Vec2::ZERO;
        self.scroll_delta = 0.0;
    }
}

pub trait CameraController {
    /// Move `camera` according to `input` over `dt` seconds
    fn update(&mut self, camera: &mut Camera, input: &CameraInput, dt: f32);

    fn name(&self) -> &'static str;
}

/// FPS-style controller: WASD to move, E/C to rise and sink, right mouse
/// button to look around, scroll to change speed, shift to sprint.
#[derive(Debug, Clone)]
pub struct FreeFlyController {
    /// Radians around Y
    pub yaw: f32,
    /// Radians, positive looks down
    pub pitch: f32,
    /// Units per second
    pub move_speed: f32,
    pub min_speed: f32,
    pub max_speed: f32,
    /// Radians per pixel
    pub mouse_sensitivity: f32,
    pub sprint_multiplier: f32,
    pub scroll_speed_factor: f32,
}

impl Default for FreeFlyController {
    fn default() -> Self {
        Self {
            yaw: 0.0,
            pitch: 0.0,
            move_speed: 5.0,
            min_speed: 0.5,
            max_speed: 50.0,
            mouse_sensitivity: 0.003,
            sprint_multiplier: 2.0,
            scroll_speed_factor: 1.2,
        }
    }
}

impl FreeFlyController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_speed(mut self, speed: f32) -> Self {
        self.move_speed = speed;
        self
    }

    /// Take yaw and pitch from the camera's current orientation
    pub fn sync_with_camera(&mut self, camera: &Camera) {
        let forward = camera.forward();
        self.yaw = forward.z.atan2(forward.x);
        self.pitch = (-forward.y).clamp(-1.0, 1.0).asin();
    }

    fn forward_direction(&self) -> Vec3 {
        Vec3::new(
            self.yaw.cos() * self.pitch.cos(),
            -self.pitch.sin(),
            self.yaw.sin() * self.pitch.cos(),
        )
        .normalize()
    }

    /// Perpendicular to forward, on the XZ plane
    fn right_direction(&self) -> Vec3 {
        Vec3::new(-self.yaw.sin(), 0.0, self.yaw.cos()).normalize()
    }
}

impl CameraController for FreeFlyController {
    fn update(&mut self, camera: &mut Camera, input: &CameraInput, dt: f32) {
        if input.scroll_delta > 0.0 {
            self.move_speed *= self.scroll_speed_factor;
        } else if input.scroll_delta < 0.0 {
            self.move_speed /= self.scroll_speed_factor;
        }
        self.move_speed = self.move_speed.clamp(self.min_speed, self.max_speed);

        if input.mouse_look_active && input.mouse_delta != Vec2::ZERO {
            self.yaw = (self.yaw + input.mouse_delta.x * self.mouse_sensitivity)
                % std::f32::consts::TAU;
            let max_pitch = std::f32::consts::FRAC_PI_2 - 0.01;
            self.pitch = (self.pitch + input.mouse_delta.y * self.mouse_sensitivity)
                .clamp(-max_pitch, max_pitch);
        }

        let forward = self.forward_direction();
        let right = self.right_direction();

        let axes = [
            (input.forward, forward),
            (input.backward, -forward),
            (input.right, right),
            (input.left, -right),
            (input.up, Vec3::Y),
            (input.down, -Vec3::Y),
        ];
        let velocity = axes
            .iter()
            .filter(|(active, _)| *active)
            .map(|(_, direction)| *direction)
            .sum::<Vec3>()
            .normalize_or_zero();

        let speed = if input.sprint {
            self.move_speed * self.sprint_multiplier
        } else {
            self.move_speed
        };

        camera.position += velocity * speed * dt;
        camera.target = camera.position + forward;
    }

    fn name(&self) -> &'static str {
        "FreeFly"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_keeps_view_direction() {
        let camera = Camera::new(Vec3::new(0.0, 3.0, 5.0), Vec3::ZERO);
        let mut controller = FreeFlyController::new();
        controller.sync_with_camera(&camera);
        assert!((controller.forward_direction() - camera.forward()).length() < 1e-5);
    }

    #[test]
    fn test_forward_moves_along_view() {
        let mut camera = Camera::new(Vec3::ZERO, Vec3::new(0.0, 0.0, -1.0));
        let mut controller = FreeFlyController::new().with_speed(2.0);
        controller.sync_with_camera(&camera);

        let mut input = CameraInput::new();
        assert!(input.handle_key(KeyCode::KeyW, true));
        controller.update(&mut camera, &input, 0.5);

        assert!((camera.position - Vec3::new(0.0, 0.0, -1.0)).length() < 1e-5);
        assert!((camera.forward() - Vec3::NEG_Z).length() < 1e-5);
    }

    #[test]
    fn test_scroll_speed_is_clamped() {
        let mut camera = Camera::default();
        let mut controller = FreeFlyController::new();
        let input = CameraInput {
            scroll_delta: 1.0,
            ..CameraInput::default()
        };
        for _ in 0..100 {
            controller.update(&mut camera, &input, 0.0);
        }
        assert_eq!(controller.move_speed, controller.max_speed);
    }

    #[test]
    fn test_unmapped_key_is_ignored() {
        let mut input = CameraInput::new();
        assert!(!input.handle_key(KeyCode::KeyL, true));
    }
}
