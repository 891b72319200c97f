//! Interactive shadow mapping demo
//!
//! Run with:
//!   cargo run --example shadowmap_demo
//!   cargo run --example shadowmap_demo -- --backend vulkan --scene scene.glb
//!
//! Controls:
//!   WASD     - Move camera
//!   E/C      - Move up/down
//!   Shift    - Sprint
//!   Mouse    - Look around (hold right mouse button)
//!   Scroll   - Adjust speed
//!   L        - Toggle light animation
//!   Q        - Toggle shadow map overlay
//!   Escape   - Exit

use clap::{Parser, ValueEnum};
use shadowmap_renderer::{
    scene::{CameraController, CameraInput, FreeFlyController, SceneManager},
    BackendType, RendererConfig, ShadowmapRenderer, Window,
};
use std::path::PathBuf;
use std::time::Instant;
use winit::{
    event::{DeviceEvent, ElementState, Event, MouseButton, MouseScrollDelta, WindowEvent},
    event_loop::{ControlFlow, EventLoop, EventLoopWindowTarget},
    keyboard::{KeyCode, PhysicalKey},
    window::CursorGrabMode,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BackendArg {
    Wgpu,
    Vulkan,
}

impl From<BackendArg> for BackendType {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Wgpu => BackendType::Wgpu,
            BackendArg::Vulkan => BackendType::Vulkan,
        }
    }
}

/// Deferred shading with a single shadow-casting light
#[derive(Debug, Parser)]
struct Args {
    /// Graphics backend
    #[arg(long, value_enum, default_value = "wgpu")]
    backend: BackendArg,

    /// glTF or GLB scene; a built-in scene is used when omitted
    #[arg(long)]
    scene: Option<PathBuf>,

    #[arg(long, default_value_t = 1280)]
    width: u32,

    #[arg(long, default_value_t = 720)]
    height: u32,

    /// Side of the shadow map in texels
    #[arg(long, default_value_t = 2048)]
    shadow_map_size: u32,

    /// Transpose instance matrices read from the scene
    #[arg(long)]
    transpose: bool,

    /// Start with the shadow map overlay hidden
    #[arg(long)]
    no_quad: bool,

    /// Orbit the light from the start
    #[arg(long)]
    animate_light: bool,

    /// Disable vertical sync
    #[arg(long)]
    no_vsync: bool,
}

struct AppState {
    camera_input: CameraInput,
    free_fly: FreeFlyController,
    last_frame: Instant,
    /// Seconds since the previous frame, applied to the light on redraw
    frame_dt: f32,
    cursor_grabbed: bool,
}

impl AppState {
    fn new() -> Self {
        Self {
            camera_input: CameraInput::new(),
            free_fly: FreeFlyController::new(),
            last_frame: Instant::now(),
            frame_dt: 0.0,
            cursor_grabbed: false,
        }
    }

    fn set_cursor_grab(&mut self, window: &winit::window::Window, grab: bool) {
        if grab == self.cursor_grabbed {
            return;
        }
        let mode = if grab {
            CursorGrabMode::Confined
        } else {
            CursorGrabMode::None
        };
        let _ = window.set_cursor_grab(mode);
        window.set_cursor_visible(!grab);
        self.cursor_grabbed = grab;
    }
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let config = RendererConfig::default()
        .with_backend(args.backend.into())
        .with_size(args.width, args.height)
        .with_vsync(!args.no_vsync)
        .with_shadow_map_size(args.shadow_map_size)
        .with_debug_quad(!args.no_quad)
        .with_light_animation(args.animate_light)
        .with_transposed_instances(args.transpose);

    println!("Starting Shadowmap Demo");
    println!("Backend: {:?}", config.backend);
    println!();
    println!("Controls:");
    println!("  WASD        - Move camera");
    println!("  E/C         - Move up/down");
    println!("  Shift       - Sprint");
    println!("  Right Mouse - Look around");
    println!("  Scroll      - Adjust speed");
    println!("  L           - Toggle light animation");
    println!("  Q           - Toggle shadow map overlay");
    println!("  Escape      - Exit");
    println!();

    let event_loop = EventLoop::new().expect("Failed to create event loop");
    let mut window = Window::from_config(&event_loop, &config).expect("Failed to create window");

    let mut renderer = match ShadowmapRenderer::from_window(window.window_arc(), config.clone()) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("Failed to create renderer: {}", e);
            return;
        }
    };

    if let Err(e) = renderer.allocate_resources() {
        eprintln!("Failed to allocate resources: {}", e);
        return;
    }

    let loaded = match &args.scene {
        Some(path) => renderer.load_scene(path, config.transpose_instance_matrices),
        None => renderer.set_scene(SceneManager::demo_scene()),
    };
    if let Err(e) = loaded {
        eprintln!("Failed to load scene: {}", e);
        return;
    }

    println!("Scene setup complete:");
    println!("  Meshes: {}", renderer.scene().meshes_num());
    println!("  Instances: {}", renderer.scene().instances_num());
    println!();

    let mut state = AppState::new();
    state.free_fly.sync_with_camera(renderer.camera());

    event_loop
        .run(move |event, elwt: &EventLoopWindowTarget<()>| {
            elwt.set_control_flow(ControlFlow::Poll);

            match event {
                Event::WindowEvent { event, .. } => {
                    window.handle_event(&event);
                    handle_window_event(&event, &mut state, &mut renderer, &window, elwt);
                }
                Event::DeviceEvent { event, .. } => handle_device_event(&event, &mut state),
                Event::LoopExiting => {
                    renderer.deallocate_resources();
                }
                Event::AboutToWait => {
                    if window.was_resized() {
                        let (width, height) = window.dimensions();
                        if let Err(e) = renderer.resize(width, height) {
                            log::error!("Resize failed: {}", e);
                            if e.is_fatal() {
                                elwt.exit();
                            }
                        }
                        window.clear_resize_flag();
                    }

                    let now = Instant::now();
                    let dt = (now - state.last_frame).as_secs_f32();
                    state.last_frame = now;
                    state.frame_dt += dt;

                    state
                        .free_fly
                        .update(renderer.camera_mut(), &state.camera_input, dt);
                    state.camera_input.reset_deltas();

                    if !window.is_minimized() {
                        window.request_redraw();
                    }
                }
                _ => {}
            }
        })
        .expect("Event loop error");
}

fn handle_window_event(
    event: &WindowEvent,
    state: &mut AppState,
    renderer: &mut ShadowmapRenderer,
    window: &Window,
    elwt: &EventLoopWindowTarget<()>,
) {
    match event {
        WindowEvent::CloseRequested => {
            println!("Close requested, shutting down...");
            elwt.exit();
        }
        WindowEvent::RedrawRequested => {
            if window.is_minimized() {
                return;
            }
            let dt = std::mem::take(&mut state.frame_dt);
            let result = renderer
                .update_uniforms(dt)
                .and_then(|_| renderer.render_frame());
            match result {
                Err(e) if e.is_fatal() => {
                    log::error!("Rendering stopped: {}", e);
                    elwt.exit();
                }
                Err(e) => log::warn!("Frame skipped: {}", e),
                Ok(()) => {}
            }
        }
        WindowEvent::KeyboardInput { event, .. } => {
            let pressed = event.state == ElementState::Pressed;
            let PhysicalKey::Code(key) = event.physical_key else {
                return;
            };
            match key {
                KeyCode::Escape => elwt.exit(),
                KeyCode::KeyL if pressed && !event.repeat => {
                    let light = renderer.light_mut();
                    light.animate = !light.animate;
                    println!("Light animation: {}", if light.animate { "on" } else { "off" });
                }
                KeyCode::KeyQ if pressed && !event.repeat => {
                    let enabled = !renderer.draw_debug_quad();
                    renderer.set_draw_debug_quad(enabled);
                    println!("Shadow map overlay: {}", if enabled { "on" } else { "off" });
                }
                _ => {
                    state.camera_input.handle_key(key, pressed);
                }
            }
        }
        WindowEvent::MouseInput {
            state: btn_state,
            button: MouseButton::Right,
            ..
        } => {
            let pressed = *btn_state == ElementState::Pressed;
            state.camera_input.mouse_look_active = pressed;
            state.set_cursor_grab(window.window(), pressed);
        }
        WindowEvent::MouseWheel { delta, .. } => {
            let scroll = match delta {
                MouseScrollDelta::LineDelta(_, y) => *y,
                MouseScrollDelta::PixelDelta(pos) => pos.y as f32 / 100.0,
            };
            state.camera_input.scroll_delta += scroll;
        }
        WindowEvent::Focused(false) => {
            // Release all keys when window loses focus
            state.camera_input = CameraInput::new();
            state.set_cursor_grab(window.window(), false);
        }
        _ => {}
    }
}

fn handle_device_event(event: &DeviceEvent, state: &mut AppState) {
    if let DeviceEvent::MouseMotion { delta } = event {
        if state.camera_input.mouse_look_active {
            state.camera_input.mouse_delta.x += delta.0 as f32;
            state.camera_input.mouse_delta.y += delta.1 as f32;
        }
    }
}
