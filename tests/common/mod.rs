//! Shared setup for the headless renderer integration tests.

#![allow(dead_code)]

use shadowmap_renderer::{
    backend::headless::{HeadlessBackend, RecordedCommand},
    scene::SceneManager,
    RendererConfig, ShadowmapRenderer,
};

pub const WIDTH: u32 = 320;
pub const HEIGHT: u32 = 240;

/// One triangle instanced by two nodes and a perspective camera at z = 5.
pub const TRIANGLE_GLTF: &str = r#"{
    "asset": { "version": "2.0" },
    "scene": 0,
    "scenes": [ { "nodes": [0, 1, 2] } ],
    "nodes": [
        { "mesh": 0 },
        { "mesh": 0, "translation": [2.0, 0.0, 0.0] },
        { "camera": 0, "translation": [0.0, 0.0, 5.0] }
    ],
    "cameras": [
        { "type": "perspective", "perspective": { "yfov": 1.0, "znear": 0.1, "zfar": 40.0 } }
    ],
    "meshes": [ { "primitives": [ { "attributes": { "POSITION": 0 } } ] } ],
    "accessors": [
        { "bufferView": 0, "componentType": 5126, "count": 3, "type": "VEC3",
          "min": [0.0, 0.0, 0.0], "max": [1.0, 1.0, 0.0] }
    ],
    "bufferViews": [ { "buffer": 0, "byteLength": 36 } ],
    "buffers": [ {
        "byteLength": 36,
        "uri": "data:application/octet-stream;base64,AAAAAAAAAAAAAAAAAACAPwAAAAAAAAAAAAAAAAAAgD8AAAAA"
    } ]
}"#;

/// Headless renderer with resources allocated and the demo scene loaded.
pub fn demo_renderer(config: RendererConfig) -> ShadowmapRenderer {
    init_logging();
    let mut renderer = ShadowmapRenderer::with_headless(config).expect("headless renderer");
    renderer.allocate_resources().expect("allocate resources");
    renderer
        .set_scene(SceneManager::demo_scene())
        .expect("load demo scene");
    renderer
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn default_config() -> RendererConfig {
    RendererConfig::default().with_size(WIDTH, HEIGHT)
}

pub fn headless(renderer: &ShadowmapRenderer) -> &HeadlessBackend {
    renderer
        .backend()
        .as_headless()
        .expect("renderer should run on the headless backend")
}

/// Labels of the render passes recorded in the last frame, in order.
pub fn pass_labels(renderer: &ShadowmapRenderer) -> Vec<String> {
    headless(renderer)
        .last_frame_commands()
        .iter()
        .filter_map(|command| match command {
            RecordedCommand::BeginRenderPass { label, .. } => label.clone(),
            _ => None,
        })
        .collect()
}

/// Commands recorded between the start of the pass labelled `label` and its end.
pub fn pass_commands<'a>(renderer: &'a ShadowmapRenderer, label: &str) -> &'a [RecordedCommand] {
    let commands = headless(renderer).last_frame_commands();
    let Some(start) = commands.iter().position(|command| {
        matches!(command, RecordedCommand::BeginRenderPass { label: Some(l), .. } if l == label)
    }) else {
        return &[];
    };
    let end = commands[start..]
        .iter()
        .position(|command| matches!(command, RecordedCommand::EndRenderPass))
        .map_or(commands.len(), |offset| start + offset);
    &commands[start + 1..end]
}

pub fn draw_calls(commands: &[RecordedCommand]) -> usize {
    commands
        .iter()
        .filter(|command| {
            matches!(
                command,
                RecordedCommand::Draw { .. } | RecordedCommand::DrawIndexed { .. }
            )
        })
        .count()
}
