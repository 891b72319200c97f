//! Whole-frame tests on the headless backend.
//!
//! The headless backend tracks the layout of every texture and fails the
//! frame when an attachment or a sampled texture is in the wrong layout, or
//! when the swapchain is not ready to present. A frame that ends with `Ok`
//! therefore had every transition the graph planned.

mod common;

use glam::Vec3;
use rstest::rstest;

use common::{
    default_config, demo_renderer, draw_calls, headless, pass_commands, pass_labels,
    TRIANGLE_GLTF, HEIGHT, WIDTH,
};
use shadowmap_renderer::{
    backend::{headless::RecordedCommand, LoadOp},
    QuadRect, RendererConfig, ShadowmapRenderer,
};

const SHADOW: &str = "Shadow Pass";
const G_BUFFER: &str = "G-Buffer Pass";
const LIGHTING: &str = "Lighting Pass";
const QUAD: &str = "Quad Pass";

#[rstest]
#[case::with_quad(true, &[SHADOW, G_BUFFER, LIGHTING, QUAD])]
#[case::without_quad(false, &[SHADOW, G_BUFFER, LIGHTING])]
fn test_frame_pass_sequence(#[case] quad: bool, #[case] expected: &[&str]) {
    let mut renderer = demo_renderer(default_config().with_debug_quad(quad));
    renderer.update_uniforms(0.016).unwrap();
    renderer.render_frame().unwrap();

    assert_eq!(pass_labels(&renderer), expected);
    assert_eq!(headless(&renderer).frame_count(), 1);
}

#[test]
fn test_scene_passes_draw_every_instance() {
    let mut renderer = demo_renderer(default_config());
    renderer.render_frame().unwrap();

    let instances = renderer.scene().instances_num();
    assert_eq!(instances, 7);
    assert_eq!(draw_calls(pass_commands(&renderer, SHADOW)), instances);
    assert_eq!(draw_calls(pass_commands(&renderer, G_BUFFER)), instances);
    assert_eq!(draw_calls(pass_commands(&renderer, LIGHTING)), 1);
    assert_eq!(draw_calls(pass_commands(&renderer, QUAD)), 1);
}

#[test]
fn test_lighting_reads_depth_without_writing() {
    let mut renderer = demo_renderer(default_config());
    renderer.render_frame().unwrap();

    let begin = headless(&renderer)
        .last_frame_commands()
        .iter()
        .find_map(|command| match command {
            RecordedCommand::BeginRenderPass {
                label: Some(label),
                depth,
                ..
            } if label == LIGHTING => Some(depth.clone()),
            _ => None,
        })
        .expect("lighting pass recorded");
    let (_, load_op, read_only) = begin.expect("lighting pass binds the depth buffer");
    assert_eq!(load_op, LoadOp::Load);
    assert!(read_only);
}

#[test]
fn test_toggle_quad_between_frames() {
    let mut renderer = demo_renderer(default_config());
    renderer.render_frame().unwrap();
    assert!(pass_labels(&renderer).iter().any(|l| l == QUAD));

    renderer.set_draw_debug_quad(false);
    renderer.render_frame().unwrap();
    assert!(!pass_labels(&renderer).iter().any(|l| l == QUAD));

    renderer.set_draw_debug_quad(true);
    renderer.render_frame().unwrap();
    assert!(pass_labels(&renderer).iter().any(|l| l == QUAD));
    assert_eq!(headless(&renderer).frame_count(), 3);
}

#[test]
fn test_offscreen_quad_is_skipped() {
    let rect = QuadRect {
        x: WIDTH,
        y: 0,
        width: 128,
        height: 128,
    };
    let mut renderer = demo_renderer(default_config().with_debug_quad_rect(rect));
    renderer.render_frame().unwrap();
    assert_eq!(pass_labels(&renderer).len(), 3);
}

#[rstest]
#[case::inside(QuadRect { x: 16, y: 16, width: 128, height: 96 }, (16, 16, 128, 96))]
#[case::default_rect_clamped(QuadRect::default(), (0, 0, WIDTH, HEIGHT))]
#[case::partially_offscreen(QuadRect { x: 256, y: 200, width: 128, height: 128 }, (256, 200, 64, 40))]
fn test_quad_overlay_placement(#[case] rect: QuadRect, #[case] expected: (u32, u32, u32, u32)) {
    let mut renderer = demo_renderer(default_config().with_debug_quad_rect(rect));
    renderer.render_frame().unwrap();

    let commands = pass_commands(&renderer, QUAD);
    let (x, y, width, height) = expected;

    let viewport = commands
        .iter()
        .find_map(|command| match command {
            RecordedCommand::SetViewport {
                x,
                y,
                width,
                height,
            } => Some((*x, *y, *width, *height)),
            _ => None,
        })
        .expect("quad pass sets a viewport");
    assert_eq!(
        viewport,
        (x as f32, y as f32, width as f32, height as f32)
    );

    let scissor = commands
        .iter()
        .find_map(|command| match command {
            RecordedCommand::SetScissorRect {
                x,
                y,
                width,
                height,
            } => Some((*x, *y, *width, *height)),
            _ => None,
        })
        .expect("quad pass sets a scissor rect");
    assert_eq!(scissor, expected);

    let scale_and_offset = commands
        .iter()
        .find_map(|command| match command {
            RecordedCommand::SetPushConstants { data, .. } => Some(data.clone()),
            _ => None,
        })
        .expect("quad pass pushes its transform");
    let expected_push: &[u8] = bytemuck::cast_slice(&[0.5f32, 0.5, -0.5, 0.5]);
    assert_eq!(scale_and_offset, expected_push);
    assert_eq!(draw_calls(commands), 1);
}

#[rstest]
#[case::grow(640, 480)]
#[case::shrink(100, 50)]
#[case::portrait(200, 400)]
fn test_resize_reallocates_screen_targets(#[case] width: u32, #[case] height: u32) {
    let mut renderer = demo_renderer(default_config());
    renderer.render_frame().unwrap();

    renderer.resize(width, height).unwrap();
    assert_eq!(renderer.dimensions(), (width, height));
    renderer.render_frame().unwrap();

    let resources = *renderer.resources();
    let backend = headless(&renderer);
    for resource in [
        resources.g_buffer_coords,
        resources.g_buffer_normals,
        resources.g_buffer_depth,
    ] {
        let view = renderer.texture_view(resource).unwrap();
        let desc = backend.view_desc(view).unwrap();
        assert_eq!((desc.width, desc.height), (width, height));
    }

    let shadow_view = renderer.texture_view(resources.shadow_map).unwrap();
    let shadow = backend.view_desc(shadow_view).unwrap();
    assert_eq!((shadow.width, shadow.height), (2048, 2048));
}

#[test]
fn test_zero_size_resize_is_ignored() {
    let mut renderer = demo_renderer(default_config());
    renderer.resize(0, 0).unwrap();
    assert_eq!(renderer.dimensions(), (WIDTH, HEIGHT));
    renderer.render_frame().unwrap();
}

#[test]
fn test_deallocate_releases_everything() {
    let mut renderer = demo_renderer(default_config());
    renderer.render_frame().unwrap();
    renderer.deallocate_resources();

    let backend = headless(&renderer);
    assert_eq!(backend.live_buffers(), 0);
    assert_eq!(backend.live_pipelines(), 0);
    assert_eq!(backend.live_bind_groups(), 0);
    assert_eq!(backend.live_samplers(), 0);
    // Only the swapchain image is left
    assert_eq!(backend.live_textures(), 1);
}

#[test]
fn test_light_animation_moves_shadow_frustum() {
    let mut renderer = demo_renderer(default_config().with_light_animation(true));
    renderer.update_uniforms(0.0).unwrap();
    let before = renderer.uniforms().light_matrix;
    renderer.update_uniforms(1.0).unwrap();
    assert_ne!(renderer.uniforms().light_matrix, before);
    renderer.render_frame().unwrap();
}

#[test]
fn test_static_light_keeps_shadow_frustum() {
    let mut renderer = demo_renderer(default_config());
    renderer.update_uniforms(0.0).unwrap();
    let before = renderer.uniforms().light_matrix;
    renderer.update_uniforms(1.0).unwrap();
    assert_eq!(renderer.uniforms().light_matrix, before);
}

#[test]
fn test_gltf_scene_renders_with_its_camera() {
    common::init_logging();
    let mut renderer = ShadowmapRenderer::with_headless(default_config()).unwrap();
    renderer.allocate_resources().unwrap();
    renderer
        .load_scene_slice(TRIANGLE_GLTF.as_bytes(), false)
        .unwrap();

    assert_eq!(renderer.camera().position, Vec3::new(0.0, 0.0, 5.0));
    renderer.render_frame().unwrap();
    assert_eq!(draw_calls(pass_commands(&renderer, SHADOW)), 2);
}

#[test]
fn test_scene_can_be_replaced() {
    let mut renderer = demo_renderer(default_config());
    renderer.render_frame().unwrap();

    renderer
        .load_scene_slice(TRIANGLE_GLTF.as_bytes(), false)
        .unwrap();
    renderer.render_frame().unwrap();
    assert_eq!(draw_calls(pass_commands(&renderer, G_BUFFER)), 2);
}

#[test]
fn test_custom_shadow_map_size() {
    let config = RendererConfig::default()
        .with_size(WIDTH, HEIGHT)
        .with_shadow_map_size(512);
    let mut renderer = demo_renderer(config);
    renderer.render_frame().unwrap();

    let view = renderer
        .texture_view(renderer.resources().shadow_map)
        .unwrap();
    let desc = headless(&renderer).view_desc(view).unwrap();
    assert_eq!((desc.width, desc.height), (512, 512));
}

#[test]
fn test_failed_scene_load_keeps_current_scene() {
    let mut renderer = demo_renderer(default_config());
    renderer.render_frame().unwrap();

    let empty = r#"{ "asset": { "version": "2.0" }, "scene": 0, "scenes": [ { "nodes": [] } ] }"#;
    assert!(renderer.load_scene_slice(empty.as_bytes(), false).is_err());

    assert_eq!(renderer.scene().instances_num(), 7);
    renderer.render_frame().unwrap();
    assert_eq!(draw_calls(pass_commands(&renderer, G_BUFFER)), 7);
}
