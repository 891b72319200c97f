//! Built-in WGSL programs
//!
//! Scene programs take `{ proj_view, model }` as a 128-byte vertex push
//! constant block and consume [`Vertex`](crate::backend::types::Vertex)
//! attributes at locations 0 (position), 1 (normal) and 2 (uv).

use crate::resources::ShaderLibrary;

/// Geometry into the coords/normals G-buffer
pub const G_BUFFER_PROGRAM: &str = "g_buffer_pass";
/// Full-screen lighting and shadow test
pub const LIGHTING_PROGRAM: &str = "shadowmap_pass";
/// Depth from the light, vertex stage only
pub const SHADOW_PROGRAM: &str = "simple_shadow";
/// Debug overlay of the shadow map
pub const QUAD_PROGRAM: &str = "quad";

/// Library holding every program the passes look up
pub fn builtin_shaders() -> ShaderLibrary {
    let mut library = ShaderLibrary::new();
    library.insert(G_BUFFER_PROGRAM, SCENE_VERTEX_SHADER, Some(G_BUFFER_FRAGMENT_SHADER));
    library.insert(LIGHTING_PROGRAM, FULLSCREEN_VERTEX_SHADER, Some(LIGHTING_FRAGMENT_SHADER));
    library.insert(SHADOW_PROGRAM, SHADOW_VERTEX_SHADER, None);
    library.insert(QUAD_PROGRAM, QUAD_VERTEX_SHADER, Some(QUAD_FRAGMENT_SHADER));
    library
}

pub const SHADOW_VERTEX_SHADER: &str = r#"
struct PushConstants {
    proj_view: mat4x4<f32>,
    model: mat4x4<f32>,
}

var<push_constant> pc: PushConstants;

struct VertexInput {
    @location(0) position: vec3<f32>,
    @location(1) normal: vec3<f32>,
    @location(2) uv: vec2<f32>,
}

@vertex
fn vs_main(input: VertexInput) -> @builtin(position) vec4<f32> {
    return pc.proj_view * pc.model * vec4<f32>(input.position, 1.0);
}
"#;

pub const SCENE_VERTEX_SHADER: &str = r#"
struct PushConstants {
    proj_view: mat4x4<f32>,
    model: mat4x4<f32>,
}

var<push_constant> pc: PushConstants;

struct VertexInput {
    @location(0) position: vec3<f32>,
    @location(1) normal: vec3<f32>,
    @location(2) uv: vec2<f32>,
}

struct VertexOutput {
    @builtin(position) clip_position: vec4<f32>,
    @location(0) world_position: vec3<f32>,
    @location(1) world_normal: vec3<f32>,
}

@vertex
fn vs_main(input: VertexInput) -> VertexOutput {
    var output: VertexOutput;
    let world = pc.model * vec4<f32>(input.position, 1.0);
    output.world_position = world.xyz;
    output.world_normal = (pc.model * vec4<f32>(input.normal, 0.0)).xyz;
    output.clip_position = pc.proj_view * world;
    return output;
}
"#;

pub const G_BUFFER_FRAGMENT_SHADER: &str = r#"
struct VertexOutput {
    @builtin(position) clip_position: vec4<f32>,
    @location(0) world_position: vec3<f32>,
    @location(1) world_normal: vec3<f32>,
}

struct GBufferOutput {
    @location(0) coords: vec4<f32>,
    @location(1) normal: vec4<f32>,
}

@fragment
fn fs_main(input: VertexOutput) -> GBufferOutput {
    var output: GBufferOutput;
    // w = 1 marks covered pixels; the clear value leaves 0
    output.coords = vec4<f32>(input.world_position, 1.0);
    output.normal = vec4<f32>(normalize(input.world_normal), 0.0);
    return output;
}
"#;

pub const FULLSCREEN_VERTEX_SHADER: &str = r#"
@vertex
fn vs_main(@builtin(vertex_index) index: u32) -> @builtin(position) vec4<f32> {
    var corners = array<vec2<f32>, 6>(
        vec2<f32>(-1.0, -1.0),
        vec2<f32>(1.0, -1.0),
        vec2<f32>(1.0, 1.0),
        vec2<f32>(-1.0, -1.0),
        vec2<f32>(1.0, 1.0),
        vec2<f32>(-1.0, 1.0),
    );
    return vec4<f32>(corners[index], 0.0, 1.0);
}
"#;

pub const LIGHTING_FRAGMENT_SHADER: &str = r#"
struct UniformParams {
    light_matrix: mat4x4<f32>,
    light_pos: vec3<f32>,
    time: f32,
    base_color: vec3<f32>,
    animate_light_color: u32,
}

@group(0) @binding(0) var<uniform> params: UniformParams;
@group(0) @binding(1) var shadow_map: texture_depth_2d;
@group(0) @binding(2) var g_normals: texture_2d<f32>;
@group(0) @binding(3) var g_coords: texture_2d<f32>;
@group(0) @binding(4) var shadow_sampler: sampler;

const AMBIENT: f32 = 0.1;
const SHADOW_BIAS: f32 = 0.002;

fn shadow_factor(world: vec3<f32>) -> f32 {
    let light_clip = params.light_matrix * vec4<f32>(world, 1.0);
    let ndc = light_clip.xyz / light_clip.w;
    let uv = ndc.xy * vec2<f32>(0.5, -0.5) + vec2<f32>(0.5, 0.5);
    if (any(uv < vec2<f32>(0.0)) || any(uv > vec2<f32>(1.0)) || ndc.z > 1.0) {
        return 1.0;
    }
    let closest = textureSampleLevel(shadow_map, shadow_sampler, uv, 0);
    return select(1.0, 0.0, ndc.z - SHADOW_BIAS > closest);
}

fn light_color() -> vec3<f32> {
    if (params.animate_light_color == 0u) {
        return params.base_color;
    }
    let phase = vec3<f32>(0.0, 2.094, 4.189) + vec3<f32>(params.time);
    return params.base_color * (vec3<f32>(0.75) + 0.25 * sin(phase));
}

@fragment
fn fs_main(@builtin(position) frag_coord: vec4<f32>) -> @location(0) vec4<f32> {
    let texel = vec2<i32>(frag_coord.xy);
    let coords = textureLoad(g_coords, texel, 0);
    if (coords.w == 0.0) {
        return vec4<f32>(0.0, 0.0, 0.0, 1.0);
    }

    let world = coords.xyz;
    let normal = normalize(textureLoad(g_normals, texel, 0).xyz);
    let to_light = normalize(params.light_pos - world);
    let diffuse = max(dot(normal, to_light), 0.0);

    let lit = light_color() * (AMBIENT + diffuse * shadow_factor(world));
    return vec4<f32>(lit, 1.0);
}
"#;

pub const QUAD_VERTEX_SHADER: &str = r#"
struct QuadParams {
    scale_and_offset: vec4<f32>,
}

var<push_constant> quad: QuadParams;

struct VertexOutput {
    @builtin(position) clip_position: vec4<f32>,
    @location(0) uv: vec2<f32>,
}

@vertex
fn vs_main(@builtin(vertex_index) index: u32) -> VertexOutput {
    var corners = array<vec2<f32>, 6>(
        vec2<f32>(0.0, 0.0),
        vec2<f32>(1.0, 0.0),
        vec2<f32>(1.0, 1.0),
        vec2<f32>(0.0, 0.0),
        vec2<f32>(1.0, 1.0),
        vec2<f32>(0.0, 1.0),
    );
    let corner = corners[index];
    var output: VertexOutput;
    let position = (corner * 2.0 - vec2<f32>(1.0)) * quad.scale_and_offset.xy + quad.scale_and_offset.zw;
    output.clip_position = vec4<f32>(position, 0.0, 1.0);
    output.uv = vec2<f32>(corner.x, 1.0 - corner.y);
    return output;
}
"#;

pub const QUAD_FRAGMENT_SHADER: &str = r#"
struct VertexOutput {
    @builtin(position) clip_position: vec4<f32>,
    @location(0) uv: vec2<f32>,
}

@group(0) @binding(0) var quad_texture: texture_depth_2d;
@group(0) @binding(1) var quad_sampler: sampler;

@fragment
fn fs_main(input: VertexOutput) -> @location(0) vec4<f32> {
    let depth = textureSampleLevel(quad_texture, quad_sampler, input.uv, 0);
    return vec4<f32>(vec3<f32>(depth), 1.0);
}
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_programs() {
        let library = builtin_shaders();
        assert_eq!(library.len(), 4);
        assert!(library.get(SHADOW_PROGRAM).unwrap().fragment.is_none());
        for name in [G_BUFFER_PROGRAM, LIGHTING_PROGRAM, QUAD_PROGRAM] {
            assert!(library.get(name).unwrap().fragment.is_some());
        }
    }

    #[test]
    fn test_programs_parse() {
        let library = builtin_shaders();
        for name in [G_BUFFER_PROGRAM, LIGHTING_PROGRAM, SHADOW_PROGRAM, QUAD_PROGRAM] {
            let program = library.get(name).unwrap();
            let sources = std::iter::once(&program.vertex).chain(program.fragment.as_ref());
            for source in sources {
                if let Err(e) = naga::front::wgsl::parse_str(source) {
                    panic!("{} failed to parse: {}", name, e.emit_to_string(source));
                }
            }
        }
    }
}
