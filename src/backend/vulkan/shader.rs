//! WGSL to SPIR-V translation through naga.

use ash::vk;

use crate::backend::traits::{BackendError, BackendResult};

/// Translate the `entry_point` of a WGSL module into SPIR-V words.
pub fn wgsl_to_spirv(
    source: &str,
    stage: naga::ShaderStage,
    entry_point: &str,
) -> BackendResult<Vec<u32>> {
    let module = naga::front::wgsl::parse_str(source)
        .map_err(|e| BackendError::ShaderCreationFailed(format!("WGSL parse error: {e}")))?;

    let mut validator = naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::all(),
    );
    let info = validator
        .validate(&module)
        .map_err(|e| BackendError::ShaderCreationFailed(format!("Validation error: {e}")))?;

    if !module
        .entry_points
        .iter()
        .any(|ep| ep.name == entry_point && ep.stage == stage)
    {
        return Err(BackendError::ShaderCreationFailed(format!(
            "entry point '{}' not found for stage {:?}",
            entry_point, stage
        )));
    }

    let options = naga::back::spv::Options {
        lang_version: (1, 3),
        flags: naga::back::spv::WriterFlags::empty(),
        capabilities: None,
        bounds_check_policies: naga::proc::BoundsCheckPolicies::default(),
        binding_map: Default::default(),
        debug_info: None,
        zero_initialize_workgroup_memory: naga::back::spv::ZeroInitializeWorkgroupMemoryMode::None,
    };

    let pipeline_options = naga::back::spv::PipelineOptions {
        shader_stage: stage,
        entry_point: entry_point.to_string(),
    };

    naga::back::spv::write_vec(&module, &info, &options, Some(&pipeline_options))
        .map_err(|e| BackendError::ShaderCreationFailed(format!("SPIR-V generation error: {e}")))
}

/// Compile a WGSL entry point into a Vulkan shader module.
pub fn create_shader_module(
    device: &ash::Device,
    source: &str,
    stage: naga::ShaderStage,
    entry_point: &str,
) -> BackendResult<vk::ShaderModule> {
    let spv = wgsl_to_spirv(source, stage, entry_point)?;
    let create_info = vk::ShaderModuleCreateInfo::default().code(&spv);

    unsafe { device.create_shader_module(&create_info, None) }
        .map_err(|e| BackendError::ShaderCreationFailed(format!("vkCreateShaderModule: {e:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEPTH_ONLY: &str = r#"
struct PushConstants {
    mvp: mat4x4<f32>,
}
var<push_constant> pc: PushConstants;

@vertex
fn vs_main(@location(0) position: vec3<f32>) -> @builtin(position) vec4<f32> {
    return pc.mvp * vec4<f32>(position, 1.0);
}
"#;

    #[test]
    fn test_vertex_entry_translates() {
        let spv = wgsl_to_spirv(DEPTH_ONLY, naga::ShaderStage::Vertex, "vs_main").unwrap();
        // SPIR-V magic number
        assert_eq!(spv[0], 0x0723_0203);
    }

    #[test]
    fn test_missing_entry_point() {
        let result = wgsl_to_spirv(DEPTH_ONLY, naga::ShaderStage::Fragment, "fs_main");
        assert!(matches!(result, Err(BackendError::ShaderCreationFailed(_))));
    }

    #[test]
    fn test_parse_error_is_reported() {
        let result = wgsl_to_spirv("fn broken(", naga::ShaderStage::Vertex, "vs_main");
        assert!(matches!(result, Err(BackendError::ShaderCreationFailed(_))));
    }
}
