//! WGSL validation for every program the pipeline compiles.
//!
//! Sources are parsed and validated with naga after define substitution, and
//! the uniform struct layout naga computes is checked against the byte
//! layout the backends write.

use rstest::rstest;

use deferred_renderer::backend::{ProgramDescriptor, UniformLayout};
use deferred_renderer::pipeline::{
    AccumulatePass, AmbientLightPass, BlitPass, DirectionalLightPass, GeometryPass, LightMergePass,
    PointLightPass,
};

fn validate(desc: &ProgramDescriptor) -> naga::Module {
    let source = desc.processed_source();
    let module = match naga::front::wgsl::parse_str(&source) {
        Ok(module) => module,
        Err(e) => panic!("{}: {}", desc.label, e.emit_to_string(&source)),
    };
    let mut validator = naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::all(),
    );
    if let Err(e) = validator.validate(&module) {
        panic!("{}: {}", desc.label, e.emit_to_string(&source));
    }
    module
}

/// Member offsets of the `uniforms` struct, if the program declares one
fn uniform_offsets(module: &naga::Module) -> Option<Vec<(String, u32)>> {
    let (_, global) = module
        .global_variables
        .iter()
        .find(|(_, var)| var.name.as_deref() == Some("uniforms"))?;
    match &module.types[global.ty].inner {
        naga::TypeInner::Struct { members, .. } => Some(
            members
                .iter()
                .map(|m| (m.name.clone().unwrap_or_default(), m.offset))
                .collect(),
        ),
        _ => None,
    }
}

fn check_layout(desc: &ProgramDescriptor, module: &naga::Module) {
    let layout = UniformLayout::new(&desc.uniforms);
    match uniform_offsets(module) {
        Some(members) => {
            assert_eq!(members.len(), layout.offsets.len(), "{}", desc.label);
            for (name, offset) in members {
                let expected = layout.offsets.get(&name).map(|(offset, _)| *offset);
                assert_eq!(expected, Some(offset as u64), "{}.{}", desc.label, name);
            }
        }
        None => assert_eq!(layout.size, 0, "{} has no uniform struct", desc.label),
    }

    let textures = module
        .global_variables
        .iter()
        .filter(|(_, var)| var.binding.as_ref().is_some_and(|b| b.group == 1))
        .count();
    assert_eq!(textures, layout.samplers.len(), "{}", desc.label);
}

#[test]
fn test_fixed_programs() {
    for desc in [
        GeometryPass::program_descriptor(),
        LightMergePass::program_descriptor(),
        AccumulatePass::program_descriptor(),
        BlitPass::program_descriptor(),
    ] {
        let module = validate(&desc);
        check_layout(&desc, &module);
    }
}

#[rstest]
#[case::disabled(0)]
#[case::single(1)]
#[case::several(7)]
#[case::many(64)]
fn test_light_programs(#[case] count: usize) {
    for desc in [
        AmbientLightPass::program_descriptor(count),
        DirectionalLightPass::program_descriptor(count),
        PointLightPass::program_descriptor(count),
    ] {
        let module = validate(&desc);
        check_layout(&desc, &module);
    }
}

#[test]
fn test_light_sources_without_defines() {
    for mut desc in [
        AmbientLightPass::program_descriptor(3),
        DirectionalLightPass::program_descriptor(3),
        PointLightPass::program_descriptor(3),
    ] {
        desc.defines.clear();
        validate(&desc);
    }
}

#[test]
fn test_defines_are_substituted() {
    let desc = DirectionalLightPass::program_descriptor(5);
    let source = desc.processed_source();
    assert!(source.contains("const DATA_SIZE: u32 = 5u;"));
    assert!(source.contains("const ENABLED: bool = true;"));

    let desc = DirectionalLightPass::program_descriptor(0);
    let source = desc.processed_source();
    assert!(source.contains("const DATA_SIZE: u32 = 1u;"));
    assert!(source.contains("const ENABLED: bool = false;"));
}
