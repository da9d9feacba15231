// Draws and dispatches through real pipelines on an offscreen context.
// Tests return early when no Vulkan device can be created or when build.rs
// could not compile the shaders.

use std::fs;
use std::path::Path;
use std::rc::Rc;
use vkgfx::backend::context::capture_buffer_size;
use vkgfx::backend::pipeline::{
    AttributeDesc, AttributeRate, BindingType, GraphicsParams, PipelineType, ResourceDesc,
    Topology, UniformBlock, UniformField,
};
use vkgfx::backend::program::spirv_from_bytes;
use vkgfx::backend::{
    create_context, BackendError, Buffer, BufferUsage, ContextConfig, Format, GraphicsContext,
    Pipeline, PipelineParams, Program, ShaderCompiler, ShaderStage, VulkanContext,
};

const SIZE: u32 = 64;
const BLACK: [u8; 4] = [0, 0, 0, 255];
const BLUE: [u8; 4] = [0, 0, 255, 255];

const FULLSCREEN_TRIANGLE: [f32; 6] = [-1.0, -1.0, 3.0, -1.0, -1.0, 3.0];

fn offscreen_context() -> Option<VulkanContext> {
    let config = ContextConfig {
        width: SIZE,
        height: SIZE,
        offscreen: true,
        clear_color: [0.0, 0.0, 0.0, 1.0],
        validation: false,
        fence_timeout: 10_000_000_000,
        ..Default::default()
    };
    match create_context(config) {
        Ok(mut ctx) => {
            ctx.set_capture_buffer(Some(vec![0; capture_buffer_size(SIZE, SIZE)]))
                .unwrap();
            Some(ctx)
        }
        Err(e) => {
            eprintln!("skipping: no usable Vulkan device ({})", e);
            None
        }
    }
}

fn load_spirv(name: &str) -> Option<Vec<u32>> {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("shaders").join(name);
    match fs::read(&path) {
        Ok(bytes) => Some(spirv_from_bytes(&bytes).unwrap()),
        Err(_) => {
            eprintln!("skipping: {:?} was not compiled", path);
            None
        }
    }
}

fn f32_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_ne_bytes()).collect()
}

fn assert_all_pixels(pixels: &[u8], expected: [u8; 4]) {
    for (i, px) in pixels.chunks_exact(4).enumerate() {
        assert_eq!(px, expected, "pixel {} differs", i);
    }
}

/// The demo triangle pipeline: vec2 positions and a fragment color uniform.
fn triangle_pipeline(ctx: &VulkanContext) -> Option<Pipeline> {
    let vert = load_spirv("triangle.vert.spv")?;
    let frag = load_spirv("triangle.frag.spv")?;
    let program = Program::from_spirv(
        ctx.device(),
        &[
            (ShaderStage::Vertex, vert.as_slice()),
            (ShaderStage::Fragment, frag.as_slice()),
        ],
        None,
    )
    .unwrap();

    let pipeline = Pipeline::new(
        ctx.device(),
        ctx.frames_in_flight(),
        PipelineParams {
            pipeline_type: PipelineType::Graphics,
            program: Rc::new(program),
            graphics: GraphicsParams {
                topology: Topology::TriangleList,
                state: Default::default(),
                rt_desc: ctx.default_rendertarget_desc(),
            },
            attributes: vec![AttributeDesc {
                name: "position".into(),
                location: 0,
                format: Format::R32G32Sfloat,
                stride: 8,
                offset: 0,
                rate: AttributeRate::Vertex,
            }],
            buffers: Vec::new(),
            textures: Vec::new(),
            uniform_blocks: [
                None,
                Some(UniformBlock {
                    name: "FragUniforms".into(),
                    binding: 0,
                    size: 16,
                    fields: vec![UniformField {
                        name: "color".into(),
                        offset: 0,
                        size: 16,
                    }],
                }),
                None,
            ],
        },
    )
    .unwrap();
    Some(pipeline)
}

#[test]
fn draw_needs_every_attribute_bound() {
    let Some(mut ctx) = offscreen_context() else {
        return;
    };
    let Some(mut pipeline) = triangle_pipeline(&ctx) else {
        return;
    };
    let color = pipeline.uniform_index("color").unwrap();
    let position = pipeline.attribute_index("position").unwrap();
    assert_eq!(pipeline.unbound_attributes(), 1);

    // Only the last write before a draw reaches the GPU
    pipeline.update_uniform(color, &f32_bytes(&[1.0, 0.0, 0.0, 1.0])).unwrap();
    pipeline.update_uniform(color, &f32_bytes(&[0.0, 0.0, 1.0, 1.0])).unwrap();

    let mut frame = ctx.begin_frame(0.0).unwrap();
    assert!(matches!(
        pipeline.draw(&mut frame, 3, 1),
        Err(BackendError::InvalidUsage(_))
    ));
    ctx.end_frame(frame, 0.0).unwrap();
    // The rejected draw left only the clear behind
    assert_all_pixels(ctx.capture_buffer().unwrap(), BLACK);

    let bytes = f32_bytes(&FULLSCREEN_TRIANGLE);
    let vertices = Rc::new(Buffer::new(ctx.device(), bytes.len(), BufferUsage::VERTEX).unwrap());
    vertices.upload(&bytes, 0).unwrap();
    pipeline.update_attribute(position, Some(vertices)).unwrap();
    assert_eq!(pipeline.unbound_attributes(), 0);

    let mut frame = ctx.begin_frame(1.0).unwrap();
    pipeline.draw(&mut frame, 3, 1).unwrap();
    ctx.end_frame(frame, 1.0).unwrap();
    assert_all_pixels(ctx.capture_buffer().unwrap(), BLUE);
}

#[test]
fn dispatch_output_feeds_a_draw_in_the_same_frame() {
    let Some(mut ctx) = offscreen_context() else {
        return;
    };
    let Some(mut draw) = triangle_pipeline(&ctx) else {
        return;
    };
    let Some(comp) = load_spirv("positions.comp.spv") else {
        return;
    };
    let program = Program::from_spirv(ctx.device(), &[(ShaderStage::Compute, comp.as_slice())], None)
        .unwrap();
    let mut fill = Pipeline::new(
        ctx.device(),
        ctx.frames_in_flight(),
        PipelineParams {
            pipeline_type: PipelineType::Compute,
            program: Rc::new(program),
            graphics: GraphicsParams {
                topology: Topology::TriangleList,
                state: Default::default(),
                rt_desc: ctx.default_rendertarget_desc(),
            },
            attributes: Vec::new(),
            buffers: vec![ResourceDesc {
                name: "Positions".into(),
                binding: 0,
                binding_type: BindingType::StorageBuffer,
                stage: ShaderStage::Compute,
            }],
            textures: Vec::new(),
            uniform_blocks: [None, None, None],
        },
    )
    .unwrap();

    let positions = Rc::new(
        Buffer::new(ctx.device(), 24, BufferUsage::VERTEX | BufferUsage::STORAGE).unwrap(),
    );
    positions.upload(&[0; 24], 0).unwrap();
    let slot = fill.buffer_index("Positions").unwrap();
    fill.update_buffer(slot, Some(Rc::clone(&positions))).unwrap();

    let position = draw.attribute_index("position").unwrap();
    draw.update_attribute(position, Some(Rc::clone(&positions))).unwrap();
    let color = draw.uniform_index("color").unwrap();
    draw.update_uniform(color, &f32_bytes(&[0.0, 0.0, 1.0, 1.0])).unwrap();

    let mut frame = ctx.begin_frame(0.0).unwrap();
    // A compute pipeline cannot draw and a graphics pipeline cannot dispatch
    assert!(fill.draw(&mut frame, 3, 1).is_err());
    assert!(draw.dispatch(&mut frame, [3, 1, 1]).is_err());

    fill.dispatch(&mut frame, [3, 1, 1]).unwrap();
    assert!(!frame.is_pass_open());
    draw.draw(&mut frame, 3, 1).unwrap();
    ctx.end_frame(frame, 0.0).unwrap();

    assert_all_pixels(ctx.capture_buffer().unwrap(), BLUE);
    let mut written = [0u8; 24];
    positions.download(&mut written, 0).unwrap();
    assert_eq!(written.to_vec(), f32_bytes(&FULLSCREEN_TRIANGLE));
}

struct RejectingCompiler;

impl ShaderCompiler for RejectingCompiler {
    fn compile(&self, _stage: ShaderStage, _source: &str) -> Result<Vec<u32>, String> {
        Err("0:3: 'tint' : undeclared identifier".into())
    }
}

#[test]
fn compiler_failure_surfaces_as_external_error() {
    let Some(ctx) = offscreen_context() else {
        return;
    };
    let result = Program::compile(
        ctx.device(),
        &RejectingCompiler,
        &[(ShaderStage::Fragment, "void main() {\n    tint;\n}")],
        None,
    );
    match result {
        Err(BackendError::ExternalApi(message)) => assert!(message.contains("undeclared")),
        Err(other) => panic!("expected ExternalApi, got {:?}", other),
        Ok(_) => panic!("compilation should have failed"),
    }
}
