// Build script to compile the demo GLSL shaders to SPIR-V
//
// Compilation is best effort: without glslc the demo renders clear-only
// frames, so a missing compiler or a shader error never fails the build.

use std::path::Path;
use std::process::Command;

// positions.comp is only used by the pipeline tests
const SHADERS: [&str; 3] = [
    "shaders/triangle.vert",
    "shaders/triangle.frag",
    "shaders/positions.comp",
];

fn main() {
    println!("cargo:rerun-if-changed=shaders/");

    // Compile shaders using glslc (part of Vulkan SDK)
    for shader in SHADERS {
        compile_shader(shader, &format!("{}.spv", shader));
    }
}

fn compile_shader(input: &str, output: &str) {
    let input_path = Path::new(input);
    let output_path = Path::new(output);

    let result = Command::new("glslc")
        .arg(input_path)
        .arg("-o")
        .arg(output_path)
        .status();

    match result {
        Ok(status) if status.success() => {}
        Ok(status) => {
            println!(
                "cargo:warning=Failed to compile {}: exit code {:?}",
                input,
                status.code()
            );
        }
        Err(e) => {
            println!("cargo:warning=glslc not found ({}), {} not compiled", e, input);
        }
    }
}
