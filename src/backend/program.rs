// Shader programs
//
// A program is a set of SPIR-V stage modules plus the reflection data the
// resource layer produced alongside the shader sources. Compilation from
// source is delegated to a ShaderCompiler implementation.

use super::error::{BackendError, BackendResult};
use super::VulkanDevice;
use ash::vk;
use std::io::Cursor;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Fragment,
    Compute,
}

impl ShaderStage {
    pub const ALL: [Self; 3] = [Self::Vertex, Self::Fragment, Self::Compute];

    pub fn index(self) -> usize {
        match self {
            Self::Vertex => 0,
            Self::Fragment => 1,
            Self::Compute => 2,
        }
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn to_vk(self) -> vk::ShaderStageFlags {
        match self {
            Self::Vertex => vk::ShaderStageFlags::VERTEX,
            Self::Fragment => vk::ShaderStageFlags::FRAGMENT,
            Self::Compute => vk::ShaderStageFlags::COMPUTE,
        }
    }
}

/// Turns shader source into SPIR-V words, or a human-readable error.
pub trait ShaderCompiler {
    fn compile(&self, stage: ShaderStage, source: &str) -> Result<Vec<u32>, String>;
}

/// A vertex input as the shader declares it. Matrices span `count`
/// consecutive locations of `element_size` bytes each.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderAttribute {
    pub name: String,
    pub location: u32,
    pub element_size: u32,
    pub count: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgramReflection {
    pub attributes: Vec<ShaderAttribute>,
    /// Buffer, texture and uniform block names declared per stage
    pub bindings: [Vec<String>; 3],
}

impl ProgramReflection {
    pub fn attribute(&self, name: &str) -> Option<&ShaderAttribute> {
        self.attributes.iter().find(|a| a.name == name)
    }

    pub fn declares(&self, stage: ShaderStage, name: &str) -> bool {
        self.bindings[stage.index()].iter().any(|n| n == name)
    }
}

/// Reads a SPIR-V binary into words, checking size and magic number.
pub fn spirv_from_bytes(bytes: &[u8]) -> BackendResult<Vec<u32>> {
    ash::util::read_spv(&mut Cursor::new(bytes))
        .map_err(|e| BackendError::invalid_usage(format!("invalid SPIR-V: {}", e)))
}

/// Prefixes every line with its 1-based number, for compile error logs.
pub fn numbered_source(source: &str) -> String {
    source
        .lines()
        .enumerate()
        .map(|(i, line)| format!("{:4} {}", i + 1, line))
        .collect::<Vec<_>>()
        .join("\n")
}

pub struct Program {
    device: Arc<VulkanDevice>,
    modules: [vk::ShaderModule; 3],
    reflection: Option<ProgramReflection>,
}

impl Program {
    /// Creates a program from prebuilt SPIR-V modules, at most one per stage.
    pub fn from_spirv(
        device: &Arc<VulkanDevice>,
        stages: &[(ShaderStage, &[u32])],
        reflection: Option<ProgramReflection>,
    ) -> BackendResult<Self> {
        let mut program = Self {
            device: Arc::clone(device),
            modules: [vk::ShaderModule::null(); 3],
            reflection,
        };

        for &(stage, code) in stages {
            if program.modules[stage.index()] != vk::ShaderModule::null() {
                return Err(BackendError::invalid_usage(format!(
                    "{:?} stage given twice",
                    stage
                )));
            }
            let create_info = vk::ShaderModuleCreateInfo::builder().code(code);
            let module = unsafe { device.device.create_shader_module(&create_info, None)? };
            program.modules[stage.index()] = module;
        }

        log::debug!("Created program with {} stage(s)", stages.len());
        Ok(program)
    }

    /// Compiles each source with `compiler` and builds the program.
    pub fn compile(
        device: &Arc<VulkanDevice>,
        compiler: &dyn ShaderCompiler,
        sources: &[(ShaderStage, &str)],
        reflection: Option<ProgramReflection>,
    ) -> BackendResult<Self> {
        let binaries = compile_sources(compiler, sources)?;
        let stages: Vec<(ShaderStage, &[u32])> = binaries
            .iter()
            .map(|(stage, code)| (*stage, code.as_slice()))
            .collect();
        Self::from_spirv(device, &stages, reflection)
    }

    pub fn module(&self, stage: ShaderStage) -> Option<vk::ShaderModule> {
        let module = self.modules[stage.index()];
        (module != vk::ShaderModule::null()).then_some(module)
    }

    pub fn reflection(&self) -> Option<&ProgramReflection> {
        self.reflection.as_ref()
    }

    /// Whether `name` is a binding of `stage`. Programs without reflection
    /// accept every name.
    pub fn declares_binding(&self, stage: ShaderStage, name: &str) -> bool {
        self.reflection
            .as_ref()
            .map_or(true, |r| r.declares(stage, name))
    }
}

/// Runs `compiler` over every source. The first failure is logged with the
/// numbered source and stops compilation.
pub fn compile_sources(
    compiler: &dyn ShaderCompiler,
    sources: &[(ShaderStage, &str)],
) -> BackendResult<Vec<(ShaderStage, Vec<u32>)>> {
    sources
        .iter()
        .map(|&(stage, source)| {
            let code = compiler.compile(stage, source).map_err(|message| {
                log::error!(
                    "Failed to compile {:?} shader:\n{}\n{}",
                    stage,
                    numbered_source(source),
                    message
                );
                BackendError::ExternalApi(format!("{:?} shader compilation failed: {}", stage, message))
            })?;
            Ok((stage, code))
        })
        .collect()
}

impl Drop for Program {
    fn drop(&mut self) {
        for module in self.modules {
            if module != vk::ShaderModule::null() {
                unsafe { self.device.device.destroy_shader_module(module, None) };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingCompiler;

    impl ShaderCompiler for FailingCompiler {
        fn compile(&self, _stage: ShaderStage, _source: &str) -> Result<Vec<u32>, String> {
            Err("0:2: 'foo' : undeclared identifier".into())
        }
    }

    #[test]
    fn test_numbered_source() {
        let source = "#version 450\nvoid main() {\n}";
        let numbered = numbered_source(source);
        let lines: Vec<&str> = numbered.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "   1 #version 450");
        assert_eq!(lines[2], "   3 }");
    }

    #[test]
    fn test_stage_index_round_trip() {
        for stage in ShaderStage::ALL {
            assert_eq!(ShaderStage::from_index(stage.index()), Some(stage));
        }
        assert_eq!(ShaderStage::from_index(3), None);
    }

    #[test]
    fn test_reflection_lookup() {
        let reflection = ProgramReflection {
            attributes: vec![ShaderAttribute {
                name: "position".into(),
                location: 0,
                element_size: 12,
                count: 1,
            }],
            bindings: [vec!["ubo".into()], vec!["tex0".into()], vec![]],
        };
        assert_eq!(reflection.attribute("position").map(|a| a.location), Some(0));
        assert!(reflection.attribute("normal").is_none());
        assert!(reflection.declares(ShaderStage::Fragment, "tex0"));
        assert!(!reflection.declares(ShaderStage::Vertex, "tex0"));
    }

    struct EchoCompiler;

    impl ShaderCompiler for EchoCompiler {
        fn compile(&self, stage: ShaderStage, source: &str) -> Result<Vec<u32>, String> {
            Ok(vec![stage.index() as u32, source.len() as u32])
        }
    }

    #[test]
    fn test_compiler_error_is_reported() {
        let sources = [(ShaderStage::Vertex, "void main() { foo; }")];
        match compile_sources(&FailingCompiler, &sources) {
            Err(BackendError::ExternalApi(message)) => {
                assert!(message.contains("Vertex"));
                assert!(message.contains("undeclared"));
            }
            other => panic!("expected ExternalApi, got {:?}", other),
        }
    }

    #[test]
    fn test_sources_compile_in_order() {
        let sources = [(ShaderStage::Vertex, "abc"), (ShaderStage::Fragment, "abcdef")];
        let binaries = compile_sources(&EchoCompiler, &sources).unwrap();
        assert_eq!(
            binaries,
            vec![(ShaderStage::Vertex, vec![0, 3]), (ShaderStage::Fragment, vec![1, 6])]
        );
    }

    #[test]
    fn test_spirv_rejects_bad_input() {
        assert!(spirv_from_bytes(&[1, 2, 3]).is_err());
        assert!(spirv_from_bytes(&[0, 0, 0, 0]).is_err());

        // Magic number followed by one word
        let bytes = [0x03, 0x02, 0x23, 0x07, 0, 0, 0, 0];
        assert_eq!(spirv_from_bytes(&bytes).unwrap().len(), 2);
    }
}
