// Shader module loading and the built-in object shader
//
// Vulkan uses SPIR-V bytecode for shaders. Stages are loaded at runtime from
// `<base>.vert.spv` and `<base>.frag.spv`.

use anyhow::{Context, Result};
use ash::vk;
use std::ffi::CStr;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::command_buffer::CommandBuffer;
use super::pipeline::Pipeline;
use super::render_pass::RenderPass;
use super::VulkanDevice;

const ENTRY_POINT: &CStr = c"main";

/// Stage file paths derived from a base path, vertex first
pub fn stage_paths(base: &str) -> [(PathBuf, vk::ShaderStageFlags); 2] {
    [
        (
            PathBuf::from(format!("{}.vert.spv", base)),
            vk::ShaderStageFlags::VERTEX,
        ),
        (
            PathBuf::from(format!("{}.frag.spv", base)),
            vk::ShaderStageFlags::FRAGMENT,
        ),
    ]
}

/// Read a whole SPIR-V file into correctly aligned words. Content is left
/// for the driver to accept or reject at module creation.
pub fn read_spirv(path: &Path) -> Result<Vec<u32>> {
    let mut file =
        File::open(path).with_context(|| format!("Failed to open shader {:?}", path))?;
    ash::util::read_spv(&mut file).with_context(|| format!("Failed to read SPIR-V from {:?}", path))
}

pub struct ShaderModule {
    pub handle: vk::ShaderModule,
    pub stage: vk::ShaderStageFlags,
    device: Arc<VulkanDevice>,
}

impl ShaderModule {
    pub fn from_file(
        device: Arc<VulkanDevice>,
        path: &Path,
        stage: vk::ShaderStageFlags,
    ) -> Result<Self> {
        let code = read_spirv(path)?;
        let create_info = vk::ShaderModuleCreateInfo::builder().code(&code);

        let handle = unsafe { device.device.create_shader_module(&create_info, None) }
            .with_context(|| format!("Failed to create shader module from {:?}", path))?;
        log::debug!("Loaded {:?} stage from {:?}", stage, path);

        Ok(Self {
            handle,
            stage,
            device,
        })
    }

    pub fn stage_info(&self) -> vk::PipelineShaderStageCreateInfo {
        vk::PipelineShaderStageCreateInfo::builder()
            .stage(self.stage)
            .module(self.handle)
            .name(ENTRY_POINT)
            .build()
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_shader_module(self.handle, None);
        }
    }
}

/// Pipeline built from the vertex + fragment stages
pub struct ObjectShader {
    pub pipeline: Pipeline,
}

impl ObjectShader {
    pub fn new(
        device: Arc<VulkanDevice>,
        render_pass: &RenderPass,
        base: &str,
        wireframe: bool,
    ) -> Result<Self> {
        let stages = stage_paths(base)
            .iter()
            .map(|(path, stage)| ShaderModule::from_file(device.clone(), path, *stage))
            .collect::<Result<Vec<_>>>()?;

        let stage_infos: Vec<_> = stages.iter().map(ShaderModule::stage_info).collect();
        let pipeline = Pipeline::new(device, render_pass, &stage_infos, wireframe)
            .with_context(|| format!("Failed to build pipeline for shader '{}'", base))?;

        // Modules are only needed while the pipeline is created
        drop(stages);
        log::info!("Object shader '{}' ready", base);
        Ok(Self { pipeline })
    }

    pub fn bind(&self, command_buffer: &CommandBuffer) {
        self.pipeline.bind(command_buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SPIRV_MAGIC: u32 = 0x0723_0203;

    fn write_words(words: &[u32]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for word in words {
            file.write_all(&word.to_le_bytes()).unwrap();
        }
        file.flush().unwrap();
        file
    }

    #[test]
    fn stage_paths_append_stage_suffix() {
        let [(vert, vert_stage), (frag, frag_stage)] = stage_paths("shaders/object");
        assert_eq!(vert, PathBuf::from("shaders/object.vert.spv"));
        assert_eq!(frag, PathBuf::from("shaders/object.frag.spv"));
        assert_eq!(vert_stage, vk::ShaderStageFlags::VERTEX);
        assert_eq!(frag_stage, vk::ShaderStageFlags::FRAGMENT);
    }

    #[test]
    fn reads_whole_module() {
        let file = write_words(&[SPIRV_MAGIC, 0x0001_0000, 0, 1, 0]);
        let code = read_spirv(file.path()).unwrap();
        assert_eq!(code.len(), 5);
        assert_eq!(code[0], SPIRV_MAGIC);
    }

    #[test]
    fn big_endian_module_is_normalised() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&SPIRV_MAGIC.to_be_bytes()).unwrap();
        file.write_all(&0x0001_0000u32.to_be_bytes()).unwrap();
        file.flush().unwrap();

        let code = read_spirv(file.path()).unwrap();
        assert_eq!(code, vec![SPIRV_MAGIC, 0x0001_0000]);
    }

    #[test]
    fn rejects_truncated_file() {
        let mut truncated = tempfile::NamedTempFile::new().unwrap();
        truncated.write_all(&[0x03, 0x02, 0x23]).unwrap();
        truncated.flush().unwrap();
        assert!(read_spirv(truncated.path()).is_err());
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_spirv(&dir.path().join("absent.vert.spv")).unwrap_err();
        assert!(format!("{:#}", err).contains("absent.vert.spv"));
    }
}
