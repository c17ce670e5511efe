//! Device capability checks.
//!
//! Device features are modelled as an explicit, ordered list of named flags
//! ([`DeviceFeature`]) shared by the requirement side and the device report
//! side, so a requirement is checked flag by flag, by position.
use crate::device::CandidateDevice;
use ash::vk;
use std::{ffi::CStr, fmt};

macro_rules! device_features {
    ($($variant:ident => $field:ident,)*) => {
        /// A single Vulkan 1.0 device feature, in the order of
        /// [`vk::PhysicalDeviceFeatures`].
        #[allow(missing_docs)]
        #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
        pub enum DeviceFeature {
            $($variant,)*
        }

        impl DeviceFeature {
            /// Every feature, in declaration order.
            pub const ALL: &'static [DeviceFeature] = &[$(DeviceFeature::$variant,)*];

            /// Amount of known features.
            pub const COUNT: usize = Self::ALL.len();

            /// The field name of this feature in [`vk::PhysicalDeviceFeatures`].
            pub fn name(self) -> &'static str {
                match self {
                    $(DeviceFeature::$variant => stringify!($field),)*
                }
            }
        }

        impl From<&vk::PhysicalDeviceFeatures> for DeviceFeatures {
            fn from(features: &vk::PhysicalDeviceFeatures) -> Self {
                let mut out = DeviceFeatures::none();
                $(out.flags[DeviceFeature::$variant as usize] = features.$field == vk::TRUE;)*
                out
            }
        }

        impl DeviceFeatures {
            /// Convert into the struct passed to device creation.
            pub fn to_vulkan(&self) -> vk::PhysicalDeviceFeatures {
                vk::PhysicalDeviceFeatures {
                    $($field: self.flags[DeviceFeature::$variant as usize] as vk::Bool32,)*
                }
            }
        }
    };
}

device_features! {
    RobustBufferAccess => robust_buffer_access,
    FullDrawIndexUint32 => full_draw_index_uint32,
    ImageCubeArray => image_cube_array,
    IndependentBlend => independent_blend,
    GeometryShader => geometry_shader,
    TessellationShader => tessellation_shader,
    SampleRateShading => sample_rate_shading,
    DualSrcBlend => dual_src_blend,
    LogicOp => logic_op,
    MultiDrawIndirect => multi_draw_indirect,
    DrawIndirectFirstInstance => draw_indirect_first_instance,
    DepthClamp => depth_clamp,
    DepthBiasClamp => depth_bias_clamp,
    FillModeNonSolid => fill_mode_non_solid,
    DepthBounds => depth_bounds,
    WideLines => wide_lines,
    LargePoints => large_points,
    AlphaToOne => alpha_to_one,
    MultiViewport => multi_viewport,
    SamplerAnisotropy => sampler_anisotropy,
    TextureCompressionEtc2 => texture_compression_etc2,
    TextureCompressionAstcLdr => texture_compression_astc_ldr,
    TextureCompressionBc => texture_compression_bc,
    OcclusionQueryPrecise => occlusion_query_precise,
    PipelineStatisticsQuery => pipeline_statistics_query,
    VertexPipelineStoresAndAtomics => vertex_pipeline_stores_and_atomics,
    FragmentStoresAndAtomics => fragment_stores_and_atomics,
    ShaderTessellationAndGeometryPointSize => shader_tessellation_and_geometry_point_size,
    ShaderImageGatherExtended => shader_image_gather_extended,
    ShaderStorageImageExtendedFormats => shader_storage_image_extended_formats,
    ShaderStorageImageMultisample => shader_storage_image_multisample,
    ShaderStorageImageReadWithoutFormat => shader_storage_image_read_without_format,
    ShaderStorageImageWriteWithoutFormat => shader_storage_image_write_without_format,
    ShaderUniformBufferArrayDynamicIndexing => shader_uniform_buffer_array_dynamic_indexing,
    ShaderSampledImageArrayDynamicIndexing => shader_sampled_image_array_dynamic_indexing,
    ShaderStorageBufferArrayDynamicIndexing => shader_storage_buffer_array_dynamic_indexing,
    ShaderStorageImageArrayDynamicIndexing => shader_storage_image_array_dynamic_indexing,
    ShaderClipDistance => shader_clip_distance,
    ShaderCullDistance => shader_cull_distance,
    ShaderFloat64 => shader_float64,
    ShaderInt64 => shader_int64,
    ShaderInt16 => shader_int16,
    ShaderResourceResidency => shader_resource_residency,
    ShaderResourceMinLod => shader_resource_min_lod,
    SparseBinding => sparse_binding,
    SparseResidencyBuffer => sparse_residency_buffer,
    SparseResidencyImage2D => sparse_residency_image2_d,
    SparseResidencyImage3D => sparse_residency_image3_d,
    SparseResidency2Samples => sparse_residency2_samples,
    SparseResidency4Samples => sparse_residency4_samples,
    SparseResidency8Samples => sparse_residency8_samples,
    SparseResidency16Samples => sparse_residency16_samples,
    SparseResidencyAliased => sparse_residency_aliased,
    VariableMultisampleRate => variable_multisample_rate,
    InheritedQueries => inherited_queries,
}

impl fmt::Display for DeviceFeature {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A set of device features, either required by the application or
/// reported by a physical device.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct DeviceFeatures {
    flags: [bool; DeviceFeature::COUNT],
}

impl DeviceFeatures {
    /// No features.
    #[inline]
    pub fn none() -> DeviceFeatures {
        DeviceFeatures {
            flags: [false; DeviceFeature::COUNT],
        }
    }

    /// Add `feature` to the set.
    #[inline]
    pub fn require(mut self, feature: DeviceFeature) -> DeviceFeatures {
        self.flags[feature as usize] = true;
        self
    }

    /// Set or clear a single feature.
    #[inline]
    pub fn set(&mut self, feature: DeviceFeature, enabled: bool) {
        self.flags[feature as usize] = enabled;
    }

    /// Returns true if `feature` is in the set.
    #[inline]
    pub fn contains(&self, feature: DeviceFeature) -> bool {
        self.flags[feature as usize]
    }

    /// Iterate over the features in the set, in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = DeviceFeature> + '_ {
        DeviceFeature::ALL
            .iter()
            .copied()
            .filter(|&feature| self.contains(feature))
    }

    /// Features in `self` which are absent from `supported`.
    pub fn missing_from<'a>(
        &'a self,
        supported: &'a DeviceFeatures,
    ) -> impl Iterator<Item = DeviceFeature> + 'a {
        self.flags
            .iter()
            .zip(supported.flags.iter())
            .enumerate()
            .filter(|&(_, (&required, &present))| required && !present)
            .map(|(i, _)| DeviceFeature::ALL[i])
    }

    /// Returns true if every feature in `self` is also in `supported`.
    #[inline]
    pub fn is_satisfied_by(&self, supported: &DeviceFeatures) -> bool {
        self.missing_from(supported).next().is_none()
    }
}

impl Default for DeviceFeatures {
    fn default() -> Self {
        DeviceFeatures::none()
    }
}

impl From<vk::PhysicalDeviceFeatures> for DeviceFeatures {
    fn from(features: vk::PhysicalDeviceFeatures) -> Self {
        DeviceFeatures::from(&features)
    }
}

impl FromIterator<DeviceFeature> for DeviceFeatures {
    fn from_iter<I: IntoIterator<Item = DeviceFeature>>(iter: I) -> Self {
        iter.into_iter().fold(DeviceFeatures::none(), DeviceFeatures::require)
    }
}

impl fmt::Debug for DeviceFeatures {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_set().entries(self.iter()).finish()
    }
}

/// Outcome of [`validate_capabilities`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CapabilityCheck {
    /// Every required extension is supported.
    pub extensions_ok: bool,
    /// Every required feature is supported.
    pub features_ok: bool,
}

impl CapabilityCheck {
    /// Both extensions and features are satisfied.
    #[inline]
    pub fn passed(&self) -> bool {
        self.extensions_ok && self.features_ok
    }
}

/// Check a device's extensions and features against the requirements.
/// Both checks are always computed, so a device may fail on both.
pub fn validate_capabilities(
    device: &CandidateDevice,
    required_extensions: &[&CStr],
    required_features: &DeviceFeatures,
) -> CapabilityCheck {
    let extensions_ok = required_extensions
        .iter()
        .all(|&extension| device.supports_extension(extension));

    CapabilityCheck {
        extensions_ok,
        features_ok: required_features.is_satisfied_by(&device.features),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueueFamily;
    use cstr::cstr;

    fn device(extensions: &[&CStr], features: DeviceFeatures) -> CandidateDevice {
        CandidateDevice {
            physical_device: vk::PhysicalDevice::null(),
            name: "test".into(),
            device_type: vk::PhysicalDeviceType::INTEGRATED_GPU,
            api_version: vk::API_VERSION_1_0,
            features,
            extensions: extensions.iter().map(|&e| e.to_owned()).collect(),
            queue_families: vec![QueueFamily::new(0, vk::QueueFlags::GRAPHICS, 1)],
        }
    }

    #[test]
    fn vulkan_conversion_is_positional() {
        let raw = vk::PhysicalDeviceFeatures {
            geometry_shader: vk::TRUE,
            sparse_residency_aliased: vk::TRUE,
            ..Default::default()
        };

        let features = DeviceFeatures::from(&raw);
        assert!(features.contains(DeviceFeature::GeometryShader));
        assert!(features.contains(DeviceFeature::SparseResidencyAliased));
        assert!(!features.contains(DeviceFeature::RobustBufferAccess));
        assert_eq!(features.iter().count(), 2);

        let back = features.to_vulkan();
        assert_eq!(back.geometry_shader, vk::TRUE);
        assert_eq!(back.sparse_residency_aliased, vk::TRUE);
        assert_eq!(back.inherited_queries, vk::FALSE);
    }

    #[test]
    fn feature_count_matches_vulkan_struct() {
        let size = std::mem::size_of::<vk::PhysicalDeviceFeatures>();
        assert_eq!(DeviceFeature::COUNT * std::mem::size_of::<vk::Bool32>(), size);
        assert_eq!(DeviceFeature::ALL.last().map(|f| f.name()), Some("inherited_queries"));
    }

    #[test]
    fn empty_requirements_always_pass() {
        let check = validate_capabilities(&device(&[], DeviceFeatures::none()), &[], &DeviceFeatures::none());
        assert!(check.passed());
    }

    #[test]
    fn missing_extension_fails_without_partial_credit() {
        let swapchain = cstr!("VK_KHR_swapchain");
        let other = cstr!("VK_KHR_maintenance1");
        let dev = device(&[swapchain], DeviceFeatures::none());

        let check = validate_capabilities(&dev, &[swapchain, other], &DeviceFeatures::none());
        assert!(!check.extensions_ok);
        assert!(check.features_ok);
    }

    #[test]
    fn single_missing_feature_fails() {
        let supported = DeviceFeatures::none().require(DeviceFeature::SamplerAnisotropy);
        let required = supported.require(DeviceFeature::ShaderFloat64);
        let dev = device(&[], supported);

        let check = validate_capabilities(&dev, &[], &required);
        assert!(check.extensions_ok);
        assert!(!check.features_ok);
        assert_eq!(
            required.missing_from(&supported).collect::<Vec<_>>(),
            vec![DeviceFeature::ShaderFloat64]
        );
    }

    #[test]
    fn extra_device_features_are_ignored() {
        let supported: DeviceFeatures = DeviceFeature::ALL.iter().copied().collect();
        let required = DeviceFeatures::none().require(DeviceFeature::WideLines);
        assert!(validate_capabilities(&device(&[], supported), &[], &required).passed());
    }

    #[test]
    fn both_checks_are_reported() {
        let required = DeviceFeatures::none().require(DeviceFeature::GeometryShader);
        let check = validate_capabilities(
            &device(&[], DeviceFeatures::none()),
            &[cstr!("VK_KHR_swapchain")],
            &required,
        );
        assert_eq!(
            check,
            CapabilityCheck {
                extensions_ok: false,
                features_ok: false
            }
        );
    }
}
