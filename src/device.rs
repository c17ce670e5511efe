//! Device selection and creation utils.
use crate::{
    capability::{validate_capabilities, CapabilityCheck, DeviceFeatures},
    queue::{match_queue_families, QueueFamily, QueueHandles, QueueMatch, QueuePlan, QueueRequest},
    BoilerSmallVec,
};
use ash::prelude::VkResult;
use ash::{vk, Device, Instance};
use log::{debug, info, warn};
use std::{
    collections::HashSet,
    error, fmt,
    ffi::{CStr, CString},
    os::raw::{c_char, c_float},
};
use thiserror::Error;

/// Score every suitable device starts with.
pub const BASE_SCORE: f32 = 1.0;
/// Added to the score of discrete GPUs.
pub const DISCRETE_BONUS: f32 = 3.0;

/// Snapshot of a physical device, queried once and never mutated.
#[derive(Debug, Clone)]
pub struct CandidateDevice {
    /// The physical device handle.
    pub physical_device: vk::PhysicalDevice,
    /// Name of the device.
    pub name: String,
    /// Type of the device.
    pub device_type: vk::PhysicalDeviceType,
    /// Highest API version the device supports.
    pub api_version: u32,
    /// Features the device supports.
    pub features: DeviceFeatures,
    /// Names of the extensions the device supports.
    pub extensions: HashSet<CString>,
    /// Queue families in the order the driver reports them.
    pub queue_families: Vec<QueueFamily>,
}

impl CandidateDevice {
    /// Query everything selection needs to know about `physical_device`.
    pub unsafe fn query(
        instance: &Instance,
        physical_device: vk::PhysicalDevice,
    ) -> VkResult<CandidateDevice> {
        let properties = instance.get_physical_device_properties(physical_device);
        let features = instance.get_physical_device_features(physical_device);
        let extensions = instance
            .enumerate_device_extension_properties(physical_device)?
            .iter()
            .map(|extension| CStr::from_ptr(extension.extension_name.as_ptr()).to_owned())
            .collect();
        let queue_families = QueueFamily::from_properties(
            &instance.get_physical_device_queue_family_properties(physical_device),
        );

        Ok(CandidateDevice {
            physical_device,
            name: CStr::from_ptr(properties.device_name.as_ptr())
                .to_string_lossy()
                .into_owned(),
            device_type: properties.device_type,
            api_version: properties.api_version,
            features: DeviceFeatures::from(&features),
            extensions,
            queue_families,
        })
    }

    /// Returns true if the device supports `extension`.
    #[inline]
    pub fn supports_extension(&self, extension: &CStr) -> bool {
        self.extensions.contains(extension)
    }

    /// Returns true if the device is a discrete GPU.
    #[inline]
    pub fn is_discrete(&self) -> bool {
        self.device_type == vk::PhysicalDeviceType::DISCRETE_GPU
    }
}

/// Score a device which passed validation and queue matching.
/// Higher is better.
pub fn score_device(
    device: &CandidateDevice,
    _check: &CapabilityCheck,
    _queues: &QueueMatch,
) -> f32 {
    let mut score = BASE_SCORE;
    if device.is_discrete() {
        score += DISCRETE_BONUS;
    }

    score
}

/// Why a device was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureReport {
    /// Name of the rejected device.
    pub device_name: String,
    /// A required extension is missing.
    pub extensions: bool,
    /// A required feature is missing.
    pub features: bool,
    /// The queue requests could not be satisfied.
    pub queues: bool,
}

impl fmt::Display for FailureReport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "GPU[{:?}] failed on:", self.device_name)?;
        if self.features {
            f.write_str(" [features]")?;
        }
        if self.extensions {
            f.write_str(" [extensions]")?;
        }
        if self.queues {
            f.write_str(" [queues]")?;
        }

        Ok(())
    }
}

/// No physical device met the requirements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoSuitableDeviceError {
    /// One report per rejected device, in enumeration order.
    pub reports: Vec<FailureReport>,
}

impl fmt::Display for NoSuitableDeviceError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("no physical device met the requirements")?;
        for report in &self.reports {
            write!(f, "\n\t- {report}")?;
        }
        if !self.reports.is_empty() {
            f.write_str("\nsee https://vulkan.gpuinfo.org for the capabilities of these devices")?;
        }

        Ok(())
    }
}

impl error::Error for NoSuitableDeviceError {}

/// A device picked by [`select_device`].
#[derive(Debug, Clone, Copy)]
pub struct DeviceSelection<'c> {
    /// Position of the device in the candidate list.
    pub index: usize,
    /// The picked device.
    pub device: &'c CandidateDevice,
    /// Its score.
    pub score: f32,
}

/// The picked device together with its queue plan.
#[derive(Debug, Clone)]
pub struct SelectionResult {
    /// The picked device.
    pub device: CandidateDevice,
    /// Its score.
    pub score: f32,
    /// Where the requested queues are created.
    pub plan: QueuePlan,
}

/// Everything a device has to provide.
#[derive(Debug, Clone, Default)]
pub struct DeviceRequirements<'a> {
    /// Extensions which must be supported. They will be enabled.
    pub extensions: BoilerSmallVec<&'a CStr>,
    /// Features which must be supported. They will be enabled.
    pub features: DeviceFeatures,
    /// Queues to create, in order.
    pub queue_requests: BoilerSmallVec<QueueRequest>,
}

impl<'a> DeviceRequirements<'a> {
    /// Required extensions in request order, each listed once.
    pub fn unique_extensions(&self) -> BoilerSmallVec<&'a CStr> {
        let mut unique = BoilerSmallVec::new();
        for &extension in &self.extensions {
            if !unique.contains(&extension) {
                unique.push(extension);
            }
        }
        unique
    }

    /// Pick the best device out of `candidates` and plan its queues.
    pub fn select(
        &self,
        mut candidates: Vec<CandidateDevice>,
    ) -> Result<SelectionResult, NoSuitableDeviceError> {
        let (index, score) = {
            let selection = select_device(&candidates, self)?;
            (selection.index, selection.score)
        };

        let device = candidates.swap_remove(index);
        match QueuePlan::new(&device.queue_families, &self.queue_requests) {
            Ok(plan) => Ok(SelectionResult {
                device,
                score,
                plan,
            }),
            Err(shortfall) => {
                warn!("{:?}: {shortfall}", device.name);
                Err(NoSuitableDeviceError {
                    reports: vec![FailureReport {
                        device_name: device.name,
                        extensions: false,
                        features: false,
                        queues: true,
                    }],
                })
            }
        }
    }
}

/// Validate, match and score every candidate in order, returning the one
/// with the highest score. On equal scores the earlier candidate wins.
pub fn select_device<'c>(
    candidates: &'c [CandidateDevice],
    requirements: &DeviceRequirements,
) -> Result<DeviceSelection<'c>, NoSuitableDeviceError> {
    let mut best: Option<DeviceSelection<'c>> = None;
    let mut highest_score = 0.0;
    let mut reports = Vec::new();

    for (index, device) in candidates.iter().enumerate() {
        let check = validate_capabilities(device, &requirements.extensions, &requirements.features);
        let queue_match =
            match_queue_families(&device.queue_families, &requirements.queue_requests);

        if !check.passed() || !queue_match.is_feasible() {
            if !check.features_ok {
                let missing: Vec<_> =
                    requirements.features.missing_from(&device.features).collect();
                debug!("{:?} lacks features {missing:?}", device.name);
            }
            if !queue_match.is_feasible() {
                debug!(
                    "{:?} is missing queues per request: {:?}",
                    device.name,
                    queue_match.remaining()
                );
            }

            reports.push(FailureReport {
                device_name: device.name.clone(),
                extensions: !check.extensions_ok,
                features: !check.features_ok,
                queues: !queue_match.is_feasible(),
            });
            continue;
        }

        let score = score_device(device, &check, &queue_match);
        debug!("{:?} is suitable with score {score}", device.name);
        if score > highest_score {
            highest_score = score;
            best = Some(DeviceSelection {
                index,
                device,
                score,
            });
        }
    }

    match best {
        Some(selection) => Ok(selection),
        None => {
            for report in &reports {
                warn!("{report}");
            }

            Err(NoSuitableDeviceError { reports })
        }
    }
}

/// Errors that can occur during device creation.
#[derive(Debug, Error)]
pub enum DeviceCreationError {
    /// Vulkan error while querying the physical devices.
    #[error("vulkan error")]
    VulkanError(#[from] vk::Result),
    /// No physical device met the requirements.
    #[error(transparent)]
    NoSuitableDevice(#[from] NoSuitableDeviceError),
    /// Creating the logical device failed.
    #[error("logical device creation failed: {0}")]
    CreateDevice(vk::Result),
}

/// Metadata for after device creation.
#[derive(Debug, Clone)]
pub struct DeviceMetadata {
    device_handle: vk::Device,
    selected: CandidateDevice,
    score: f32,
    plan: QueuePlan,
    enabled_extensions: BoilerSmallVec<CString>,
}

impl DeviceMetadata {
    /// The device this metadata belongs to.
    #[inline]
    pub fn device_handle(&self) -> vk::Device {
        self.device_handle
    }

    /// The physical device this device belongs to.
    #[inline]
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.selected.physical_device
    }

    /// Snapshot of the physical device taken during selection.
    #[inline]
    pub fn candidate(&self) -> &CandidateDevice {
        &self.selected
    }

    /// Name of the physical device.
    #[inline]
    pub fn device_name(&self) -> &str {
        &self.selected.name
    }

    /// Type of the physical device.
    #[inline]
    pub fn device_type(&self) -> vk::PhysicalDeviceType {
        self.selected.device_type
    }

    /// Score the physical device was selected with.
    #[inline]
    pub fn score(&self) -> f32 {
        self.score
    }

    /// The queue plan the device was created with.
    #[inline]
    pub fn queue_plan(&self) -> &QueuePlan {
        &self.plan
    }

    /// Fetch every planned queue from `device`.
    /// `device` must be the device this metadata belongs to.
    #[inline]
    pub unsafe fn queues(&self, device: &Device) -> QueueHandles {
        debug_assert_eq!(device.handle(), self.device_handle);
        self.plan.resolve(device)
    }

    /// List of all enabled extensions in the device.
    #[inline]
    pub fn enabled_extensions(&self) -> &[CString] {
        &self.enabled_extensions
    }

    /// Returns true if `extension` is enabled.
    #[inline]
    pub fn is_extension_enabled(&self, extension: &CStr) -> bool {
        self.enabled_extensions.iter().any(|e| e.as_c_str() == extension)
    }
}

type CreateDeviceFn<'a> = dyn FnMut(
        vk::PhysicalDevice,
        &vk::DeviceCreateInfo,
        Option<&vk::AllocationCallbacks>,
    ) -> VkResult<Device>
    + 'a;

/// Builder for a device loader.
#[derive(Default)]
pub struct DeviceLoaderBuilder<'a> {
    create_device_fn: Option<&'a mut CreateDeviceFn<'a>>,
    allocation_callbacks: Option<&'a vk::AllocationCallbacks>,
}

impl<'a> DeviceLoaderBuilder<'a> {
    /// Create a new device loader builder.
    pub fn new() -> Self {
        DeviceLoaderBuilder {
            create_device_fn: None,
            allocation_callbacks: None,
        }
    }

    /// Specify a custom device creation function, to use in place of the
    /// default.
    ///
    /// This may be useful when creating the device using e.g. OpenXR.
    pub fn create_device_fn(mut self, create_device: &'a mut CreateDeviceFn<'a>) -> Self {
        self.create_device_fn = Some(create_device);
        self
    }

    /// Specify custom allocation callback functions.
    pub fn allocation_callbacks(mut self, allocator: &'a vk::AllocationCallbacks) -> Self {
        self.allocation_callbacks = Some(allocator);
        self
    }

    /// Create the device.
    pub unsafe fn build(
        self,
        instance: &Instance,
        physical_device: vk::PhysicalDevice,
        create_info: &vk::DeviceCreateInfo,
    ) -> VkResult<Device> {
        match self.create_device_fn {
            Some(create_device) => {
                create_device(physical_device, create_info, self.allocation_callbacks)
            }
            None => instance.create_device(physical_device, create_info, self.allocation_callbacks),
        }
    }
}

/// Selects a physical device and creates a [`Device`] with the requested
/// queues.
pub struct DeviceBuilder<'a> {
    loader_builder: DeviceLoaderBuilder<'a>,
    requirements: DeviceRequirements<'a>,
    queue_priority: c_float,
}

impl<'a> DeviceBuilder<'a> {
    /// Create a new device builder.
    #[inline]
    pub fn new() -> Self {
        DeviceBuilder::with_loader_builder(DeviceLoaderBuilder::new())
    }

    /// Create a new device builder with a custom [`DeviceLoaderBuilder`].
    pub fn with_loader_builder(loader_builder: DeviceLoaderBuilder<'a>) -> Self {
        DeviceBuilder {
            loader_builder,
            requirements: DeviceRequirements::default(),
            queue_priority: 1.0,
        }
    }

    /// Request a group of queues. Requests are served in the order they
    /// were added, which matters when they compete for a queue family.
    #[inline]
    pub fn queue_request(mut self, request: QueueRequest) -> Self {
        self.requirements.queue_requests.push(request);
        self
    }

    /// Request several groups of queues, in order.
    #[inline]
    pub fn queue_requests(mut self, requests: &[QueueRequest]) -> Self {
        self.requirements.queue_requests.extend_from_slice(requests);
        self
    }

    /// Require a device which supports `extension`.
    /// The extension will be enabled.
    #[inline]
    pub fn require_extension(mut self, extension: &'a CStr) -> Self {
        if !self.requirements.extensions.contains(&extension) {
            self.requirements.extensions.push(extension);
        }
        self
    }

    /// Require these features to be present for the device.
    /// The features will be enabled.
    #[inline]
    pub fn require_features(mut self, features: DeviceFeatures) -> Self {
        self.requirements.features = features;
        self
    }

    /// Priority given to every created queue. Defaults to `1.0`.
    #[inline]
    pub fn queue_priority(mut self, priority: c_float) -> Self {
        self.queue_priority = priority;
        self
    }

    /// The requirements collected so far.
    #[inline]
    pub fn requirements(&self) -> &DeviceRequirements<'a> {
        &self.requirements
    }

    /// Returns the [`Device`] and [`DeviceMetadata`], containing the selected
    /// physical device, its queue plan and the enabled device extensions.
    pub unsafe fn build(
        self,
        instance: &Instance,
    ) -> Result<(Device, DeviceMetadata), DeviceCreationError> {
        let candidates = instance
            .enumerate_physical_devices()?
            .into_iter()
            .map(|physical_device| CandidateDevice::query(instance, physical_device))
            .collect::<VkResult<Vec<_>>>()?;

        let selection = self.requirements.select(candidates)?;
        info!("GPU: {} (score {})", selection.device.name, selection.score);

        let plan = selection.plan;
        for request in plan.creation_requests() {
            info!(
                "creating {} queue(s) from family {}",
                request.queue_count, request.family_index
            );
        }

        let priorities = plan.uniform_priorities(self.queue_priority);
        let queue_create_infos = plan.queue_create_infos(&priorities);
        let extensions = self.requirements.unique_extensions();
        let extension_names: BoilerSmallVec<*const c_char> =
            extensions.iter().map(|extension| extension.as_ptr()).collect();
        let features = self.requirements.features.to_vulkan();
        let device_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extension_names)
            .enabled_features(&features);

        let device = self
            .loader_builder
            .build(instance, selection.device.physical_device, &device_info)
            .map_err(DeviceCreationError::CreateDevice)?;

        let device_metadata = DeviceMetadata {
            device_handle: device.handle(),
            selected: selection.device,
            score: selection.score,
            plan,
            enabled_extensions: extensions
                .iter()
                .map(|&extension| extension.to_owned())
                .collect(),
        };

        Ok((device, device_metadata))
    }
}

impl<'a> Default for DeviceBuilder<'a> {
    fn default() -> Self {
        Self::new()
    }
}
