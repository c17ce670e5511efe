//! Application lifecycle.
//!
//! An [`App`] describes what it needs in [`App::configure`], then receives a
//! [`Context`] owning every Vulkan object created for it. [`AppHandler`]
//! drives the hooks in order; the frame loop itself belongs to the caller.
use crate::{
    capability::DeviceFeatures,
    device::{DeviceBuilder, DeviceCreationError, DeviceMetadata},
    instance::{
        DebugMessenger, DebugUtilsMessenger, InstanceBuilder, InstanceCreationError,
        InstanceMetadata, ValidationLayers,
    },
    queue::{QueueHandles, QueueRequest},
};
use ash::extensions::{ext::DebugUtils, khr::Surface};
use ash::prelude::VkResult;
use ash::{vk, Device, Entry, Instance, LoadingError};
use log::{debug, error, info};
#[cfg(feature = "surface")]
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};
use std::{ffi::CStr, ffi::NulError, os::raw::c_float};
use thiserror::Error;

/// Everything an application decides before the device exists.
#[derive(Debug, Clone)]
pub struct SetupParameters {
    /// Application name advertised to the driver.
    pub app_name: String,
    /// Enable the validation layers and a debug messenger. The layers are
    /// required, so instance creation fails without them.
    pub enable_validation: bool,
    /// Layers required in addition to the Khronos validation layer.
    /// Only used with `enable_validation`.
    pub validation_layers: Vec<&'static CStr>,
    /// Instance extensions to require.
    pub instance_extensions: Vec<&'static CStr>,
    /// Device extensions to require.
    pub device_extensions: Vec<&'static CStr>,
    /// Device features to require.
    pub device_features: DeviceFeatures,
    /// Queue groups to create, in order of precedence.
    pub desired_queues: Vec<QueueRequest>,
    /// Priority of every created queue.
    pub queue_priority: c_float,
    /// Requested instance API version as `(major, minor)`.
    pub api_version: (u32, u32),
}

impl Default for SetupParameters {
    fn default() -> Self {
        SetupParameters {
            app_name: String::new(),
            enable_validation: false,
            validation_layers: Vec::new(),
            instance_extensions: Vec::new(),
            device_extensions: Vec::new(),
            device_features: DeviceFeatures::none(),
            desired_queues: Vec::new(),
            queue_priority: 1.0,
            api_version: (1, 3),
        }
    }
}

impl SetupParameters {
    /// An instance builder configured from these parameters.
    pub fn instance_builder(&self) -> Result<InstanceBuilder<'static>, NulError> {
        let (major, minor) = self.api_version;
        let mut builder = InstanceBuilder::new()
            .app_name(&self.app_name)?
            .app_version(1, 0)
            .engine_name(env!("CARGO_PKG_NAME"))?
            .request_api_version(major, minor)
            .request_extension(DebugUtils::name());

        if self.enable_validation {
            builder = builder
                .validation_layers(ValidationLayers::Require)
                .request_debug_messenger(DebugMessenger::Default);
            for &layer in &self.validation_layers {
                builder = builder.require_layer(layer);
            }
        }

        for &extension in &self.instance_extensions {
            builder = builder.require_extension(extension);
        }

        Ok(builder)
    }

    /// A device builder configured from these parameters.
    pub fn device_builder(&self) -> DeviceBuilder<'static> {
        let mut builder = DeviceBuilder::new()
            .queue_requests(&self.desired_queues)
            .require_features(self.device_features)
            .queue_priority(self.queue_priority);

        for &extension in &self.device_extensions {
            builder = builder.require_extension(extension);
        }

        builder
    }
}

/// Errors that can occur while setting up a [`Context`].
#[derive(Debug, Error)]
pub enum ContextError {
    /// The Vulkan library could not be loaded.
    #[error("failed to load vulkan")]
    Loading(#[from] LoadingError),
    /// The application name contains a nul byte.
    #[error("invalid application name")]
    AppName(#[from] NulError),
    /// Instance creation failed.
    #[error(transparent)]
    Instance(#[from] InstanceCreationError),
    /// Surface creation failed.
    #[error("failed to create window surface: {0}")]
    Surface(vk::Result),
    /// Device selection or creation failed.
    #[error(transparent)]
    Device(#[from] DeviceCreationError),
}

struct SurfaceHandle {
    loader: Surface,
    handle: vk::SurfaceKHR,
}

/// Instance level objects, destroyed on drop.
struct InstanceContext {
    instance: Instance,
    instance_metadata: InstanceMetadata,
    debug_messenger: Option<DebugUtilsMessenger>,
    surface: Option<SurfaceHandle>,
    // Dropped last, after everything loaded from it is destroyed.
    entry: Entry,
}

impl Drop for InstanceContext {
    fn drop(&mut self) {
        unsafe {
            if let Some(surface) = self.surface.take() {
                debug!("destroying surface");
                surface.loader.destroy_surface(surface.handle, None);
            }

            if let Some(debug_messenger) = self.debug_messenger.take() {
                debug!("destroying debug messenger");
                debug_messenger.destroy(None);
            }

            debug!("destroying instance");
            self.instance.destroy_instance(None);
        }
    }
}

/// Every Vulkan object created for an application. Dropping it releases them
/// in reverse creation order: device, surface, debug messenger, instance.
pub struct Context {
    device: Device,
    device_metadata: DeviceMetadata,
    queues: QueueHandles,
    base: InstanceContext,
}

type SurfaceFn<'w> = dyn FnOnce(&Entry, &Instance) -> VkResult<vk::SurfaceKHR> + 'w;

impl Context {
    /// Set up instance and device without a window.
    pub unsafe fn new(params: &SetupParameters) -> Result<Context, ContextError> {
        let entry = Entry::load()?;
        Context::create(entry, params, params.instance_builder()?, None)
    }

    /// Set up instance, surface and device for `window`.
    /// `window` has to outlive the returned context.
    #[cfg(feature = "surface")]
    pub unsafe fn with_window<W>(
        params: &SetupParameters,
        window: &W,
    ) -> Result<Context, ContextError>
    where
        W: HasRawDisplayHandle + HasRawWindowHandle,
    {
        let entry = Entry::load()?;
        let instance_builder = params
            .instance_builder()?
            .require_surface_extensions(window)
            .map_err(InstanceCreationError::from)?;

        let create_surface = |entry: &Entry, instance: &Instance| {
            ash_window::create_surface(
                entry,
                instance,
                window.raw_display_handle(),
                window.raw_window_handle(),
                None,
            )
        };

        Context::create(entry, params, instance_builder, Some(Box::new(create_surface)))
    }

    unsafe fn create(
        entry: Entry,
        params: &SetupParameters,
        instance_builder: InstanceBuilder,
        create_surface: Option<Box<SurfaceFn>>,
    ) -> Result<Context, ContextError> {
        let (instance, debug_messenger, instance_metadata) = instance_builder.build(&entry)?;
        let mut base = InstanceContext {
            instance,
            instance_metadata,
            debug_messenger,
            surface: None,
            entry,
        };

        if let Some(create_surface) = create_surface {
            let handle =
                create_surface(&base.entry, &base.instance).map_err(ContextError::Surface)?;
            base.surface = Some(SurfaceHandle {
                loader: Surface::new(&base.entry, &base.instance),
                handle,
            });
        }

        let (device, device_metadata) = params.device_builder().build(&base.instance)?;
        let queues = device_metadata.queues(&device);
        info!(
            "retrieved {} queue(s) for {} request(s)",
            queues.len(),
            device_metadata.queue_plan().request_count()
        );

        Ok(Context {
            device,
            device_metadata,
            queues,
            base,
        })
    }

    /// The loaded Vulkan entry points.
    #[inline]
    pub fn entry(&self) -> &Entry {
        &self.base.entry
    }

    /// The instance.
    #[inline]
    pub fn instance(&self) -> &Instance {
        &self.base.instance
    }

    /// What is enabled in the instance.
    #[inline]
    pub fn instance_metadata(&self) -> &InstanceMetadata {
        &self.base.instance_metadata
    }

    /// The window surface, if the context was created with a window.
    #[inline]
    pub fn surface(&self) -> Option<vk::SurfaceKHR> {
        self.base.surface.as_ref().map(|surface| surface.handle)
    }

    /// The `VK_KHR_surface` loader, if the context was created with a window.
    #[inline]
    pub fn surface_loader(&self) -> Option<&Surface> {
        self.base.surface.as_ref().map(|surface| &surface.loader)
    }

    /// The logical device.
    #[inline]
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// The selected physical device and its queue plan.
    #[inline]
    pub fn device_metadata(&self) -> &DeviceMetadata {
        &self.device_metadata
    }

    /// The created queues, in the order they were requested.
    #[inline]
    pub fn queues(&self) -> &QueueHandles {
        &self.queues
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        unsafe {
            debug!("destroying device");
            self.device.destroy_device(None);
        }
    }
}

/// Lifecycle hooks of an application.
pub trait App {
    /// Describe what the application needs. Called once, before any Vulkan
    /// object exists.
    fn configure(&mut self, _params: &mut SetupParameters) {}

    /// Called once after the context has been created.
    fn init(&mut self, _context: &Context) {}

    /// Called once per frame.
    fn tick(&mut self, _context: &Context) {}

    /// Called once before the context is destroyed.
    fn destroy(&mut self, _context: &Context) {}

    /// Returning false ends the application after the current frame.
    fn keep_running(&self) -> bool {
        true
    }
}

/// Drives an [`App`] through its lifecycle.
pub struct AppHandler<A: App> {
    app: A,
    context: Option<Context>,
    running: bool,
}

impl<A: App> AppHandler<A> {
    /// Wrap `app`. Nothing is created until [`init_with`](Self::init_with).
    pub fn new(app: A) -> Self {
        AppHandler {
            app,
            context: None,
            running: false,
        }
    }

    /// Configure the app, create its context with `create` and initialise
    /// it. On failure the handler stops running.
    pub fn init_with<F>(&mut self, create: F) -> Result<(), ContextError>
    where
        F: FnOnce(&SetupParameters) -> Result<Context, ContextError>,
    {
        let mut params = SetupParameters::default();
        self.app.configure(&mut params);

        match create(&params) {
            Ok(context) => {
                self.app.init(&context);
                self.context = Some(context);
                self.running = true;
                Ok(())
            }
            Err(err) => {
                error!("{err}");
                self.running = false;
                Err(err)
            }
        }
    }

    /// Run one frame of the app.
    pub fn tick(&mut self) {
        if !self.running {
            return;
        }

        if let Some(context) = &self.context {
            self.app.tick(context);
        }
        self.running = self.app.keep_running();
    }

    /// Returns true while the app is initialised and wants to keep running.
    #[inline]
    pub fn keep_running(&self) -> bool {
        self.running
    }

    /// Stop running, e.g. because the window was closed.
    #[inline]
    pub fn stop(&mut self) {
        self.running = false;
    }

    /// The app.
    #[inline]
    pub fn app(&self) -> &A {
        &self.app
    }

    /// The context, once initialised.
    #[inline]
    pub fn context(&self) -> Option<&Context> {
        self.context.as_ref()
    }

    /// Call [`App::destroy`] and release the context. Does nothing if the app
    /// was never initialised or is already destroyed.
    pub fn destroy(&mut self) {
        self.running = false;
        if let Some(context) = self.context.take() {
            self.app.destroy(&context);
            drop(context);
        }
    }
}

impl<A: App> Drop for AppHandler<A> {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::DeviceFeature;
    use ash::extensions::khr::Swapchain;
    use std::{cell::RefCell, rc::Rc};

    #[derive(Default)]
    struct Recorder {
        calls: Vec<&'static str>,
    }

    impl App for Recorder {
        fn configure(&mut self, params: &mut SetupParameters) {
            self.calls.push("configure");
            params.app_name = "recorder".into();
            params.desired_queues.push(QueueRequest::graphics(1));
        }
    }

    #[test]
    fn failed_init_stops_the_handler() {
        let mut handler = AppHandler::new(Recorder::default());
        let mut seen = None;

        let result = handler.init_with(|params| {
            seen = Some((params.app_name.clone(), params.desired_queues.clone()));
            Err(ContextError::Surface(vk::Result::ERROR_INITIALIZATION_FAILED))
        });

        assert!(matches!(result, Err(ContextError::Surface(_))));
        assert!(!handler.keep_running());
        assert!(handler.context().is_none());
        assert_eq!(handler.app().calls, vec!["configure"]);
        assert_eq!(
            seen,
            Some(("recorder".to_owned(), vec![QueueRequest::graphics(1)]))
        );

        handler.tick();
        handler.destroy();
        assert_eq!(handler.app().calls, vec!["configure"]);
    }

    struct Lifecycle {
        calls: Rc<RefCell<Vec<&'static str>>>,
        frames: u32,
    }

    impl App for Lifecycle {
        fn configure(&mut self, params: &mut SetupParameters) {
            self.calls.borrow_mut().push("configure");
            params.app_name = "lifecycle".into();
            params.desired_queues.push(QueueRequest::graphics(1));
        }

        fn init(&mut self, context: &Context) {
            self.calls.borrow_mut().push("init");
            assert_eq!(context.queues().group(0).len(), 1);
            assert!(context.surface().is_none());
        }

        fn tick(&mut self, _context: &Context) {
            self.calls.borrow_mut().push("tick");
            self.frames += 1;
        }

        fn destroy(&mut self, _context: &Context) {
            self.calls.borrow_mut().push("destroy");
        }

        fn keep_running(&self) -> bool {
            self.frames < 2
        }
    }

    #[test]
    #[ignore = "requires a Vulkan loader"]
    fn lifecycle_runs_in_order() {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let mut handler = AppHandler::new(Lifecycle {
            calls: calls.clone(),
            frames: 0,
        });

        handler
            .init_with(|params| unsafe { Context::new(params) })
            .unwrap();
        assert!(handler.keep_running());
        assert!(handler.context().is_some());

        while handler.keep_running() {
            handler.tick();
        }
        assert_eq!(*calls.borrow(), vec!["configure", "init", "tick", "tick"]);

        drop(handler);
        assert_eq!(
            *calls.borrow(),
            vec!["configure", "init", "tick", "tick", "destroy"]
        );
    }

    #[test]
    fn device_builder_follows_parameters() {
        let params = SetupParameters {
            device_extensions: vec![Swapchain::name()],
            device_features: DeviceFeatures::none().require(DeviceFeature::GeometryShader),
            desired_queues: vec![
                QueueRequest::new(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE, 2),
                QueueRequest::transfer(1),
            ],
            ..Default::default()
        };

        let builder = params.device_builder();
        let requirements = builder.requirements();
        assert_eq!(requirements.extensions.as_slice(), &[Swapchain::name()]);
        assert!(requirements.features.contains(DeviceFeature::GeometryShader));
        assert_eq!(requirements.queue_requests.as_slice(), params.desired_queues.as_slice());
    }

    #[test]
    fn nul_in_app_name_is_rejected() {
        let params = SetupParameters {
            app_name: "bad\0name".into(),
            ..Default::default()
        };

        assert!(params.instance_builder().is_err());
    }
}
