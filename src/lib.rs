#![allow(clippy::missing_safety_doc)]
#![warn(missing_docs)]
/*!
Vulkan application boilerplate for Rust, built on [`ash`].

- ✅ Instance creation with layer and extension checks
- ✅ Physical device selection with per-device diagnostics
- ✅ Queue planning: requested queue groups packed onto queue families
- ✅ Device creation and queue retrieval
- ✅ Application lifecycle (`configure`, `init`, `tick`, `destroy`)

## Cargo Features

- `surface` (enabled by default): Enables the use of [`raw-window-handle`].

## Example

```rust,ignore
let entry = unsafe { ash::Entry::load() }.unwrap();
let (instance, _messenger, _instance_metadata) = unsafe {
    InstanceBuilder::new()
        .validation_layers(ValidationLayers::Request)
        .request_debug_messenger(DebugMessenger::Default)
        .build(&entry)
}
.unwrap();

let (device, device_metadata) = unsafe {
    DeviceBuilder::new()
        .queue_request(QueueRequest::new(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE, 2))
        .require_extension(ash::extensions::khr::Swapchain::name())
        .build(&instance)
}
.unwrap();

let queues = unsafe { device_metadata.queues(&device) };
let graphics = queues.group(0);
```

The queue plan is a first-fit greedy packing: queue families are visited in
the order the driver reports them, and within each family the requests are
served in the order they were added. The result is deterministic, but a
request listed early may exhaust a family that a later request needed.

## Licensing

This project is licensed under the zlib License.

[`raw-window-handle`]: https://crates.io/crates/raw-window-handle
*/

pub mod app;
pub mod capability;
pub mod device;
pub mod instance;
pub mod queue;

pub use app::*;
pub use capability::*;
pub use device::*;
pub use instance::*;
pub use queue::*;

type BoilerSmallVec<T> = smallvec::SmallVec<[T; 8]>;
