use ash::extensions::khr::Swapchain;
use ash::vk;
use ash_boiler::{App, AppHandler, Context, QueueRequest, SetupParameters};
use winit::{
    dpi::LogicalSize,
    event::{Event, KeyboardInput, StartCause, VirtualKeyCode, WindowEvent},
    event_loop::{ControlFlow, EventLoop},
    window::WindowBuilder,
};

#[derive(Default)]
struct QueuesApp {
    queues: Vec<vk::Queue>,
}

impl App for QueuesApp {
    fn configure(&mut self, params: &mut SetupParameters) {
        params.app_name = "ash-boiler".into();
        params.enable_validation = true;
        params.device_extensions.push(Swapchain::name());
        params.desired_queues.push(QueueRequest::new(
            vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE,
            2,
        ));
    }

    fn init(&mut self, context: &Context) {
        self.queues = context.queues().group(0).to_vec();
        log::info!(
            "{} has {} queue(s): {:?}",
            context.device_metadata().device_name(),
            self.queues.len(),
            self.queues
        );
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let event_loop = EventLoop::new();
    let window = WindowBuilder::new()
        .with_title("ash-boiler")
        .with_inner_size(LogicalSize::new(1280.0, 720.0))
        .with_resizable(false)
        .build(&event_loop)
        .unwrap();

    let mut handler = AppHandler::new(QueuesApp::default());
    if handler
        .init_with(|params| unsafe { Context::with_window(params, &window) })
        .is_err()
    {
        return;
    }

    event_loop.run(move |event, _, control_flow| match event {
        Event::NewEvents(StartCause::Init) => *control_flow = ControlFlow::Poll,
        Event::MainEventsCleared => {
            handler.tick();
            if !handler.keep_running() {
                handler.destroy();
                *control_flow = ControlFlow::Exit;
            }
        }
        Event::WindowEvent {
            event:
                WindowEvent::CloseRequested
                | WindowEvent::KeyboardInput {
                    input:
                        KeyboardInput {
                            virtual_keycode: Some(VirtualKeyCode::Escape),
                            ..
                        },
                    ..
                },
            ..
        } => handler.stop(),
        _ => (),
    });
}
