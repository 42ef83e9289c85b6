//! Concrete device, inference, relay and display tasks.

pub mod cortex_relay;
pub mod display_sink;
pub mod hardware_info;
pub mod model_management;
pub mod system_command;
pub mod think;

pub use cortex_relay::CortexRelayTask;
pub use display_sink::{DisplayFrame, DisplaySink, DisplaySinkTask, StreamOptions, TracingDisplay};
pub use hardware_info::{HardwareInfoTask, HARDWARE_INFO_TASK};
pub use model_management::{ModelManagementTask, MODEL_MANAGEMENT_TASK};
pub use system_command::SystemCommandTask;
pub use think::ThinkTask;
