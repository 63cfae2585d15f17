pub mod color;
pub mod config;
pub mod dispatch;
pub mod layout;
pub mod stepper;
pub mod via;
pub mod watcher;

pub use color::{ColorSpec, NamedColor, ParseColorError, StepDirection};
pub use config::WatcherConfig;
pub use dispatch::{ColorApplier, DeviceParams, DispatchEngine, ViaApplier};
pub use layout::{CommandLayoutSource, LayoutSource};
pub use via::{ViaDevice, ViaError};
pub use watcher::LayoutWatcher;
