pub mod channels;
pub mod daemon;
pub mod hot_reload;
pub mod locks;
pub mod registry;
pub mod scheduler;
pub mod session;

pub use channels::ChannelHub;
pub use daemon::{CommandOrigin, Daemon, DaemonEvent};
pub use hot_reload::{PhotonChange, PhotonWatcher};
pub use locks::LockManager;
pub use registry::InstanceRegistry;
pub use scheduler::Scheduler;
pub use session::Session;
