/// Change orchestration for kanban boards whose columns and tasks can be
/// transcluded from include files.
///
/// A [`DocumentSession`] opens one board file, loads its includes and routes
/// every change (file watcher, user edit, save, include switch) through the
/// [`ChangeStateMachine`].
pub mod config;
pub mod files;
pub mod include;
pub mod parser;
pub mod paths;
pub mod presentation;
pub mod session;
pub mod state_machine;
pub mod types;
pub mod undo;
pub mod watcher;

pub use config::EngineConfig;
pub use presentation::{ChannelSurface, PresentationSurface, SurfaceMessage};
pub use session::{DocumentSession, SessionError};
pub use state_machine::context::{ChangeError, ChangeResult};
pub use state_machine::events::ChangeEvent;
pub use state_machine::states::ChangeState;
pub use state_machine::ChangeStateMachine;
pub use types::{Board, Column, Task};
