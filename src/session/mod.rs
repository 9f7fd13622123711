mod history;
mod manager;
#[allow(clippy::module_inception)]
mod session;

pub use history::HISTORY_CAP_BYTES;
pub use history::HistoryBuffer;
pub use history::StreamCursor;
pub use history::StreamRead;
pub use manager::DEFAULT_MAX_SESSIONS;
pub use manager::SessionError;
pub use manager::SessionManager;
pub use session::Session;
pub use session::SessionNotice;
