mod session_types;

pub use session_types::ActivityStatus;
pub use session_types::ExternalSession;
pub use session_types::SessionId;
pub use session_types::SessionInfo;
pub use session_types::SessionStatus;
pub use session_types::generate_session_id;
