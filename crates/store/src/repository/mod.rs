//! One repository per entity. Each method is atomic.

mod agents;
mod conversations;
mod frames;
mod messages;
mod skills;
mod tool_servers;
mod users;

pub use agents::{AgentRepository, NewAgent};
pub use conversations::ConversationRepository;
pub use frames::FrameRepository;
pub use messages::{MessageRepository, MessageSearch};
pub use skills::SkillRepository;
pub use tool_servers::ToolServerRepository;
pub use users::UserRepository;
