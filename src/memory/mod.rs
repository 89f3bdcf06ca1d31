//! 记忆层：模型消息、任务级工作记忆

pub mod conversation;
pub mod working;

pub use conversation::{last_user_content, Message, Role};
pub use working::{WorkingMemory, SEARCH_CACHE_KEY};
