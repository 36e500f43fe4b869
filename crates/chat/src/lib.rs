pub mod config;
pub mod controller;
pub mod ids;
pub mod message;
pub mod persistence;
pub mod session;
pub mod settings;
pub mod title;

#[cfg(test)]
mod testing;

pub use config::{AppConfig, ConfigError, ConfigResult, ConfigStore};
pub use controller::{
    CANCELLED_NOTICE, ChatController, ChatUpdate, DELETE_ALL_PROMPT, SendOutcome,
};
pub use ids::{IdGenerator, MessageId, SequentialIds, SessionId, UuidV7Ids};
pub use message::{Attachment, Message, Sender};
pub use persistence::{PersistenceError, PersistenceResult, SessionPersistence};
pub use session::{DEFAULT_SESSION_TITLE, Session, SessionStore};
pub use settings::{DEFAULT_SYSTEM_PROMPT, GenerationSettings, SettingsPatch, Temperature};
pub use title::{TITLE_PROMPT, TitleError, TitleResult, derive_title};
