pub mod cli;
pub mod client;
pub mod command;
pub mod config;
pub mod notifier;
pub mod template;

pub use client::{BotIdentity, ChannelSet, MessageSender, RoamClient, SendError, SendErrorKind};
pub use notifier::{CallNotifier, ConfigError, Decorator, Notified, NotifierConfig};
pub use template::{Template, TemplateBindings, TemplateError};
