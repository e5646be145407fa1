//! Chat surface: a transport-agnostic [`chat::ChatMedium`] contract, the
//! regex-dispatched command vocabulary in [`router`], and the LLM fallback
//! in [`llm_parser`] used both for free-text chat and the richer structured
//! command parser.

pub mod chat;
pub mod llm_parser;
pub mod router;

pub use chat::{ChatMedium, ChatNotifier, ChatThreadHistory};
pub use llm_parser::{ContextStore, LlmCommand, LlmFallback, ParseOutcome};
pub use router::ChatCommandRouter;
