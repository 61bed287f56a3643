mod capability;
mod gemini;
mod http;
mod local;
mod normalize;
mod openai_compat;
mod prompt;
mod registry;
#[cfg(test)]
mod test_support;

pub use capability::{SYSTEM_WARNING_SOURCE, check_attachment};
pub use gemini::CloudSessionProvider;
pub use local::{
    LocalChatRequest, LocalEngine, LocalEngineProvider, LocalRuntime, LocalTurn, OllamaRuntime,
    ProgressSink,
};
pub use normalize::{FallbackProfile, PARSE_FAILURE_CONTEXT, normalize, strip_fences};
pub use openai_compat::CloudStatelessProvider;
pub use prompt::{SYSTEM_PROMPT, compose_user_text};
pub use registry::ProviderRegistry;
