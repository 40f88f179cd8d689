//! Copilot endpoint defaults
//!
//! These identify public endpoints and the editor the proxy presents itself
//! as. None of them are secrets; refresh credentials come from configuration.

/// Token endpoint exchanging a GitHub OAuth token for a Copilot bearer
pub const TOKEN_ENDPOINT: &str = "https://api.github.com/copilot_internal/v2/token";

/// Default chat completions endpoint when the bearer advertises none
pub const CHAT_COMPLETIONS_ENDPOINT: &str =
    "https://api.individual.githubcopilot.com/chat/completions";

/// Default models endpoint when the bearer advertises none
pub const MODELS_ENDPOINT: &str = "https://api.individual.githubcopilot.com/models";

/// Editor identity sent as `editor-version` on every upstream call
pub const DEFAULT_EDITOR_VERSION: &str = "vscode/1.97.2";

/// Header carrying the editor identity
pub const EDITOR_VERSION_HEADER: &str = "editor-version";
