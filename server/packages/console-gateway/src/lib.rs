//! Console gateway core: identity, sessions, rate limiting, streaming and the
//! file, chat and terminal capabilities behind the HTTP router.

pub mod chat;
pub mod cli;
pub mod config;
pub mod filesystem;
pub mod identity;
pub mod rate_limit;
pub mod router;
pub mod session;
pub mod stream;
pub mod terminal;
