//! # Warden
//!
//! Authentication, authorization and abuse mitigation for a multi-tenant
//! platform. A [`Ctx`] carries one request: who is logged in, from where,
//! what has been selected. It walks the command menu, checking each step
//! against the permission evaluator.
//!
//! ## Pieces
//!
//! - Passwords: SHA-512 crypt hashes, policy rules and a weak-password dictionary.
//! - Second factors: HOTP, TOTP and single-use codes.
//! - Tokens: ES512 signed, with an in-memory revocation cache backed by the
//!   database and swept by a worker.
//! - Rate limiting: failed logins per address, counted by a worker so the
//!   request path never waits on it.
//! - Entities: a reflective accessor turns [`accessor::Entity`] descriptors into
//!   `get`/`set` menus.
//!
//! ## Front doors
//!
//! `warden serve` exposes the menu over HTTP (`/api/<cmd>/<arg>..`),
//! `warden cli` talks to it and keeps the session token in a file, and
//! `warden cmd` runs the menu in-process against the database.

pub mod accessor;
pub mod api;
pub mod cli;
pub mod commands;
pub mod config;
pub mod context;
pub mod core;
pub mod db;
pub mod error;
pub mod hooks;
pub mod iptrk;
pub mod menu;
pub mod model;
pub mod otp;
pub mod password;
pub mod perms;
pub mod revocation;
pub mod system;
pub mod token;
pub mod worker;

pub use self::config::Config;
pub use self::context::Ctx;
pub use self::core::Core;
pub use self::error::{Error, ErrorKind, Result};
pub use self::hooks::{AppVerdict, Hooks, NoHooks};
pub use self::perms::Perm;

pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));
