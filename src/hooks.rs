//! Extension points for applications embedding the core.

use std::fmt;

use crate::{context::Ctx, menu::Menu, perms::Perm};

/// Outcome of the application permission hook.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AppVerdict {
    /// No opinion, evaluation continues.
    Continue,
    Allow,
    Deny(String),
}

/// Application callbacks. Every method has a no-op default.
pub trait Hooks: Send + Sync + fmt::Debug {
    /// Consulted last by [`Ctx::check_perms`] for bits the core did not grant.
    /// `Allow` and `Deny` are final.
    fn app_perms(&self, _ctx: &Ctx, _what: &str, _perms: Perm) -> AppVerdict {
        AppVerdict::Continue
    }

    /// Adjusts a menu before every dispatch through it.
    fn menu_override(&self, _ctx: &Ctx, _menu: &mut Menu) {}

    /// Runs after the context switched to a new principal.
    fn post_become(&self, _ctx: &mut Ctx) {}
}

/// The hooks of a bare core.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoHooks;

impl Hooks for NoHooks {}
