//! Per request state: who is calling, what they selected, where output goes.

mod auth;
mod client;
mod perms;

pub use client::{parse_remote, parse_user_agent, Client};

use std::{
    any::Any,
    fmt,
    io::Write,
    net::{IpAddr, Ipv6Addr},
    sync::Arc,
};

use axum::http::StatusCode;
use sqlx::{Postgres, Transaction};
use tokio::sync::watch;
use tracing::error;

use crate::{
    core::Core,
    menu::Entry,
    model::{GroupSelection, Principal},
    otp::Factor,
    token::Claims,
};

enum Sink {
    Buffer(String),
    Direct(Box<dyn Write + Send>),
}

/// Owned by exactly one request.
pub struct Ctx {
    core: Arc<Core>,

    user: Option<Principal>,
    token: Option<String>,
    claims: Option<Claims>,
    token_minted: bool,

    client_ip: Option<IpAddr>,
    remote: String,
    client: Client,
    language: String,

    sel_user: Option<Principal>,
    sel_group: Option<GroupSelection>,
    sel_ml: Option<String>,
    sel_email: Option<String>,
    sel_2fa: Option<Factor>,
    mod_opts: Option<Arc<dyn Any + Send + Sync>>,

    output: Sink,
    abort: Option<watch::Receiver<bool>>,
    status: StatusCode,
    return_code: i32,
    loc: Vec<String>,

    pub(crate) walk_only: bool,
    pub(crate) walked: Option<Entry>,
    pub(crate) tx: Option<Transaction<'static, Postgres>>,
    pub(crate) in_batch: bool,
}

impl fmt::Debug for Ctx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ctx")
            .field("user", &self.user.as_ref().map(Principal::username))
            .field("remote", &self.remote)
            .field("sel_user", &self.sel_user.as_ref().map(Principal::username))
            .field("sel_group", &self.sel_group.as_ref().map(|g| g.group.name()))
            .field("loc", &self.loc)
            .field("in_tx", &self.tx.is_some())
            .finish_non_exhaustive()
    }
}

impl Ctx {
    /// A fresh context with buffered output and no client details.
    #[must_use]
    pub fn new(core: Arc<Core>) -> Self {
        Self {
            core,
            user: None,
            token: None,
            claims: None,
            token_minted: false,
            client_ip: None,
            remote: String::new(),
            client: Client::default(),
            language: "en".to_string(),
            sel_user: None,
            sel_group: None,
            sel_ml: None,
            sel_email: None,
            sel_2fa: None,
            mod_opts: None,
            output: Sink::Buffer(String::new()),
            abort: None,
            status: StatusCode::OK,
            return_code: 0,
            loc: Vec::new(),
            walk_only: false,
            walked: None,
            tx: None,
            in_batch: false,
        }
    }

    /// A context for a local operator, treated as a loopback client.
    #[must_use]
    pub fn local(core: Arc<Core>) -> Self {
        let mut ctx = Self::new(core);
        ctx.set_client(&Ipv6Addr::LOCALHOST.to_string(), "");
        ctx
    }

    #[must_use]
    pub fn core(&self) -> &Core {
        &self.core
    }

    /// A handle on the core that does not borrow the context.
    #[must_use]
    pub fn core_arc(&self) -> Arc<Core> {
        Arc::clone(&self.core)
    }

    /// Records the remote address and user agent.
    pub fn set_client(&mut self, remote: &str, user_agent: &str) {
        self.remote = remote.to_string();
        self.client_ip = parse_remote(remote);
        let loopback = self.client_ip.is_some_and(|ip| ip.is_loopback());
        self.client = parse_user_agent(user_agent, loopback);
    }

    #[must_use]
    pub fn client_ip(&self) -> Option<IpAddr> {
        self.client_ip
    }

    #[must_use]
    pub fn remote(&self) -> &str {
        &self.remote
    }

    #[must_use]
    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn set_language(&mut self, language: &str) {
        self.language = language.to_string();
    }

    #[must_use]
    pub fn language(&self) -> &str {
        &self.language
    }

    #[must_use]
    pub fn user(&self) -> Option<&Principal> {
        self.user.as_ref()
    }

    #[must_use]
    pub fn is_logged_in(&self) -> bool {
        self.user.is_some()
    }

    #[must_use]
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    #[must_use]
    pub fn claims(&self) -> Option<&Claims> {
        self.claims.as_ref()
    }

    /// Whether [`Ctx::new_token`] ran during this request.
    #[must_use]
    pub fn token_minted(&self) -> bool {
        self.token_minted
    }

    #[must_use]
    pub fn sel_user(&self) -> Option<&Principal> {
        self.sel_user.as_ref()
    }

    #[must_use]
    pub fn sel_group(&self) -> Option<&GroupSelection> {
        self.sel_group.as_ref()
    }

    #[must_use]
    pub fn sel_2fa(&self) -> Option<&Factor> {
        self.sel_2fa.as_ref()
    }

    #[must_use]
    pub fn sel_ml(&self) -> Option<&str> {
        self.sel_ml.as_deref()
    }

    pub fn select_ml(&mut self, list: Option<String>) {
        self.sel_ml = list;
    }

    #[must_use]
    pub fn sel_email(&self) -> Option<&str> {
        self.sel_email.as_deref()
    }

    pub fn select_email(&mut self, email: Option<String>) {
        self.sel_email = email;
    }

    /// Options handed to pluggable sub-trees.
    pub fn set_mod_opts<T: Any + Send + Sync>(&mut self, opts: T) {
        self.mod_opts = Some(Arc::new(opts));
    }

    #[must_use]
    pub fn mod_opts<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.mod_opts.as_deref().and_then(|o| o.downcast_ref())
    }

    pub fn set_abort(&mut self, abort: watch::Receiver<bool>) {
        self.abort = Some(abort);
    }

    /// Long running operations poll this between I/O steps.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.abort.as_ref().is_some_and(|rx| *rx.borrow())
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    #[must_use]
    pub fn return_code(&self) -> i32 {
        self.return_code
    }

    pub fn set_return_code(&mut self, code: i32) {
        self.return_code = code;
    }

    /// Menu path walked so far, space separated.
    #[must_use]
    pub fn loc(&self) -> String {
        self.loc.join(" ")
    }

    pub fn push_loc(&mut self, name: &str) {
        self.loc.push(name.to_string());
    }

    pub fn reset_loc(&mut self) {
        self.loc.clear();
    }

    /// Sends output straight to `sink` instead of buffering it.
    pub fn set_direct(&mut self, sink: Box<dyn Write + Send>) {
        self.output = Sink::Direct(sink);
    }

    pub fn out(&mut self, text: impl AsRef<str>) {
        let text = text.as_ref();
        match &mut self.output {
            Sink::Buffer(buf) => buf.push_str(text),
            Sink::Direct(sink) => {
                if let Err(err) = sink.write_all(text.as_bytes()).and_then(|()| sink.flush()) {
                    error!("Output failed: {err}");
                }
            }
        }
    }

    pub fn outln(&mut self, text: impl AsRef<str>) {
        self.out(text);
        self.out("\n");
    }

    /// Takes the buffered output; empty in direct mode.
    pub fn buffered(&mut self) -> String {
        match &mut self.output {
            Sink::Buffer(buf) => std::mem::take(buf),
            Sink::Direct(_) => String::new(),
        }
    }
}

#[cfg(test)]
impl Ctx {
    /// Signs `user` in without touching the store.
    pub(crate) fn act_as(&mut self, user: Principal) {
        self.sel_user = Some(user.clone());
        self.user = Some(user);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::testing::offline_core;

    #[derive(Clone, Default)]
    struct Shared(Arc<std::sync::Mutex<Vec<u8>>>);

    impl Write for Shared {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn buffered_and_direct_output() {
        let mut ctx = Ctx::new(offline_core().await);
        ctx.out("a");
        ctx.outln("b");
        assert_eq!(ctx.buffered(), "ab\n");
        assert_eq!(ctx.buffered(), "");

        let shared = Shared::default();
        ctx.set_direct(Box::new(shared.clone()));
        ctx.outln("direct");
        assert_eq!(ctx.buffered(), "");
        assert_eq!(shared.0.lock().unwrap().as_slice(), b"direct\n");
    }

    #[tokio::test]
    async fn client_details() {
        let mut ctx = Ctx::new(offline_core().await);
        ctx.set_client("192.0.2.4:4444", "Mozilla/5.0 (Windows NT 10.0) Firefox/128.0");
        assert_eq!(ctx.client_ip(), Some("192.0.2.4".parse().unwrap()));
        assert_eq!(ctx.remote(), "192.0.2.4:4444");
        assert_eq!(ctx.client().browser, "Firefox");

        let local = Ctx::local(offline_core().await);
        assert!(local.client_ip().is_some_and(|ip| ip.is_loopback()));
        assert_eq!(local.client().browser, "cli");
    }

    #[tokio::test]
    async fn location_and_status() {
        let mut ctx = Ctx::new(offline_core().await);
        ctx.push_loc("system");
        ctx.push_loc("iptrk");
        assert_eq!(ctx.loc(), "system iptrk");
        ctx.reset_loc();
        assert_eq!(ctx.loc(), "");

        assert_eq!(ctx.status(), StatusCode::OK);
        ctx.set_status(StatusCode::UNAUTHORIZED);
        ctx.set_return_code(1);
        assert_eq!(ctx.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ctx.return_code(), 1);
    }

    #[tokio::test]
    async fn abort_and_module_options() {
        let mut ctx = Ctx::new(offline_core().await);
        assert!(!ctx.is_aborted());
        let (tx, rx) = watch::channel(false);
        ctx.set_abort(rx);
        tx.send(true).unwrap();
        assert!(ctx.is_aborted());

        ctx.set_mod_opts(String::from("/srv/files"));
        assert_eq!(ctx.mod_opts::<String>().map(String::as_str), Some("/srv/files"));
        assert!(ctx.mod_opts::<u32>().is_none());
    }
}
