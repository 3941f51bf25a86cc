//! Per-execution context shared by engine calls and HTTP requests.
//!
//! A context is owned by exactly one logical thread of work for its whole
//! lifetime. It carries the caller's identity (token, verification), the
//! localization pair (language, zone), the current method frame
//! (name/setting/value/args), the trailing result, and the temp files to
//! delete when the work terminates.

use std::path::PathBuf;

use eyre::Result;

use crate::basic::{self, MapCtx};
use crate::codec;
use crate::defs::{Map, Value};
use crate::engine;
use crate::result::Res;
use crate::store::{mutex, MUTEX};
use crate::token::Token;

pub struct Context {
    /// Trace id threaded through logs and downstream calls.
    pub trace: String,

    pub lang: String,
    /// Zone offset in seconds east of UTC; `None` renders in local time.
    pub zone_secs: Option<i32>,

    pub token: String,
    pub verify: Option<Token>,

    // current method frame
    pub name: String,
    pub setting: Map,
    pub value: Map,
    pub args: Map,

    result: Option<Res>,
    tempfiles: Vec<PathBuf>,
}

impl Context {
    pub fn new() -> Context {
        Context {
            trace: codec::generate(""),
            lang: basic::DEFAULT.to_string(),
            zone_secs: None,
            token: String::new(),
            verify: None,
            name: String::new(),
            setting: Map::new(),
            value: Map::new(),
            args: Map::new(),
            result: None,
            tempfiles: Vec::new(),
        }
    }

    pub fn map_ctx(&self) -> MapCtx {
        MapCtx { lang: self.lang.clone(), zone_secs: self.zone_secs }
    }

    /// Localized string lookup in this context's language.
    pub fn string(&self, key: &str, args: &[Value]) -> String {
        basic::string(&self.lang, key, args)
    }

    /// Record a result.
    pub fn set_result(&mut self, res: Res) {
        self.result = Some(res);
    }

    /// Take the trailing result, leaving OK behind.
    pub fn take_result(&mut self) -> Res {
        self.result.take().unwrap_or_else(|| crate::result::OK.clone())
    }

    pub fn last_result(&self) -> Option<&Res> {
        self.result.as_ref()
    }

    /// Identity carried by the verified token.
    pub fn act_id(&self) -> String {
        self.verify
            .as_ref()
            .map(|t| t.header.id.clone())
            .unwrap_or_default()
    }

    /// Whether a valid token accompanied the request.
    pub fn tokenized(&self) -> bool {
        self.verify.is_some()
    }

    /// Whether the verified token is authenticated.
    pub fn authorized(&self) -> bool {
        self.verify
            .as_ref()
            .map(|t| t.header.auth)
            .unwrap_or(false)
    }

    pub fn payload(&self) -> Option<&Map> {
        self.verify.as_ref().map(|t| &t.payload)
    }

    // engine sugar

    pub async fn invoke(&mut self, name: &str, value: Map) -> Option<Map> {
        let (item, res) = engine::invoke(self, name, value, None).await;
        self.result = Some(res);
        item
    }

    pub async fn invokes(&mut self, name: &str, value: Map) -> Vec<Map> {
        let (items, res) = engine::invokes(self, name, value, None).await;
        self.result = Some(res);
        items
    }

    pub async fn invoked(&mut self, name: &str, value: Map) -> bool {
        let (ok, res) = engine::invoked(self, name, value, None).await;
        self.result = Some(res);
        ok
    }

    pub async fn invoking(&mut self, name: &str, offset: i64, limit: i64, value: Map) -> (i64, Vec<Map>) {
        let (count, items, res) = engine::invoking(self, name, offset, limit, value, None).await;
        self.result = Some(res);
        (count, items)
    }

    pub async fn invoker(&mut self, name: &str, value: Map) -> (Option<Map>, Vec<Map>) {
        let (item, items, res) = engine::invoker(self, name, value, None).await;
        self.result = Some(res);
        (item, items)
    }

    pub async fn invokee(&mut self, name: &str, value: Map) -> f64 {
        let (count, res) = engine::invokee(self, name, value, None).await;
        self.result = Some(res);
        count
    }

    pub fn logic(&self, name: &str, setting: Map) -> engine::Logic {
        engine::Logic::new(name, setting)
    }

    // mutex sugar

    pub async fn lock(&self, key: &str, expiry: Option<std::time::Duration>) -> Result<()> {
        MUTEX.lock(key, expiry).await
    }

    pub async fn unlock(&self, key: &str) -> Result<()> {
        MUTEX.unlock(key).await
    }

    pub async fn locked(&self, key: &str, expiry: Option<std::time::Duration>) -> bool {
        mutex::locked(key, expiry).await
    }

    /// Create a temp file that lives until this context terminates.
    pub fn temp_file(&mut self, suffix: &str) -> Result<(std::fs::File, PathBuf)> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("up_");
        let dotted_suffix = format!(".{suffix}");
        if !suffix.is_empty() {
            builder.suffix(&dotted_suffix);
        }
        let (file, path) = builder.tempfile()?.keep()?;
        self.tempfiles.push(path.clone());
        Ok((file, path))
    }

    /// End-of-life cleanup: remove every temp file recorded on this context.
    pub fn terminal(&mut self) {
        for path in self.tempfiles.drain(..) {
            let _ = std::fs::remove_file(path);
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::TokenHeader;

    #[test]
    fn token_probes() {
        crate::result::builtin();
        let mut ctx = Context::new();
        assert!(!ctx.tokenized());
        assert!(!ctx.authorized());
        assert_eq!(ctx.act_id(), "");

        ctx.verify = Some(Token {
            header: TokenHeader { id: "act-9".into(), auth: true, ..TokenHeader::default() },
            payload: Map::new(),
        });
        assert!(ctx.tokenized());
        assert!(ctx.authorized());
        assert_eq!(ctx.act_id(), "act-9");
    }

    #[test]
    fn temp_files_removed_at_terminal() {
        crate::result::builtin();
        let mut ctx = Context::new();
        let (_, path) = ctx.temp_file("bin").unwrap();
        assert!(path.exists());
        ctx.terminal();
        assert!(!path.exists());
    }

    #[test]
    fn take_result_resets_to_ok() {
        crate::result::builtin();
        let mut ctx = Context::new();
        ctx.set_result(crate::result::FAIL.clone());
        assert!(ctx.take_result().is_fail());
        assert!(ctx.take_result().is_ok());
    }
}
