//! `Res`: the discriminated success-or-failure value used across the
//! framework.
//!
//! Domain outcomes (validation failures, auth refusals, not-found) are not
//! transport errors: they carry a state key that resolves to a numeric code
//! and a localized message at render time. `code == 0` means success. A code
//! of `-1` marks a state-only result whose numeric code is looked up from the
//! registered states when the response is produced.

use std::fmt;

use once_cell::sync::Lazy;

use crate::basic;
use crate::defs::Value;

/// Success (`code == 0`).
pub static OK: Lazy<Res> = Lazy::new(|| declare(0, "ok", "ok"));
/// Generic failure.
pub static FAIL: Lazy<Res> = Lazy::new(|| declare(1, "fail", "fail"));
/// Retry requested; degraded to failure outside retry-capable contexts.
pub static RETRY: Lazy<Res> = Lazy::new(|| declare(2, "retry", "retry"));
/// Invalid request or data.
pub static INVALID: Lazy<Res> = Lazy::new(|| declare(3, "invalid", "invalid request or data"));
/// Target not registered locally.
pub static NOTHING: Lazy<Res> = Lazy::new(|| declare(4, "nothing", "nothing here"));
/// Authentication or authorization refused.
pub static UNAUTHORIZED: Lazy<Res> = Lazy::new(|| declare(5, "unauthorized", "unauthorized"));

/// A state-keyed outcome with optional format arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct Res {
    code: i64,
    state: String,
    args: Vec<Value>,
}

impl Res {
    pub fn new(code: i64, state: impl Into<String>) -> Res {
        Res { code, state: state.into(), args: Vec::new() }
    }

    pub fn is_ok(&self) -> bool {
        self.code == 0
    }

    pub fn is_fail(&self) -> bool {
        !self.is_ok()
    }

    pub fn code(&self) -> i64 {
        self.code
    }

    /// The numeric code after resolving state-only results against the
    /// registered states.
    pub fn resolved_code(&self) -> i64 {
        if self.code == -1 {
            basic::state_code(&self.state, self.code)
        } else {
            self.code
        }
    }

    pub fn state(&self) -> &str {
        &self.state
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    /// A copy of this result carrying format arguments. Results are shared
    /// constants, so arguments never mutate the original.
    pub fn with(&self, args: Vec<Value>) -> Res {
        if args.is_empty() {
            self.clone()
        } else {
            Res { code: self.code, state: self.state.clone(), args }
        }
    }

    /// Localized message in the given language.
    pub fn text(&self, lang: &str) -> String {
        basic::string(lang, &self.state, &self.args)
    }
}

impl fmt::Display for Res {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.text(basic::DEFAULT))
    }
}

impl std::error::Error for Res {}

/// A state-only result; the code resolves from the state table at render
/// time. Used for the `_mapping_*` / `_auth_*` / `_item_*` family of keys.
pub fn state(state: impl Into<String>) -> Res {
    Res { code: -1, state: state.into(), args: Vec::new() }
}

/// [`state`] with format arguments.
pub fn state_with(key: impl Into<String>, args: Vec<Value>) -> Res {
    Res { code: -1, state: key.into(), args }
}

/// Wrap a transport error as a failed result; the message doubles as the
/// state key.
pub fn from_error(err: &dyn std::error::Error) -> Res {
    Res { code: -1, state: err.to_string(), args: Vec::new() }
}

/// Define a result: registers the state code and the default-language string,
/// then returns the result value for reuse.
pub fn declare(code: i64, state: &str, text: &str) -> Res {
    basic::register_state(state, code, true);
    basic::register_lang(basic::DEFAULT, state, text, true);
    Res::new(code, state)
}

/// Force evaluation of the builtin results so their states and strings are
/// registered before any module configures.
pub fn builtin() {
    for res in [&*OK, &*FAIL, &*RETRY, &*INVALID, &*NOTHING, &*UNAUTHORIZED] {
        let _ = res.code();
    }
    basic::register_lang(basic::DEFAULT, "_found", "not found", false);
    basic::register_lang(basic::DEFAULT, "_error", "internal error", false);
    basic::register_lang(basic::DEFAULT, "_failed", "request failed", false);
    basic::register_lang(basic::DEFAULT, "_denied", "access denied", false);
    basic::register_lang(basic::DEFAULT, "_mapping_empty", "missing value for %v", false);
    basic::register_lang(basic::DEFAULT, "_mapping_error", "invalid value for %v", false);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builtin_codes() {
        builtin();
        assert!(OK.is_ok());
        assert!(FAIL.is_fail());
        assert_eq!(UNAUTHORIZED.code(), 5);
        assert_eq!(RETRY.code(), 2);
    }

    #[test]
    fn with_leaves_original_untouched(){
        builtin();
        let failed = FAIL.with(vec![json!("x")]);
        assert_eq!(failed.args().len(), 1);
        assert!(FAIL.args().is_empty());
        assert_eq!(failed.code(), FAIL.code());
    }

    #[test]
    fn state_results_resolve_codes_lazily() {
        builtin();
        let res = state("unauthorized");
        assert_eq!(res.code(), -1);
        assert_eq!(res.resolved_code(), 5);
        assert!(res.is_fail());
    }
}
