//! The fixed set of text substitutions applied to vendored artifacts.
//!
//! Each rule is a narrow contract with a known before/after. A rule that does
//! not match is reported as `None` so the caller can fail loudly instead of
//! silently running against drifted upstream text.
//!
//! Rules work on raw bytes; anything outside a match is written back untouched.

use std::sync::LazyLock;

use regex::bytes::Regex;

/// Hardcoded output prefix in the packet-level simulator's runtime config.
pub const NS3_CONFIG_PREFIX: &str = "/etc/astra-sim/simulation/";

/// Default flow capacity compiled into the m4 backend.
pub const DEFAULT_M4_FLOW_CAPACITY: u64 = 500_000;

/// Relative path of the m4 source file holding the flow capacity constant.
pub const M4_SOURCE_FILE: &str = "astra-sim-alibabacloud/astra-sim/network_frontend/m4/M4.cc";

static M4_FLOW_CAPACITY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(int32_t\s+M4::n_flows_max\s*=\s*)\d+(\s*;)").unwrap()
});

#[derive(Debug, Clone)]
pub enum Substitution {
    /// Replace every occurrence of `find`.
    Literal { find: String, replace: String },
    /// Replace every match of `regex`; `replace` may use `${n}` group references.
    Pattern { regex: &'static Regex, replace: String },
}

impl Substitution {
    pub fn literal(find: impl Into<String>, replace: impl Into<String>) -> Self {
        Substitution::Literal {
            find: find.into(),
            replace: replace.into(),
        }
    }

    /// Apply the rule. Returns `None` when the expected text is absent.
    pub fn apply(&self, bytes: &[u8]) -> Option<Vec<u8>> {
        match self {
            Substitution::Literal { find, replace } => {
                replace_all_literal(bytes, find.as_bytes(), replace.as_bytes())
            }
            Substitution::Pattern { regex, replace } => regex
                .is_match(bytes)
                .then(|| regex.replace_all(bytes, replace.as_bytes()).into_owned()),
        }
    }

    /// What the rule looks for, for error messages.
    pub fn expected(&self) -> String {
        match self {
            Substitution::Literal { find, .. } => find.clone(),
            Substitution::Pattern { regex, .. } => regex.as_str().to_string(),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Substitution::Literal { find, replace } => format!("`{find}` -> `{replace}`"),
            Substitution::Pattern { regex, replace } => format!("/{}/ -> `{replace}`", regex.as_str()),
        }
    }
}

fn replace_all_literal(haystack: &[u8], find: &[u8], replace: &[u8]) -> Option<Vec<u8>> {
    if find.is_empty() {
        return None;
    }
    let mut out = Vec::with_capacity(haystack.len());
    let mut rest = haystack;
    let mut found = false;
    while let Some(at) = rest.windows(find.len()).position(|w| w == find) {
        out.extend_from_slice(&rest[..at]);
        out.extend_from_slice(replace);
        rest = &rest[at + find.len()..];
        found = true;
    }
    out.extend_from_slice(rest);
    found.then_some(out)
}

/// Point the ns-3 runtime config's output paths at the working directory.
pub fn sandbox_config_paths() -> Substitution {
    Substitution::literal(NS3_CONFIG_PREFIX, "./")
}

/// Set `M4::n_flows_max` in the m4 source before compiling.
pub fn m4_flow_capacity(capacity: u64) -> Substitution {
    Substitution::Pattern {
        regex: &M4_FLOW_CAPACITY_RE,
        replace: format!("${{1}}{capacity}${{2}}"),
    }
}
