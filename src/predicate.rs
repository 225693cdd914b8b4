//! jq-like boolean predicates evaluated against a label set.
//!
//! the original source embeds a jq dialect (`gojq`) for this exact role —
//! filtering assets by an arbitrary boolean expression over their label map.
//! `jaq` is the equivalent embeddable jq interpreter in the Rust ecosystem.

use std::collections::BTreeMap;

use jaq_interpret::{Ctx, FilterT, ParseCtx, RcIter, Val};

use crate::error::{Error, Result};

/// a compiled label predicate.
pub struct Predicate {
    filter: jaq_interpret::Filter,
}

impl Predicate {
    /// compile a jq boolean expression, e.g. `.os == "linux" and .arch == "amd64"`.
    pub fn compile(src: &str) -> Result<Self> {
        let (main, errs) = jaq_parse::parse(src, jaq_parse::main());
        if !errs.is_empty() {
            return Err(Error::Jq(
                errs.into_iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; "),
            ));
        }
        let main = main.ok_or_else(|| Error::Jq("empty predicate".to_string()))?;

        let mut ctx = ParseCtx::new(Vec::new());
        ctx.insert_natives(jaq_core::core());
        ctx.insert_defs(jaq_std::std());
        let filter = ctx.compile(main);
        if !ctx.errs.is_empty() {
            return Err(Error::Jq(
                ctx.errs.into_iter().map(|(e, _)| e.to_string()).collect::<Vec<_>>().join("; "),
            ));
        }
        Ok(Self { filter })
    }

    /// evaluate the predicate against a label set, presented as a
    /// string-keyed JSON document. truthy per jq semantics (anything but
    /// `false`/`null`) counts as a match; any evaluation error counts as a
    /// non-match rather than aborting the whole listing.
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        let doc: serde_json::Value = serde_json::Value::Object(
            labels.iter().map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone()))).collect(),
        );
        let val = Val::from(doc);
        let inputs = RcIter::new(core::iter::empty());
        let mut out = self.filter.run((Ctx::new([], &inputs), val));
        out.next().map(|r| r.map(|v| v.as_bool()).unwrap_or(false)).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn equality_predicate() {
        let p = Predicate::compile(r#".os == "linux""#).unwrap();
        assert!(p.matches(&labels(&[("os", "linux")])));
        assert!(!p.matches(&labels(&[("os", "darwin")])));
    }

    #[test]
    fn missing_key_is_non_match_not_error() {
        let p = Predicate::compile(r#".arch == "amd64""#).unwrap();
        assert!(!p.matches(&labels(&[("os", "linux")])));
    }

    #[test]
    fn compound_predicate() {
        let p = Predicate::compile(r#".os == "linux" and .arch == "amd64""#).unwrap();
        assert!(p.matches(&labels(&[("os", "linux"), ("arch", "amd64")])));
        assert!(!p.matches(&labels(&[("os", "linux"), ("arch", "arm64")])));
    }
}
