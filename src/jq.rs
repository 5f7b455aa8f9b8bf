//! Provides a wrapper around jaq to derive job parameters from storage
//! events with jq filters.

use anyhow::{anyhow, Result};
use itertools::Itertools;
pub use jaq_interpret::Filter;
use jaq_interpret::{Ctx, FilterT, ParseCtx, RcIter, Val};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::warn;

/// Compile a filter.
pub fn compile(filter: &str) -> Result<Filter> {
    let mut defs = ParseCtx::new(Vec::new());
    defs.insert_natives(jaq_core::core());
    defs.insert_defs(jaq_std::std());
    let (f, errs) = jaq_parse::parse(filter, jaq_parse::main());
    if !errs.is_empty() {
        return Err(anyhow!(errs.into_iter().join("; ")));
    }
    let f = f.ok_or_else(|| anyhow!("empty filter"))?;
    let f = defs.compile(f);
    if !defs.errs.is_empty() {
        return Err(anyhow!(defs.errs.into_iter().map(|(e, _)| e).join("; ")));
    }
    Ok(f)
}

/// Execute a compiled filter against an input, and produce the first
/// serde_json value.
fn first_result(filter: &Filter, input: Value) -> Option<Result<Value>> {
    let inputs = RcIter::new(core::iter::empty());
    let mut outputs = filter
        .run((Ctx::new([], &inputs), Val::from(input)))
        .map(|r| r.map(Value::from).map_err(|e| anyhow!(e.to_string())));
    let first_result = outputs.next();
    if outputs.next().is_some() {
        warn!("Filter returned more than one result; subsequent results are ignored");
    }
    first_result
}

/// Execute a compiled filter against an input, and interpret the
/// result as a set of string parameters. The filter must produce an
/// object, or null for no parameters. Null entries are skipped, and
/// non-string entries are rendered as JSON.
pub fn parameters(filter: &Filter, input: Value) -> Result<BTreeMap<String, String>> {
    let result = match first_result(filter, input) {
        None => return Ok(BTreeMap::new()),
        Some(result) => result?,
    };
    match result {
        Value::Null => Ok(BTreeMap::new()),
        Value::Object(entries) => Ok(entries
            .into_iter()
            .filter_map(|(name, value)| match value {
                Value::Null => None,
                Value::String(s) => Some((name, s)),
                other => Some((name, other.to_string())),
            })
            .collect()),
        other => Err(anyhow!(
            "Filter must produce an object, but it produced {}",
            other
        )),
    }
}
