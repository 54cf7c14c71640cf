//! URL template expansion for version-1 reference specs.
//!
//! A template set maps names to string values; values containing `{{` are
//! parametric. Two modes: a fast "simple" mode that only performs name
//! substitution, and a full engine (minijinja) for specs that use
//! expressions or conditionals. Full-mode renders are memoized by input
//! URL.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use indexmap::IndexMap;
use lru::LruCache;
use minijinja::Environment;

use crate::error::{RefError, Result};

/// Capacity of the full-mode render memo, in distinct input URLs.
const RENDER_MEMO_CAPACITY: usize = 1000;

/// A parsed template set with its expansion mode.
#[derive(Debug)]
pub struct Templates {
    vars: IndexMap<String, String>,
    simple: bool,
    env: Environment<'static>,
    memo: Mutex<LruCache<String, String>>,
}

impl Templates {
    /// Build a template set. `overrides`, if given, shadows entries of
    /// equal key.
    pub fn new(
        mut vars: IndexMap<String, String>,
        overrides: Option<&IndexMap<String, String>>,
        simple: bool,
    ) -> Self {
        if let Some(over) = overrides {
            for (k, v) in over {
                vars.insert(k.clone(), v.clone());
            }
        }
        Templates {
            vars,
            simple,
            env: Environment::new(),
            memo: Mutex::new(LruCache::new(
                NonZeroUsize::new(RENDER_MEMO_CAPACITY).unwrap_or(NonZeroUsize::MIN),
            )),
        }
    }

    /// An empty set (version-0 specs, or version-1 without templates).
    pub fn empty() -> Self {
        Templates::new(IndexMap::new(), None, true)
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Template values with any parametric entries rendered against the
    /// rest of the set. Used to derive a remote protocol.
    pub fn rendered_values(&self) -> Vec<String> {
        self.vars
            .values()
            .map(|v| {
                if v.contains("{{") {
                    self.env.render_str(v, &self.vars).unwrap_or_default()
                } else {
                    v.clone()
                }
            })
            .collect()
    }

    /// Expand `{{name}}` placeholders in a reference URL.
    ///
    /// Simple mode rewrites `{{` to `{` and `}}` to `}` and substitutes
    /// names positionally; it is only equivalent to the full engine when
    /// templates perform nothing beyond name substitution.
    pub fn expand_url(&self, url: &str) -> Result<String> {
        if self.vars.is_empty() || !url.contains("{{") {
            return Ok(url.to_string());
        }
        if self.simple {
            let rewritten = url.replace("{{", "{").replace("}}", "}");
            substitute(&rewritten, &self.vars)
        } else {
            if let Some(hit) = self.memo.lock().expect("render memo poisoned").get(url) {
                return Ok(hit.clone());
            }
            let rendered = self.env.render_str(url, &self.vars)?;
            self.memo
                .lock()
                .expect("render memo poisoned")
                .put(url.to_string(), rendered.clone());
            Ok(rendered)
        }
    }

    /// Render an arbitrary template with an extra binding, always through
    /// the full engine. Generator entries use this for `key`, `url`,
    /// `offset` and `length` regardless of the URL-expansion mode.
    pub fn render_with(
        &self,
        template: &str,
        binding: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<String> {
        let mut ctx = serde_json::Map::new();
        for (k, v) in &self.vars {
            ctx.insert(k.clone(), serde_json::Value::String(v.clone()));
        }
        for (k, v) in binding {
            ctx.insert(k.clone(), v.clone());
        }
        Ok(self.env.render_str(template, &ctx)?)
    }
}

/// Positional-name substitution over `{name}` placeholders. An unmatched
/// `{` is kept literal.
fn substitute(text: &str, vars: &IndexMap<String, String>) -> Result<String> {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(i) = rest.find('{') {
        out.push_str(&rest[..i]);
        let after = &rest[i + 1..];
        match after.find('}') {
            Some(j) => {
                let name = &after[..j];
                let value = vars.get(name).ok_or_else(|| {
                    RefError::BadSpec(format!("reference URL names unknown template '{name}'"))
                })?;
                out.push_str(value);
                rest = &after[j + 1..];
            }
            None => {
                out.push_str(&rest[i..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    Ok(out)
}

// -- Tests --------------------------------------------------------------------
