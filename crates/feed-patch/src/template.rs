//! Literal `<NAME>` token substitution for page scripts.

use std::collections::BTreeMap;
use std::path::Path;

use crate::error::PatchError;

pub type TemplateParams = BTreeMap<String, String>;

/// Renders a script template. Kept behind a trait so the substitution rules
/// can change without touching the injector or the CLI.
pub trait TemplateEngine: Send + Sync {
    fn render(&self, template: &str, params: &TemplateParams) -> String;
}

/// Replaces every `<NAME>` whose name is present in the parameter map with the
/// parameter's text. Unknown tokens are left verbatim and substituted values
/// are never scanned again.
#[derive(Clone, Copy, Debug, Default)]
pub struct TokenTemplate;

impl TemplateEngine for TokenTemplate {
    fn render(&self, template: &str, params: &TemplateParams) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(open) = rest.find('<') {
            out.push_str(&rest[..open]);
            let candidate = &rest[open + 1..];
            let token = candidate
                .find('>')
                .map(|close| &candidate[..close])
                .filter(|name| !name.is_empty())
                .and_then(|name| params.get(name).map(|value| (name, value)));
            match token {
                Some((name, value)) => {
                    out.push_str(value);
                    rest = &candidate[name.len() + 1..];
                }
                None => {
                    out.push('<');
                    rest = candidate;
                }
            }
        }
        out.push_str(rest);
        out
    }
}

/// A script source paired with the engine that renders it.
#[derive(Clone, Debug)]
pub struct ScriptTemplate {
    source: String,
}

impl ScriptTemplate {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, PatchError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| PatchError::Template {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Self { source })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn render_with(&self, engine: &dyn TemplateEngine, params: &TemplateParams) -> String {
        engine.render(&self.source, params)
    }

    pub fn render(&self, params: &TemplateParams) -> String {
        self.render_with(&TokenTemplate, params)
    }
}

pub fn params<I, K, V>(pairs: I) -> TemplateParams
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}
