//! Substitution view renderer.
//!
//! A deliberately small default driver: templates are plain files under the
//! view root (`<root>/<site>/<view>.html`, falling back to the shared
//! directory), and `{% name %}` tokens substitute dotted paths from the
//! render data or zero-argument helper calls.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use eyre::{eyre, Result};

use crate::defs::{self, Map, Value};
use crate::ports::view::{ViewConnect, ViewDriver};
use crate::view::{ViewBody, ViewConfig};

#[derive(Default)]
pub struct TextViewDriver;

impl TextViewDriver {
    pub fn new() -> TextViewDriver {
        TextViewDriver
    }
}

#[async_trait]
impl ViewDriver for TextViewDriver {
    async fn connect(&self, config: ViewConfig) -> Result<Arc<dyn ViewConnect>> {
        Ok(Arc::new(TextViewConnect { config }))
    }
}

struct TextViewConnect {
    config: ViewConfig,
}

#[async_trait]
impl ViewConnect for TextViewConnect {
    async fn open(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    async fn parse(&self, body: ViewBody) -> Result<String> {
        let template = self.load(&body.site, &body.view).await?;
        Ok(render(&template, &self.config.left, &self.config.right, &body))
    }
}

impl TextViewConnect {
    async fn load(&self, site: &str, view: &str) -> Result<String> {
        let mut candidates = Vec::new();
        if !site.is_empty() {
            candidates.push(PathBuf::from(&self.config.root).join(site).join(view));
        }
        candidates.push(PathBuf::from(&self.config.root).join(&self.config.shared).join(view));
        candidates.push(PathBuf::from(&self.config.root).join(view));

        for base in candidates {
            for candidate in [base.with_extension("html"), base.clone()] {
                if let Ok(text) = tokio::fs::read_to_string(&candidate).await {
                    return Ok(text);
                }
            }
        }
        Err(eyre!("view not found: {view}"))
    }
}

fn render(template: &str, left: &str, right: &str, body: &ViewBody) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find(left) {
        out.push_str(&rest[..start]);
        let after = &rest[start + left.len()..];
        let Some(end) = after.find(right) else {
            out.push_str(&rest[start..]);
            return out;
        };

        let token = after[..end].trim();
        out.push_str(&resolve(token, body));
        rest = &after[end + right.len()..];
    }
    out.push_str(rest);
    out
}

fn resolve(token: &str, body: &ViewBody) -> String {
    if let Some(value) = lookup(&body.data, token) {
        return defs::text_of(&value);
    }
    if let Some(value) = body.helpers.call(token, &[]) {
        return defs::text_of(&value);
    }
    String::new()
}

fn lookup(data: &Map, path: &str) -> Option<Value> {
    let mut current = Value::Object(data.clone());
    for segment in path.split('.') {
        current = current.get(segment)?.clone();
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map;
    use crate::view::Helpers;

    fn body(data: Map) -> ViewBody {
        let mut helpers = Helpers::new();
        helpers.insert("lang", Arc::new(|_| Value::String("default".into())));
        ViewBody {
            view: "page".into(),
            site: "www".into(),
            lang: "default".into(),
            zone_secs: None,
            data,
            helpers,
        }
    }

    #[test]
    fn tokens_substitute_paths_and_helpers() {
        let data = map! { "data" => { "title": "Home" } };
        let html = render(
            "<h1>{% data.title %}</h1><i>{% lang %}</i><s>{% missing %}</s>",
            "{%",
            "%}",
            &body(data),
        );
        assert_eq!(html, "<h1>Home</h1><i>default</i><s></s>");
    }

    #[tokio::test]
    async fn missing_templates_error() {
        let connect = TextViewConnect { config: ViewConfig::default() };
        assert!(connect.parse(body(Map::new())).await.is_err());
    }
}
