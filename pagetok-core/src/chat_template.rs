use std::path::Path;

use indexmap::IndexMap;
use minijinja::{context, value::Value as JinjaValue, Environment, ErrorKind};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    backend::RuntimeInfo, known_templates::remap_known_template, special_tokens::SpecialTokens,
    utils::json::read_json_file,
};

pub const CHAT_TEMPLATE_KEY: &str = "chat_template";
pub const SIMPLIFIED_CHAT_TEMPLATE_KEY: &str = "simplified_chat_template";

/// Checked in order; the first file carrying a template wins.
const CHAT_TEMPLATE_FILES: [&str; 3] = [
    "chat_template.json",
    "processor_config.json",
    "tokenizer_config.json",
];

/// Python string methods and slicing idioms minijinja does not evaluate, with
/// their minijinja spelling.
const TEMPLATE_PATCHES: [(&str, &str); 8] = [
    (".strip()", "|trim"),
    (".lstrip()", "|lstrip"),
    (".rstrip()", "|rstrip"),
    (".upper()", "|upper"),
    (".lower()", "|lower"),
    (".title()", "|title"),
    (".items()", "|items"),
    ("messages[1:]", "slice(messages, 1)"),
];

/// One chat turn. Rendering requires `role` and `content`; other keys are passed through.
pub type ChatMessage = IndexMap<String, String>;

#[derive(Error, Debug)]
pub enum ChatTemplateError {
    #[error(
        "No chat template is available. Set one with `set_chat_template` or pass a template to \
         `apply_chat_template`."
    )]
    Missing,
    #[error("Message {index} has no `{field}` field.")]
    MissingField { index: usize, field: &'static str },
    #[error(
        "Chat template could not be rendered: {0}\nPossible solutions:\n\
         * Provide a simplified chat template with `set_chat_template`.\n\
         * Skip the chat template and format the prompt manually, for example \
         `<|user|>\\n{{prompt}}</s>\\n<|assistant|>\\n`."
    )]
    Render(#[from] minijinja::Error),
    #[error(
        "Chat template rendered an empty prompt. The template is probably misconfigured; \
         provide a working one with `set_chat_template`."
    )]
    EmptyOutput,
}

/// Rewrite Python-isms in `template` into minijinja syntax.
pub fn patch_chat_template(template: &str) -> String {
    TEMPLATE_PATCHES
        .iter()
        .fold(template.to_string(), |acc, (from, to)| acc.replace(from, to))
}

/// Known incompatible templates are swapped wholesale, the rest are patched.
pub fn remap_and_patch(template: &str) -> String {
    match remap_known_template(template) {
        Some(fixed) => {
            debug!("Replacing a known incompatible chat template.");
            fixed.to_string()
        }
        None => patch_chat_template(template),
    }
}

/// A template given either as a string or as a list of `{name, template}` entries,
/// of which only the one named `default` is used.
fn template_from_value(value: &Value) -> Option<String> {
    let template = match value {
        Value::String(s) => Some(s.clone()),
        Value::Array(entries) => entries
            .iter()
            .find(|e| e.get("name").and_then(Value::as_str) == Some("default"))
            .and_then(|e| e.get("template"))
            .and_then(Value::as_str)
            .map(str::to_string),
        Value::Object(map) => map
            .get("default")
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    };
    template.filter(|t| !t.is_empty())
}

fn template_from_file(path: &Path) -> Option<String> {
    let config = read_json_file(path)?;
    let value = config.get(CHAT_TEMPLATE_KEY)?;
    let template = template_from_value(value);
    if template.is_none() && !value.is_null() {
        warn!(
            "Ignoring `{CHAT_TEMPLATE_KEY}` in `{}`: expected a string or a list with a `default` template.",
            path.display()
        );
    }
    template
}

/// Find the session's chat template.
///
/// Graph metadata takes precedence over config files. A known incompatible
/// template is replaced by its fixed version; otherwise a `simplified_chat_template`
/// from metadata is preferred, and the raw template is patched as a last resort.
pub fn resolve_chat_template(infos: &[&RuntimeInfo], dir: Option<&Path>) -> Option<String> {
    let raw = infos
        .iter()
        .find_map(|info| info.get(CHAT_TEMPLATE_KEY).and_then(template_from_value))
        .or_else(|| {
            let dir = dir?;
            CHAT_TEMPLATE_FILES
                .iter()
                .find_map(|file| template_from_file(&dir.join(file)))
        });

    if let Some(fixed) = raw.as_deref().and_then(remap_known_template) {
        return Some(fixed.to_string());
    }
    let simplified = infos.iter().find_map(|info| {
        info.get_str(SIMPLIFIED_CHAT_TEMPLATE_KEY)
            .filter(|t| !t.is_empty())
    });
    simplified
        .or(raw.as_deref())
        .map(patch_chat_template)
}

fn raise_exception(msg: String) -> Result<String, minijinja::Error> {
    Err(minijinja::Error::new(ErrorKind::InvalidOperation, msg))
}

/// `slice(items, start)`, the patched form of `items[start:]`.
fn slice(items: JinjaValue, start: usize) -> Result<JinjaValue, minijinja::Error> {
    Ok(JinjaValue::from(
        items.try_iter()?.skip(start).collect::<Vec<_>>(),
    ))
}

fn lstrip(s: String) -> String {
    s.trim_start().to_string()
}

fn rstrip(s: String) -> String {
    s.trim_end().to_string()
}

pub fn apply_chat_template_to(
    messages: &[ChatMessage],
    add_generation_prompt: bool,
    template: &str,
    special_tokens: &SpecialTokens,
) -> Result<String, ChatTemplateError> {
    for (index, message) in messages.iter().enumerate() {
        for field in ["role", "content"] {
            if !message.contains_key(field) {
                return Err(ChatTemplateError::MissingField { index, field });
            }
        }
    }

    let mut env = Environment::new();
    // https://github.com/huggingface/transformers/blob/76a33a10923ccc1074917f6b6a1e719e626b7dc9/src/transformers/tokenization_utils_base.py#L1842
    env.set_lstrip_blocks(true);
    env.set_trim_blocks(true);
    env.add_function("raise_exception", raise_exception);
    env.add_function("slice", slice);
    env.add_filter("lstrip", lstrip);
    env.add_filter("rstrip", rstrip);

    env.add_template("chat_template", template)?;
    let tmpl = env.get_template("chat_template")?;
    let token = |t: &Option<String>| t.clone().unwrap_or_default();
    let rendered = tmpl.render(context! {
        messages => messages,
        add_generation_prompt => add_generation_prompt,
        bos_token => token(&special_tokens.bos_token),
        eos_token => token(&special_tokens.eos_token),
        pad_token => token(&special_tokens.pad_token),
    })?;

    if rendered.is_empty() {
        return Err(ChatTemplateError::EmptyOutput);
    }
    Ok(rendered)
}
