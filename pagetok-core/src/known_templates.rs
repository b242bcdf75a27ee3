use once_cell::sync::Lazy;
use std::collections::HashMap;

/// Chat templates shipped by popular models that minijinja cannot evaluate,
/// mapped to hand-written equivalents that it can.
static KNOWN_CHAT_TEMPLATES: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    let mut templates = HashMap::new();

    // Reasoning models strip the `<think>` section from past assistant turns with `str.split`.
    templates.insert(
        include_str!("../chat_templates/reasoning_split.jinja").trim_end(),
        include_str!("../chat_templates/reasoning_split.fixed.jinja").trim_end(),
    );
    // Role matching through `str.startswith`.
    templates.insert(
        include_str!("../chat_templates/role_prefix.jinja").trim_end(),
        include_str!("../chat_templates/role_prefix.fixed.jinja").trim_end(),
    );

    templates
});

/// The replacement for `template`, if it is a known incompatible template.
pub fn remap_known_template(template: &str) -> Option<&'static str> {
    KNOWN_CHAT_TEMPLATES.get(template).copied()
}
