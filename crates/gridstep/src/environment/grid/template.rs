use std::collections::BTreeMap;

use crate::common::error::config_error;

pub type TemplateParams = BTreeMap<String, String>;

/// Substitutes `{name}` placeholders in `template` from `params`.
///
/// Pure textual substitution: `{{` and `}}` are literal braces, every
/// placeholder must have a parameter, unused parameters are fine. Value
/// validation is a backend concern, not done here.
pub fn fill_template(template: &str, params: &TemplateParams) -> crate::Result<String> {
    let mut result = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                result.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                result.push('}');
            }
            '{' => {
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(c) => name.push(c),
                        None => {
                            return config_error(format!(
                                "unterminated placeholder {{{name} in template"
                            ))
                        }
                    }
                }
                match params.get(&name) {
                    Some(value) => result.push_str(value),
                    None => {
                        return config_error(format!("missing template parameter: {name}"));
                    }
                }
            }
            '}' => {
                return config_error("unmatched '}' in template".into());
            }
            c => result.push(c),
        }
    }
    Ok(result)
}

pub fn params(pairs: &[(&str, String)]) -> TemplateParams {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}
