use chatgate_protocol::gemini::models::ModelInfo;

/// Public model name -> upstream model identifier.
///
/// Unknown names pass through unchanged so new upstream models work
/// without a release.
const MODEL_ALIASES: &[(&str, &str)] = &[
    ("gemini-2.0-flash-exp", "assist-flash"),
    ("gemini-2.0-flash", "assist-flash"),
    ("gemini-2.5-flash", "assist-flash"),
    ("gemini-2.5-pro", "assist-pro"),
];

#[derive(Debug, Default)]
pub struct ModelTable;

impl ModelTable {
    pub fn new() -> Self {
        Self
    }

    /// Strip the optional `models/` prefix and resolve through the alias
    /// table.
    pub fn upstream_id<'a>(&self, public_name: &'a str) -> &'a str {
        let name = public_name.strip_prefix("models/").unwrap_or(public_name);
        MODEL_ALIASES
            .iter()
            .find(|(public, _)| *public == name)
            .map(|(_, upstream)| *upstream)
            .unwrap_or(name)
    }

    /// Display name as reported back to callers.
    pub fn public_name<'a>(&self, path_name: &'a str) -> &'a str {
        path_name.strip_prefix("models/").unwrap_or(path_name)
    }

    pub fn known_models(&self) -> Vec<ModelInfo> {
        MODEL_ALIASES
            .iter()
            .map(|(public, _)| ModelInfo {
                name: format!("models/{public}"),
                display_name: public.to_string(),
                supported_generation_methods: vec![
                    "generateContent".to_string(),
                    "streamGenerateContent".to_string(),
                ],
                input_token_limit: Some(1_048_576),
                output_token_limit: Some(8_192),
            })
            .collect()
    }

    pub fn describe(&self, public_name: &str) -> Option<ModelInfo> {
        let name = self.public_name(public_name);
        self.known_models()
            .into_iter()
            .find(|model| model.display_name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alias_resolution_strips_prefix() {
        let table = ModelTable::new();
        assert_eq!(table.upstream_id("gemini-2.0-flash-exp"), "assist-flash");
        assert_eq!(table.upstream_id("models/gemini-2.5-pro"), "assist-pro");
    }

    #[test]
    fn unknown_names_pass_through() {
        let table = ModelTable::new();
        assert_eq!(table.upstream_id("future-model"), "future-model");
        assert_eq!(table.upstream_id("models/future-model"), "future-model");
    }

    #[test]
    fn describe_known_model() {
        let table = ModelTable::new();
        let info = table.describe("models/gemini-2.0-flash-exp").unwrap();
        assert_eq!(info.name, "models/gemini-2.0-flash-exp");
        assert!(table.describe("nope").is_none());
    }
}
