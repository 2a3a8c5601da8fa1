use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Shown for any colour that cannot be resolved.
pub const PLACEHOLDER_HEX: &str = "#CCCCCC";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionLogic {
    KeepOriginal,
    SuggestNew,
}

impl SuggestionLogic {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "keep_original" => Some(Self::KeepOriginal),
            "suggest_new" => Some(Self::SuggestNew),
            _ => None,
        }
    }
}

/// Harmony verdict for one outfit photo.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalysisResult {
    /// Always exactly two `#RRGGBB` values once normalized.
    pub dominant_colors: Vec<String>,
    pub is_harmonious: bool,
    pub comment: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion_logic: Option<SuggestionLogic>,
    pub suggested_outfit_description: String,
    /// Set when the provider reply was unusable and the canned default was substituted.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub fallback: bool,
}

static COLOR_NAMES: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("红色", "#FF0000"),
        ("绿色", "#008000"),
        ("蓝色", "#0000FF"),
        ("黄色", "#FFFF00"),
        ("紫色", "#800080"),
        ("橙色", "#FFA500"),
        ("黑色", "#000000"),
        ("白色", "#FFFFFF"),
        ("灰色", "#808080"),
        ("粉色", "#FFC0CB"),
        ("棕色", "#A52A2A"),
        ("青色", "#00FFFF"),
        ("品红", "#FF00FF"),
        ("red", "#FF0000"),
        ("green", "#008000"),
        ("blue", "#0000FF"),
        ("yellow", "#FFFF00"),
        ("purple", "#800080"),
        ("orange", "#FFA500"),
        ("black", "#000000"),
        ("white", "#FFFFFF"),
        ("gray", "#808080"),
        ("grey", "#808080"),
        ("pink", "#FFC0CB"),
        ("brown", "#A52A2A"),
        ("cyan", "#00FFFF"),
        ("magenta", "#FF00FF"),
    ])
});

fn is_hex_color(s: &str) -> bool {
    let b = s.as_bytes();
    b.len() == 7 && b[0] == b'#' && b[1..].iter().all(u8::is_ascii_hexdigit)
}

fn find_embedded_hex(s: &str) -> Option<&str> {
    let b = s.as_bytes();
    (0..b.len()).find_map(|i| {
        let end = i + 7;
        (b[i] == b'#' && end <= b.len() && b[i + 1..end].iter().all(u8::is_ascii_hexdigit))
            .then(|| &s[i..end])
    })
}

/// Resolve a colour the model reported to `#RRGGBB`. Unknown names become the
/// placeholder; nothing here fails.
pub fn normalize_color(raw: &str) -> String {
    let trimmed = raw.trim();
    if is_hex_color(trimmed) {
        return trimmed.to_string();
    }
    if let Some(hex) = find_embedded_hex(trimmed) {
        return hex.to_string();
    }
    let key = trimmed.to_lowercase();
    COLOR_NAMES
        .get(key.as_str())
        .copied()
        .unwrap_or(PLACEHOLDER_HEX)
        .to_string()
}

/// Normalize every entry and force the list to exactly two colours.
pub fn normalize_colors(values: &[Value]) -> Vec<String> {
    let mut out: Vec<String> = values
        .iter()
        .take(2)
        .map(|v| match v.as_str() {
            Some(s) => normalize_color(s),
            None => PLACEHOLDER_HEX.to_string(),
        })
        .collect();
    out.resize(2, PLACEHOLDER_HEX.to_string());
    out
}

/// Apply the required-field check to a parsed reply. `None` means the caller should
/// fall back.
pub fn validate_payload(value: &Value) -> Option<AnalysisResult> {
    let colors = value.get("dominant_colors")?.as_array()?;
    let defaults = fallback_result();
    let text = |key: &str| {
        value
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    Some(AnalysisResult {
        dominant_colors: normalize_colors(colors),
        is_harmonious: value
            .get("is_harmonious")
            .and_then(Value::as_bool)
            .unwrap_or(true),
        comment: text("comment").unwrap_or(defaults.comment),
        suggestion_logic: value
            .get("suggestion_logic")
            .and_then(Value::as_str)
            .and_then(SuggestionLogic::parse),
        suggested_outfit_description: text("suggested_outfit_description")
            .unwrap_or(defaults.suggested_outfit_description),
        fallback: false,
    })
}

/// The canned answer used whenever the provider reply cannot be interpreted.
pub fn fallback_result() -> AnalysisResult {
    AnalysisResult {
        dominant_colors: vec![normalize_color("蓝色"), normalize_color("白色")],
        is_harmonious: true,
        comment: "Detected blue and white; the overall palette is harmonious.".to_string(),
        suggestion_logic: Some(SuggestionLogic::KeepOriginal),
        suggested_outfit_description:
            "A model wearing a blue top and white trousers, standing against a plain white background"
                .to_string(),
        fallback: true,
    }
}

impl AnalysisResult {
    /// Re-run colour normalization, e.g. on a result received from a remote server.
    pub fn normalized(mut self) -> Self {
        let values: Vec<Value> = self
            .dominant_colors
            .iter()
            .cloned()
            .map(Value::String)
            .collect();
        self.dominant_colors = normalize_colors(&values);
        self
    }
}
