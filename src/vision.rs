use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::error::ServiceError;
use crate::palette::{fallback_result, validate_payload, AnalysisResult};
use crate::settings::{mask_key, Settings};

const PROVIDER: &str = "vision";

/// Judgment rubric sent alongside every photo.
pub const HARMONY_PROMPT: &str = r##"You are a strict fashion colour consultant. Identify the dominant colour of the two main garments in the photo (for example the top and the bottom). Judge the pairing strictly by everyday colour-matching principles (complementary, same family, analogous).

Rules, applied strictly:
1. Complementary pairs (pure red with pure green, pure orange with pure blue, pure yellow with pure purple) are NOT harmonious for everyday wear unless both colours are clearly desaturated.
2. Pairs of two high-saturation colours (bright red with bright yellow, bright blue with bright green) are NOT harmonious.
3. Same-family, analogous and low-saturation pairs are harmonious.
4. Black, white and grey are neutrals and go with any colour.

Look closely at saturation and contrast. A high-saturation clash must be judged not harmonious; a low-saturation similar or analogous pair is harmonious.

If the pairing is not harmonious, propose a concrete replacement colour (keep one garment and change the other). If it is harmonious, keep the original colours.

Answer with this JSON object only, no extra text:
{"dominant_colors": ["#RRGGBB", "#RRGGBB"], "is_harmonious": true or false, "comment": "short assessment", "suggestion_logic": "keep_original" or "suggest_new", "suggested_outfit_description": "English image prompt that describes a model wearing the garments, e.g. A model wearing a red t-shirt and white pants on a white background"}

dominant_colors must be valid hexadecimal CSS colours such as #FF0000, never colour names. Always return the complete object including suggested_outfit_description, and always mention the model in it."##;

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: Vec<ContentPart<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart<'a> {
    Text { text: &'a str },
    ImageUrl { image_url: ImageUrl<'a> },
}

#[derive(Debug, Serialize)]
struct ImageUrl<'a> {
    url: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Option<Vec<ChatChoice>>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: Option<ChatMessageOut>,
}

#[derive(Debug, Deserialize)]
struct ChatMessageOut {
    content: Option<String>,
}

/// Find the first balanced `{...}` span in free text: the earliest `{` that has a
/// matching `}`. Braces inside JSON string literals do not count. One pass.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let first = text.find('{')?;
    let mut open: Vec<usize> = Vec::new();
    let mut best: Option<(usize, usize)> = None;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in text.as_bytes().iter().enumerate().skip(first) {
        if in_string {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => open.push(i),
            b'}' => {
                let Some(start) = open.pop() else { continue };
                if open.is_empty() {
                    // The outermost open brace closed; nothing can start earlier.
                    return Some(&text[start..=i]);
                }
                if !matches!(best, Some((s, _)) if s < start) {
                    best = Some((start, i));
                }
            }
            _ => {}
        }
    }
    best.map(|(start, end)| &text[start..=end])
}

/// Turn the model's raw reply into a result, substituting the default on any
/// soft failure.
pub fn interpret_reply(reply: Option<&str>) -> AnalysisResult {
    let Some(text) = reply.map(str::trim).filter(|t| !t.is_empty()) else {
        warn!("vision reply empty, using default analysis");
        return fallback_result();
    };
    let Some(span) = extract_json_object(text) else {
        warn!("vision reply has no JSON object, using default analysis");
        return fallback_result();
    };
    let value: serde_json::Value = match serde_json::from_str(span) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "vision reply JSON unparsable, using default analysis");
            return fallback_result();
        }
    };
    validate_payload(&value).unwrap_or_else(|| {
        warn!("vision reply lacks a dominant_colors array, using default analysis");
        fallback_result()
    })
}

/// Chat-completions client for the colour-harmony judgment.
#[derive(Clone)]
pub struct VisionClient {
    http: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
}

impl VisionClient {
    pub fn new(http: reqwest::Client, settings: &Settings) -> Self {
        Self {
            http,
            endpoint: settings.vision_endpoint.clone(),
            model: settings.vision_model.clone(),
            api_key: settings.vision_api_key.clone(),
        }
    }

    /// Send the photo with the rubric and return the reply text, if the response
    /// carried any.
    #[instrument(skip(self, data_uri), fields(endpoint = %self.endpoint, model = %self.model))]
    pub async fn complete(&self, data_uri: &str) -> Result<Option<String>, ServiceError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or(ServiceError::MissingCredential(PROVIDER))?;

        let body = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: vec![
                    ContentPart::Text { text: HARMONY_PROMPT },
                    ContentPart::ImageUrl {
                        image_url: ImageUrl { url: data_uri },
                    },
                ],
            }],
            max_tokens: 1000,
        };

        info!(api_key = %mask_key(api_key), "calling vision model");
        let resp = self
            .http
            .post(&self.endpoint)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|source| {
                warn!(error = %source, "vision request failed");
                ServiceError::Unavailable { provider: PROVIDER, source }
            })?;

        let status = resp.status();
        if !status.is_success() {
            warn!(status = status.as_u16(), "vision model returned an error status");
            return Err(ServiceError::Upstream {
                provider: PROVIDER,
                status: status.as_u16(),
            });
        }

        let raw = resp
            .text()
            .await
            .map_err(|source| ServiceError::Unavailable { provider: PROVIDER, source })?;
        let parsed = match serde_json::from_str::<ChatResponse>(&raw) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(error = %e, "vision response is not a chat completion");
                return Ok(None);
            }
        };

        let content = parsed
            .choices
            .unwrap_or_default()
            .into_iter()
            .next()
            .and_then(|c| c.message)
            .and_then(|m| m.content);
        debug!(reply = ?content, "vision reply");
        Ok(content)
    }

    pub async fn analyze(&self, data_uri: &str) -> Result<AnalysisResult, ServiceError> {
        let reply = self.complete(data_uri).await?;
        Ok(interpret_reply(reply.as_deref()))
    }
}
