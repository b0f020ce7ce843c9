//! Q&A extraction and answer generation against chat-completion models.

use crate::error::ProviderError;
use crate::models::{Category, SearchResult};
use crate::traits::{AnswerGenerator, QaGenerator};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use bytes::Bytes;
use regex::Regex;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::OnceLock;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct PageInput {
    pub number: u32,
    pub text: String,
    pub png: Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedPair {
    pub question: String,
    pub answer: String,
    pub category: Category,
    pub page_number: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedAnswer {
    pub answer: String,
    /// 1-based index into the context the model says it relied on.
    pub context_ref: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RawPair {
    #[serde(default)]
    question: String,
    #[serde(default)]
    answer: String,
    #[serde(default)]
    category: Option<String>,
    #[serde(default, alias = "page_number", alias = "pageNumber")]
    page: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawPairs {
    Wrapped {
        #[serde(alias = "qa_pairs", alias = "items")]
        pairs: Vec<RawPair>,
    },
    Bare(Vec<RawPair>),
}

#[derive(Debug, Deserialize)]
struct RawAnswer {
    answer: String,
    #[serde(default, alias = "contextRefIndex", alias = "context_ref_index")]
    context_ref: Option<usize>,
}

fn fence_regex() -> Option<&'static Regex> {
    static FENCE: OnceLock<Option<Regex>> = OnceLock::new();
    FENCE
        .get_or_init(|| Regex::new(r"(?s)```(?:json|JSON)?\s*(.*?)```").ok())
        .as_ref()
}

/// The JSON body of a model reply, without code fences or surrounding prose.
pub fn extract_json_block(raw: &str) -> Option<&str> {
    let unfenced = fence_regex()
        .and_then(|fence| fence.captures(raw))
        .and_then(|captures| captures.get(1))
        .map(|body| body.as_str())
        .unwrap_or(raw);

    let start = unfenced.find(['{', '['])?;
    let end = unfenced.rfind(['}', ']'])?;
    (end >= start).then(|| unfenced[start..=end].trim())
}

/// Parses a model reply into Q&A pairs. Malformed replies yield no pairs.
pub fn parse_pairs(raw: &str) -> Vec<GeneratedPair> {
    let Some(body) = extract_json_block(raw) else {
        warn!("model reply contained no json");
        return Vec::new();
    };

    let parsed = match serde_json::from_str::<RawPairs>(body) {
        Ok(RawPairs::Wrapped { pairs }) | Ok(RawPairs::Bare(pairs)) => pairs,
        Err(error) => {
            warn!(%error, "model reply was not a q&a list");
            return Vec::new();
        }
    };

    parsed
        .into_iter()
        .filter_map(|pair| {
            let question = pair.question.trim().to_string();
            let answer = pair.answer.trim().to_string();
            if question.is_empty() || answer.is_empty() {
                return None;
            }
            Some(GeneratedPair {
                question,
                answer,
                category: pair
                    .category
                    .as_deref()
                    .map(Category::from_label)
                    .unwrap_or(Category::Other),
                page_number: pair.page,
            })
        })
        .collect()
}

pub fn parse_answer(raw: &str) -> Result<GeneratedAnswer, ProviderError> {
    if let Some(body) = extract_json_block(raw) {
        if let Ok(parsed) = serde_json::from_str::<RawAnswer>(body) {
            let answer = parsed.answer.trim().to_string();
            if !answer.is_empty() {
                return Ok(GeneratedAnswer {
                    answer,
                    context_ref: parsed.context_ref.filter(|index| *index > 0),
                });
            }
        }
    }

    let plain = raw.trim();
    if plain.is_empty() {
        return Err(ProviderError::MalformedOutput("empty answer".to_string()));
    }
    Ok(GeneratedAnswer {
        answer: plain.to_string(),
        context_ref: None,
    })
}

fn qa_system_prompt() -> String {
    let categories = Category::ALL
        .iter()
        .map(Category::as_str)
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "You turn customer-support source material into FAQ entries. \
         Write questions the way a customer would ask them and answers a support agent could send verbatim. \
         Use only facts present in the material. \
         Respond with JSON: {{\"pairs\": [{{\"question\": str, \"answer\": str, \"category\": one of [{categories}], \"page\": int or null}}]}}. \
         Return {{\"pairs\": []}} when the material has nothing a customer would ask about."
    )
}

const ANSWER_SYSTEM_PROMPT: &str = "You are a customer-support assistant. \
    Answer the customer's question using the numbered reference entries when they are relevant. \
    Be concise and polite. Do not invent policies. \
    Respond with JSON: {\"answer\": str, \"context_ref\": the number of the entry you relied on most, or null}.";

const DESCRIBE_SYSTEM_PROMPT: &str = "Describe this image for a customer-support knowledge base. \
    Transcribe any visible text exactly, then summarize what the image shows (products, options, prices, instructions). \
    Respond with plain text.";

/// OpenAI-compatible `/chat/completions` client.
pub struct ChatCompletionsClient {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    temperature: f32,
}

impl ChatCompletionsClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
            temperature: 0.2,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    async fn complete(
        &self,
        system: &str,
        user_content: Value,
        json_mode: bool,
    ) -> Result<String, ProviderError> {
        if self.api_key.is_empty() {
            return Err(ProviderError::NotConfigured("chat api key".to_string()));
        }

        let mut body = json!({
            "model": self.model,
            "temperature": self.temperature,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user_content},
            ],
        });
        if json_mode {
            body["response_format"] = json!({"type": "json_object"});
        }

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ProviderError::BackendResponse {
                backend: "chat".to_string(),
                details: response.status().to_string(),
            });
        }

        let payload: Value = response.json().await?;
        let content = payload
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .ok_or_else(|| ProviderError::BackendResponse {
                backend: "chat".to_string(),
                details: "response had no message content".to_string(),
            })?;

        debug!(model = %self.model, chars = content.len(), "chat completion received");
        Ok(content.to_string())
    }
}

fn data_url(mime_type: &str, bytes: &[u8]) -> String {
    format!("data:{mime_type};base64,{}", STANDARD.encode(bytes))
}

#[async_trait]
impl QaGenerator for ChatCompletionsClient {
    async fn generate_from_pages(
        &self,
        file_name: &str,
        pages: &[PageInput],
    ) -> Result<Vec<GeneratedPair>, ProviderError> {
        let mut content = vec![json!({
            "type": "text",
            "text": format!(
                "Document: {file_name}. {} page images follow, each preceded by its page number and extracted text. \
                 Tag every pair with the page it came from.",
                pages.len()
            ),
        })];
        for page in pages {
            content.push(json!({
                "type": "text",
                "text": format!("[page {}]\n{}", page.number, page.text),
            }));
            content.push(json!({
                "type": "image_url",
                "image_url": {"url": data_url("image/png", &page.png)},
            }));
        }

        let reply = self
            .complete(&qa_system_prompt(), Value::Array(content), true)
            .await?;
        Ok(parse_pairs(&reply))
    }

    async fn generate_from_chunk(
        &self,
        file_name: &str,
        text: &str,
        page_hint: Option<u32>,
    ) -> Result<Vec<GeneratedPair>, ProviderError> {
        let location = page_hint
            .map(|page| format!(" (page {page})"))
            .unwrap_or_default();
        let prompt = format!("Document: {file_name}{location}\n\n{text}");

        let reply = self
            .complete(&qa_system_prompt(), Value::String(prompt), true)
            .await?;
        let mut pairs = parse_pairs(&reply);
        for pair in &mut pairs {
            pair.page_number = pair.page_number.or(page_hint);
        }
        Ok(pairs)
    }

    async fn describe_image(
        &self,
        file_name: &str,
        bytes: &[u8],
        mime_type: &str,
    ) -> Result<String, ProviderError> {
        let content = json!([
            {"type": "text", "text": format!("Image file: {file_name}")},
            {"type": "image_url", "image_url": {"url": data_url(mime_type, bytes)}},
        ]);
        let reply = self.complete(DESCRIBE_SYSTEM_PROMPT, content, false).await?;
        let description = reply.trim().to_string();
        if description.is_empty() {
            return Err(ProviderError::MalformedOutput(format!(
                "empty description for {file_name}"
            )));
        }
        Ok(description)
    }
}

#[async_trait]
impl AnswerGenerator for ChatCompletionsClient {
    async fn generate_answer(
        &self,
        question: &str,
        context: &[SearchResult],
    ) -> Result<GeneratedAnswer, ProviderError> {
        let references = context
            .iter()
            .enumerate()
            .map(|(index, item)| {
                format!("[{}] Q: {}\nA: {}", index + 1, item.question, item.answer)
            })
            .collect::<Vec<_>>()
            .join("\n\n");
        let prompt = if references.is_empty() {
            format!("Customer question: {question}")
        } else {
            format!("Reference entries:\n{references}\n\nCustomer question: {question}")
        };

        let reply = self
            .complete(ANSWER_SYSTEM_PROMPT, Value::String(prompt), true)
            .await?;
        parse_answer(&reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapped_pairs_are_parsed_and_categories_constrained() {
        let reply = r#"{"pairs": [
            {"question": "How long is delivery?", "answer": "Two days.", "category": "Delivery", "page": 2},
            {"question": "Do you ship abroad?", "answer": "No.", "category": "spaceflight"}
        ]}"#;
        let pairs = parse_pairs(reply);
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].category, Category::Shipping);
        assert_eq!(pairs[0].page_number, Some(2));
        assert_eq!(pairs[1].category, Category::Other);
        assert_eq!(pairs[1].page_number, None);
    }

    #[test]
    fn fenced_bare_arrays_are_accepted() {
        let reply = "Here you go:\n```json\n[{\"question\": \"Q?\", \"answer\": \"A.\", \"category\": \"payment\", \"pageNumber\": 4}]\n```";
        let pairs = parse_pairs(reply);
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].category, Category::Payment);
        assert_eq!(pairs[0].page_number, Some(4));
    }

    #[test]
    fn malformed_replies_yield_no_pairs() {
        assert!(parse_pairs("I could not find anything.").is_empty());
        assert!(parse_pairs("{\"pairs\": [ {\"question\": ").is_empty());
        assert!(parse_pairs("{\"unexpected\": true}").is_empty());
    }

    #[test]
    fn blank_pairs_are_dropped() {
        let reply = r#"[{"question": "  ", "answer": "A"}, {"question": "Q", "answer": ""}]"#;
        assert!(parse_pairs(reply).is_empty());
    }

    #[test]
    fn answers_keep_positive_context_refs() -> Result<(), ProviderError> {
        let parsed = parse_answer(r#"{"answer": "Yes, within 30 days.", "context_ref": 2}"#)?;
        assert_eq!(parsed.context_ref, Some(2));

        let zero = parse_answer(r#"{"answer": "Yes.", "context_ref": 0}"#)?;
        assert_eq!(zero.context_ref, None);

        let plain = parse_answer("Yes, you can.")?;
        assert_eq!(plain.answer, "Yes, you can.");
        assert_eq!(plain.context_ref, None);

        assert!(parse_answer("   ").is_err());
        Ok(())
    }

    #[tokio::test]
    async fn client_without_key_is_not_configured() {
        let client = ChatCompletionsClient::new("http://localhost:1", "", "gpt-4o-mini");
        let result = client.generate_from_chunk("faq.txt", "text", None).await;
        assert!(matches!(result, Err(ProviderError::NotConfigured(_))));
    }
}
